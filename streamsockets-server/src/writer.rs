//! Dedicated WebSocket writer task: every outbound frame goes through an
//! mpsc channel to a single task, so the connection handler and every
//! tunnel's C9 downstream task never contend on the same sink.

use axum::extract::ws::Message;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Sender half — cloned by the connection handler and every C9 downstream task.
pub type WsSender = mpsc::Sender<Message>;

/// Spawn the writer task. Returns the sender and a `JoinHandle` for cleanup.
pub fn spawn_writer<S>(mut sink: S) -> (WsSender, JoinHandle<()>)
where
    S: SinkExt<Message, Error = axum::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(256);

    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                error!(error = %e, "failed to write frame to WebSocket");
                break;
            }
        }
        debug!("writer task exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}
