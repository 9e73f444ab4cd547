//! Tunnel Registry (C3).
//!
//! One instance per WebSocket connection, owned exclusively by that
//! connection's task — so, unlike the account store, this needs no
//! interior synchronization at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

pub struct Tunnel {
    pub id: u8,
    pub socket: Arc<UdpSocket>,
    pub remote_endpoint: String,
    /// The C9 downstream task reading this tunnel's UDP socket. Aborted
    /// when the tunnel is closed or reaped.
    downstream: JoinHandle<()>,
    last_activity: Instant,
}

impl Tunnel {
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.downstream.abort();
    }
}

pub struct TunnelRegistry {
    tunnels: HashMap<u8, Tunnel>,
    next_id: u8,
    /// The id of the first tunnel ever created on this connection — never
    /// idle-reaped (§4.3).
    first_id: Option<u8>,
    max_tunnels: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tunnel cap reached ({0} tunnels)")]
    CapReached(usize),
    #[error("tunnel ids exhausted (256 tunnels already created on this connection)")]
    IdsExhausted,
}

impl TunnelRegistry {
    pub fn new(max_tunnels: usize) -> Self {
        Self {
            tunnels: HashMap::new(),
            next_id: 1,
            first_id: None,
            max_tunnels,
        }
    }

    /// Allocates the next id (starting at 1), inserts the mapping, and
    /// records the current time as its last activity. The id must be known
    /// before the C9 downstream task can frame outgoing datagrams, so the
    /// caller supplies a `spawn_downstream` closure invoked with the
    /// allocated id rather than a pre-spawned handle.
    pub fn create<F>(
        &mut self,
        socket: Arc<UdpSocket>,
        remote_endpoint: String,
        spawn_downstream: F,
    ) -> Result<u8, RegistryError>
    where
        F: FnOnce(u8) -> JoinHandle<()>,
    {
        if self.tunnels.len() >= self.max_tunnels {
            return Err(RegistryError::CapReached(self.max_tunnels));
        }
        if self.next_id == 0 {
            return Err(RegistryError::IdsExhausted);
        }

        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(0);
        let downstream = spawn_downstream(id);

        self.tunnels.insert(
            id,
            Tunnel {
                id,
                socket,
                remote_endpoint,
                downstream,
                last_activity: Instant::now(),
            },
        );
        if self.first_id.is_none() {
            self.first_id = Some(id);
        }
        Ok(id)
    }

    pub fn lookup(&self, id: u8) -> Option<&Tunnel> {
        self.tunnels.get(&id)
    }

    pub fn lookup_mut(&mut self, id: u8) -> Option<&mut Tunnel> {
        self.tunnels.get_mut(&id)
    }

    pub fn touch(&mut self, id: u8) {
        if let Some(tunnel) = self.tunnels.get_mut(&id) {
            tunnel.touch();
        }
    }

    /// Removes the mapping (and drops the socket, closing it).
    pub fn close(&mut self, id: u8) -> Option<Tunnel> {
        self.tunnels.remove(&id)
    }

    /// Closes every tunnel idle for longer than `timeout`, excluding the
    /// first-created tunnel, and returns the closed ids so the caller can
    /// emit `CLOSE ID` frames.
    pub fn reap_idle(&mut self, timeout: Duration) -> Vec<u8> {
        let first = self.first_id;
        let stale: Vec<u8> = self
            .tunnels
            .values()
            .filter(|t| Some(t.id) != first && t.idle_for() > timeout)
            .map(|t| t.id)
            .collect();
        for id in &stale {
            self.tunnels.remove(id);
        }
        stale
    }

    pub fn size(&self) -> usize {
        self.tunnels.len()
    }

    pub fn first_id(&self) -> Option<u8> {
        self.first_id
    }

    /// True once only the first tunnel (or none) remains — the idle reaper
    /// can be cancelled at this point (§4.8).
    pub fn only_first_remains(&self) -> bool {
        self.tunnels.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn dummy_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    fn dummy_downstream(_id: u8) -> JoinHandle<()> {
        tokio::spawn(std::future::pending::<()>())
    }

    async fn create(registry: &mut TunnelRegistry) -> Result<u8, RegistryError> {
        registry.create(dummy_socket().await, "a:1".into(), dummy_downstream)
    }

    #[tokio::test]
    async fn ids_assigned_monotonically_from_one() {
        let mut registry = TunnelRegistry::new(10);
        let id1 = create(&mut registry).await.unwrap();
        let id2 = create(&mut registry).await.unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(registry.first_id(), Some(1));
    }

    #[tokio::test]
    async fn cap_enforced() {
        let mut registry = TunnelRegistry::new(2);
        create(&mut registry).await.unwrap();
        create(&mut registry).await.unwrap();
        assert!(matches!(
            create(&mut registry).await,
            Err(RegistryError::CapReached(2))
        ));
    }

    #[tokio::test]
    async fn reap_excludes_first_tunnel() {
        let mut registry = TunnelRegistry::new(10);
        let first = create(&mut registry).await.unwrap();
        let second = create(&mut registry).await.unwrap();

        // Simulate both tunnels being idle by rewinding their clocks is not
        // directly possible with Instant, so we reap with a zero timeout
        // instead — both are "idle" for any positive duration since creation.
        let reaped = registry.reap_idle(Duration::from_nanos(0));
        assert_eq!(reaped, vec![second]);
        assert!(registry.lookup(first).is_some());
        assert!(registry.lookup(second).is_none());
    }

    #[tokio::test]
    async fn only_first_remains_after_reap() {
        let mut registry = TunnelRegistry::new(10);
        create(&mut registry).await.unwrap();
        create(&mut registry).await.unwrap();
        assert!(!registry.only_first_remains());
        registry.reap_idle(Duration::from_nanos(0));
        assert!(registry.only_first_remains());
    }
}
