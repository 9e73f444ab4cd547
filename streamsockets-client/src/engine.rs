//! Client Datagram Engine (C5).
//!
//! An explicit state-machine struct driven by a loop that consumes
//! messages from a single inbox channel (UDP packet, carrier event, timer
//! tick) rather than scattered callbacks. All connection state —
//! tunnel-id maps, pending-grant queue, retry/liveness state — is owned
//! exclusively by this loop, so none of it needs locking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use streamsockets_protocol::{ControlFrame, DataFrame, RESERVED_TUNNEL_ID};

use crate::carrier::{self, CarrierHandle};
use crate::config::Config;
use crate::liveness::LivenessMonitor;
use crate::metrics;
use crate::retry::RetryController;

/// The old protocol carries no tunnel id byte and supports exactly one
/// tunnel per connection; this is the id used internally to address it
/// through the same registry-shaped maps the new protocol uses.
pub const OLD_PROTOCOL_TUNNEL_ID: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Connecting,
    Ready,
    Backoff,
}

pub enum CarrierEvent {
    Ready(CarrierHandle),
    Data(u8, Bytes),
    SocketId(u8),
    CloseId(u8),
    Pong,
}

pub enum EngineEvent {
    Udp(SocketAddr, Bytes),
    Carrier(u64, CarrierEvent),
    CarrierEnded(u64),
}

struct QueuedFrame {
    sender: SocketAddr,
    /// `0` (the reserved/placeholder id, §9) until a grant rewrites it.
    tunnel_id: u8,
    payload: Bytes,
}

pub struct Engine {
    config: Arc<Config>,
    local_socket: Arc<UdpSocket>,
    inbox: mpsc::UnboundedReceiver<EngineEvent>,
    inbox_tx: mpsc::UnboundedSender<EngineEvent>,
    shutdown: watch::Receiver<bool>,

    state: ConnState,
    epoch: u64,
    retry: RetryController,
    liveness: LivenessMonitor,
    carrier: Option<CarrierHandle>,
    reconnect_at: Option<tokio::time::Instant>,
    session_started_at: Instant,

    endpoint_to_tunnel: HashMap<SocketAddr, u8>,
    tunnel_to_endpoint: HashMap<u8, SocketAddr>,
    default_endpoint: Option<SocketAddr>,
    first_tunnel_id: Option<u8>,
    pending_new_order: VecDeque<SocketAddr>,
    pending_senders: HashSet<SocketAddr>,
    queue: VecDeque<QueuedFrame>,

    last_udp_packet: Instant,
}

impl Engine {
    pub fn new(config: Arc<Config>, local_socket: Arc<UdpSocket>, shutdown: watch::Receiver<bool>) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let retry = RetryController::new(
            Duration::from_secs(config.retry_initial_delay_seconds),
            Duration::from_secs(config.retry_max_delay_seconds),
        );
        Self {
            config,
            local_socket,
            inbox,
            inbox_tx,
            shutdown,
            state: ConnState::Init,
            epoch: 0,
            retry,
            liveness: LivenessMonitor::new(),
            carrier: None,
            reconnect_at: None,
            session_started_at: Instant::now(),
            endpoint_to_tunnel: HashMap::new(),
            tunnel_to_endpoint: HashMap::new(),
            default_endpoint: None,
            first_tunnel_id: None,
            pending_new_order: VecDeque::new(),
            pending_senders: HashSet::new(),
            queue: VecDeque::new(),
            last_udp_packet: Instant::now(),
        }
    }

    /// A sender for the UDP listener tasks to deliver inbound datagrams on
    /// (the `onUdp` ingress of §4.5's public contract).
    pub fn inbox_sender(&self) -> mpsc::UnboundedSender<EngineEvent> {
        self.inbox_tx.clone()
    }

    /// `start()`: kick off the first connect attempt and run until
    /// shutdown (`close()` is modeled as the shutdown watch firing).
    pub async fn run(mut self) {
        self.connect();

        let mut ping_interval = tokio::time::interval(Duration::from_millis(self.config.ping_interval_millis));
        let mut stale_check = tokio::time::interval(Duration::from_secs(1));
        let mut udp_inactivity_check = tokio::time::interval(Duration::from_secs(10));

        loop {
            let reconnect_sleep = async {
                match self.reconnect_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    info!("datagram engine shutting down");
                    self.release_queue();
                    return;
                }

                Some(event) = self.inbox.recv() => {
                    self.on_event(event);
                }

                _ = ping_interval.tick() => {
                    if self.state == ConnState::Ready {
                        self.send_ping();
                    }
                }

                _ = stale_check.tick() => {
                    if self.state == ConnState::Ready {
                        let timeout = Duration::from_millis(self.config.ping_timeout_millis);
                        if self.liveness.check_stale(timeout) {
                            warn!(epoch = self.epoch, "pong staleness exceeded max failures, closing carrier");
                            self.on_carrier_lost();
                        }
                    }
                    self.flush_ready();
                }

                _ = udp_inactivity_check.tick() => {
                    let timeout = Duration::from_secs(self.config.udp_timeout);
                    if self.state == ConnState::Ready && self.last_udp_packet.elapsed() > timeout {
                        info!(epoch = self.epoch, "local udp inactive, closing carrier");
                        self.on_carrier_lost();
                    }
                }

                _ = reconnect_sleep => {
                    self.reconnect_at = None;
                    self.connect();
                }
            }
        }
    }

    fn on_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Udp(sender, payload) => self.on_udp(sender, payload),
            EngineEvent::Carrier(epoch, event) => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "dropping stale carrier event");
                    return;
                }
                self.on_carrier_event(event);
            }
            EngineEvent::CarrierEnded(epoch) => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "dropping stale carrier-ended event");
                    return;
                }
                self.on_carrier_lost();
            }
        }
    }

    // ---- connect / reconnect -------------------------------------------------

    fn connect(&mut self) {
        self.epoch += 1;
        self.state = ConnState::Connecting;
        self.carrier = None;
        self.session_started_at = Instant::now();
        let config = Arc::clone(&self.config);
        let epoch = self.epoch;
        let events = self.inbox_tx.clone();
        tokio::spawn(carrier::run(config, epoch, events));
    }

    fn on_carrier_event(&mut self, event: CarrierEvent) {
        match event {
            CarrierEvent::Ready(handle) => {
                self.carrier = Some(handle);
                self.state = ConnState::Ready;
                self.retry.reset();
                self.liveness.reset();
                metrics::connection_opened(&self.config.route);
                info!(epoch = self.epoch, "carrier authenticated, engine ready");
                self.flush_ready();
            }
            CarrierEvent::Data(tunnel_id, payload) => self.on_carrier_data(tunnel_id, payload),
            CarrierEvent::SocketId(id) => self.on_socket_id(id),
            CarrierEvent::CloseId(id) => self.on_close_id(id),
            CarrierEvent::Pong => self.liveness.on_pong(),
        }
    }

    fn on_carrier_lost(&mut self) {
        self.reset_session_state();

        if self.config.exit_on_failure {
            warn!("carrier failed and EXIT_ON_FAILURE is set, exiting process");
            std::process::exit(1);
        }

        self.state = ConnState::Backoff;
        let delay = self.retry.next_delay();
        self.reconnect_at = Some(tokio::time::Instant::now() + delay);
    }

    fn reset_session_state(&mut self) {
        if self.state == ConnState::Ready {
            metrics::connection_closed(&self.config.route, self.session_started_at.elapsed());
        }
        self.carrier = None;
        self.endpoint_to_tunnel.clear();
        self.tunnel_to_endpoint.clear();
        self.first_tunnel_id = None;
        self.pending_new_order.clear();
        self.pending_senders.clear();
        self.release_queue();
    }

    // ---- inbound carrier frames -----------------------------------------------

    fn on_socket_id(&mut self, id: u8) {
        if self.first_tunnel_id.is_none() {
            self.first_tunnel_id = Some(id);
            if let Some(default) = self.default_endpoint {
                self.bind(default, id);
                self.rewrite_queued(default, id);
            }
            debug!(tunnel_id = id, "first tunnel granted");
            self.flush_ready();
            return;
        }

        match self.pending_new_order.pop_front() {
            Some(sender) => {
                self.pending_senders.remove(&sender);
                self.bind(sender, id);
                self.rewrite_queued(sender, id);
                debug!(tunnel_id = id, ?sender, "tunnel granted for pending sender");
                self.flush_ready();
            }
            None => {
                warn!(tunnel_id = id, "received SOCKET ID grant with no pending NEW request");
            }
        }
    }

    /// Rewrite placeholder-tagged (§9, id 0) queued frames for `sender` now
    /// that it has a real tunnel id, so `flush_ready` can send them.
    fn rewrite_queued(&mut self, sender: SocketAddr, tunnel_id: u8) {
        for entry in self.queue.iter_mut() {
            if entry.tunnel_id == RESERVED_TUNNEL_ID && entry.sender == sender {
                entry.tunnel_id = tunnel_id;
            }
        }
    }

    fn on_close_id(&mut self, id: u8) {
        if let Some(sender) = self.tunnel_to_endpoint.remove(&id) {
            self.endpoint_to_tunnel.remove(&sender);
            info!(tunnel_id = id, ?sender, "tunnel evicted by server");
        }
    }

    fn on_carrier_data(&mut self, tunnel_id: u8, payload: Bytes) {
        let Some(&sender) = self.tunnel_to_endpoint.get(&tunnel_id) else {
            debug!(tunnel_id, "dropping data frame for unknown tunnel id");
            return;
        };
        metrics::bytes_received(&self.config.route, payload.len() as u64);
        let socket = Arc::clone(&self.local_socket);
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&payload, sender).await {
                warn!(error = %e, "failed to deliver datagram to local sender");
            }
        });
    }

    fn bind(&mut self, sender: SocketAddr, tunnel_id: u8) {
        self.endpoint_to_tunnel.insert(sender, tunnel_id);
        self.tunnel_to_endpoint.insert(tunnel_id, sender);
    }

    // ---- inbound local UDP ------------------------------------------------

    fn on_udp(&mut self, sender: SocketAddr, payload: Bytes) {
        self.last_udp_packet = Instant::now();

        if self.default_endpoint.is_none() {
            self.default_endpoint = Some(sender);
            match self.first_tunnel_id {
                Some(id) => {
                    self.bind(sender, id);
                    self.enqueue(sender, id, payload);
                }
                None => self.enqueue(sender, RESERVED_TUNNEL_ID, payload),
            }
            self.flush_ready();
            return;
        }

        if let Some(&id) = self.endpoint_to_tunnel.get(&sender) {
            self.enqueue(sender, id, payload);
            self.flush_ready();
            return;
        }

        // A reconnect clears endpoint_to_tunnel but keeps default_endpoint, so the
        // default sender briefly looks unbound. Route it back through the
        // first-tunnel placeholder path rather than treating it as a new sender,
        // or it ends up stuck at the head of pending_new_order and a later grant
        // for an actually-new sender mis-rebinds the default endpoint.
        if Some(sender) == self.default_endpoint {
            match self.first_tunnel_id {
                Some(id) => {
                    self.bind(sender, id);
                    self.enqueue(sender, id, payload);
                }
                None => self.enqueue(sender, RESERVED_TUNNEL_ID, payload),
            }
            self.flush_ready();
            return;
        }

        if self.config.use_old_protocol {
            self.switch_old_protocol_route(sender, payload);
            return;
        }

        if self.pending_senders.len() + self.endpoint_to_tunnel.len() >= self.config.max_udp_tunnels_per_client {
            warn!(?sender, "local tunnel cap reached, dropping datagram from new sender");
            return;
        }

        if self.pending_senders.insert(sender) {
            self.pending_new_order.push_back(sender);
            self.send_control(ControlFrame::New);
        }
        self.enqueue(sender, RESERVED_TUNNEL_ID, payload);
    }

    /// Old protocol supports exactly one route per connection (§4.5 rule
    /// 5): a second distinct local sender forces a fresh carrier
    /// connection rather than a `NEW` request. Not a failure, so this
    /// bypasses `on_carrier_lost`'s backoff and `EXIT_ON_FAILURE` check.
    fn switch_old_protocol_route(&mut self, sender: SocketAddr, payload: Bytes) {
        info!(?sender, "old protocol: new local sender, reconnecting carrier");
        self.reset_session_state();
        self.default_endpoint = Some(sender);
        self.state = ConnState::Backoff;
        self.reconnect_at = Some(tokio::time::Instant::now());
        self.enqueue(sender, RESERVED_TUNNEL_ID, payload);
    }

    // ---- queue / flush ------------------------------------------------------

    fn enqueue(&mut self, sender: SocketAddr, tunnel_id: u8, payload: Bytes) {
        self.queue.push_back(QueuedFrame {
            sender,
            tunnel_id,
            payload,
        });
    }

    fn flush_ready(&mut self) {
        if self.state != ConnState::Ready {
            return;
        }
        let Some(carrier) = self.carrier.clone() else { return };

        let mut remaining = VecDeque::with_capacity(self.queue.len());
        while let Some(entry) = self.queue.pop_front() {
            if entry.tunnel_id == RESERVED_TUNNEL_ID {
                remaining.push_back(entry);
                continue;
            }
            let message = self.encode_data(entry.tunnel_id, &entry.payload);
            if carrier.try_send(message) {
                metrics::bytes_sent(&self.config.route, entry.payload.len() as u64);
            } else {
                remaining.push_back(entry);
            }
        }
        self.queue = remaining;
    }

    fn encode_data(&self, tunnel_id: u8, payload: &Bytes) -> Message {
        if self.config.use_old_protocol {
            Message::Binary(payload.clone())
        } else {
            Message::Binary(DataFrame::new(tunnel_id, payload.clone()).encode())
        }
    }

    fn send_control(&self, frame: ControlFrame) {
        if let Some(carrier) = &self.carrier {
            carrier.try_send(Message::Text(frame.encode().into()));
        }
    }

    fn send_ping(&self) {
        if let Some(carrier) = &self.carrier {
            carrier.try_send(Message::Ping(Bytes::from_static(b"PING")));
        }
    }

    fn release_queue(&mut self) {
        if !self.queue.is_empty() {
            debug!(count = self.queue.len(), "releasing queued frames on carrier close");
        }
        self.queue.clear();
    }
}
