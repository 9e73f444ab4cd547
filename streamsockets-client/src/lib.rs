//! StreamSockets client library: forwards local UDP datagrams over a
//! WebSocket tunnel. Split into a library target so integration tests can
//! drive the datagram engine and carrier directly, mirroring
//! `nomadflow-server`'s `lib.rs` + `tests/` shape.

pub mod app;
pub mod carrier;
pub mod config;
pub mod engine;
pub mod liveness;
pub mod metrics;
pub mod retry;
pub mod udp;
