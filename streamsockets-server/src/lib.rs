//! StreamSockets server library: bridges authenticated WebSocket tunnels to
//! UDP backends. Split into a library target so integration tests can drive
//! the admission gate, tunnel handler, and account store directly rather
//! than only through the compiled binary, mirroring `nomadflow-server`'s
//! `lib.rs` + `build_router`/`tests/` shape.

pub mod accounts;
pub mod admission;
pub mod app;
pub mod config;
pub mod handler;
pub mod metrics;
pub mod net;
pub mod registry;
pub mod server;
pub mod state;
pub mod udp;
pub mod writer;
