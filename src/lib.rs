//! devgate - a local development proxy that runs apps on demand
//!
//! Requests for `<name>.<domain>` are routed to the app called `<name>`.
//! The app is started the first time it is needed, kept running while it
//! gets traffic and stopped once it has been idle for a while. HTTPS
//! works out of the box through a local certificate authority that signs
//! a certificate for each hostname during the handshake.

pub mod app;
pub mod certs;
pub mod config;
pub mod error;
pub mod events;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod upstream;
