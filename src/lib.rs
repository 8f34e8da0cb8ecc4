//! Reverse HTTP tunneling: a client exposes a locally-running service to the
//! public internet through a rendezvous server.
//!
//! The client opens one outbound control connection to the server, exchanges
//! a JSON handshake, and the server registers it under a subdomain. Every
//! public request for `<subdomain>.<domain>` is forwarded to the client over
//! a multiplexed stream and re-issued against the local service.

pub mod client;
pub mod registry;
pub mod server;
pub mod tunnel;
pub mod ui;
