//! Multi-client chat relay over newline-delimited JSON.
//!
//! A single TCP server accepts many clients, tracks the ones that completed a
//! handshake, and relays each client's chat lines to every other client. The
//! crate also ships the terminal client that speaks the same protocol.
//!
//! - [`envelope`] defines the wire values (`hello`, chat lines, system notices).
//! - [`codec`] frames a byte stream into lines and encodes envelopes as JSON.
//! - [`registry`] keeps the shared table of active sessions behind one lock.
//! - [`dispatch`] fans a message out to a registry snapshot, isolating
//!   recipients from each other's failures.
//! - [`session`] runs the per-connection handshake, relay and teardown.
//! - [`server`] accepts connections and closes live sessions on shutdown.
//! - [`client`] is the interactive counterpart with separate send and
//!   receive activities.
//! - [`cli`] parses the command line for both modes.
//!
//! There is no authentication or encryption: display names are self-reported
//! and traffic is plaintext TCP.

pub mod cli;
pub mod client;
pub mod codec;
pub mod dispatch;
pub mod envelope;
pub mod registry;
pub mod server;
pub mod session;
