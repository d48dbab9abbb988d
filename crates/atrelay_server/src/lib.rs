//! atrelay server - the IRC face of the bridge
//!
//! Accepts plain-TCP IRC clients, runs one [`Session`] per connection and
//! fans newly synced timeline posts out to all of them.

pub mod codec;
pub mod commands;
pub mod error;
pub mod message;
pub mod server;
pub mod session;

pub use error::{Result, ServerError};
pub use server::{BridgeServer, ServerContext};
pub use session::{Session, SessionEvent, SessionSettings};
