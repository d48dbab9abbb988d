use std::net::SocketAddr;

use atrelay_core::CoreError;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ServerError {
    #[error("Failed to bind IRC listener on {addr}")]
    #[diagnostic(
        code(atrelay_server::bind),
        help("Is another process already listening on this port? Try --port")
    )]
    Bind {
        addr: String,
        #[source]
        cause: std::io::Error,
    },

    #[error("Failed to accept connection on {local}")]
    #[diagnostic(code(atrelay_server::accept))]
    Accept {
        local: SocketAddr,
        #[source]
        cause: std::io::Error,
    },

    #[error("Connections did not close within {grace_secs}s of shutdown")]
    #[diagnostic(
        code(atrelay_server::shutdown_timeout),
        help("Remaining connections were abandoned")
    )]
    ShutdownTimeout { grace_secs: u64 },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
