use std::io;

use thiserror::Error;

use crate::http::Response;

/// Terminal errors surfaced to callers of the client and server APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP side of the handshake was missing or malformed upgrade headers.
    /// Servers answer this with `426 Upgrade Required`.
    #[error("rdv http upgrade error: {0}")]
    Upgrade(String),

    /// The server answered with something other than a valid `101 Switching Protocols`.
    /// The response, with up to 1 KiB of its body, is included for diagnosis.
    #[error("bad http handshake: {reason}")]
    Handshake {
        reason: String,
        response: Option<Box<Response>>,
    },

    /// A peer broke the rdv protocol: bad method, missing token, too many
    /// addresses, speaking out of turn, or a wrong handshake line.
    #[error("rdv protocol error: {0}")]
    Protocol(String),

    /// The attempt ended without any usable connection.
    #[error("no rdv conn chosen")]
    NotChosen,

    /// The rendezvous server is shutting down or already shut down.
    #[error("rdv server closed")]
    ServerClosed,

    /// The rendezvous server URL did not parse or uses an unsupported scheme.
    #[error("bad rdv server url: {0}")]
    Url(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reasons for dropping a candidate address. These never reach the caller:
/// the offending address is logged and skipped, and the attempt continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("bad addr: expected port >=1024")]
    PrivilegedPort,

    #[error("bad addr: invalid addr")]
    InvalidAddr,

    #[error("bad addr: not helpful for connectivity")]
    DontUse,
}
