//! Error taxonomy
//!
//! Kegagalan connect/bind dipublikasikan lewat state `Error(cause)`; kegagalan
//! send hanya di-log. Kegagalan decode punya tipe sendiri (`FrameError`).

use std::io;
use std::net::SocketAddr;

use crate::network::{ChannelId, ClientIdentity};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to resolve {target}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("no address found for {0}")]
    NoAddress(String),

    #[error("connect to {addr} failed")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("bind to {addr} failed")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("close failed")]
    Close(#[source] io::Error),

    #[error("channel {0} is not writable")]
    NotWritable(ChannelId),

    #[error("unknown client identity {0}")]
    UnknownIdentity(ClientIdentity),

    #[error("no client connected")]
    NoClients,

    #[error("client identity {0} is already connected")]
    DuplicateIdentity(ClientIdentity),

    #[error("invalid transition: {event} while {from}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },

    #[error("blocking operation called from inside its own serial context")]
    SerialContext,

    #[error("instance has been shut down")]
    TornDown,

    #[error("transport I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
