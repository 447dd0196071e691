//! Client identity untuk koneksi server-side

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::IdentityPolicy;

/// Identitas satu koneksi di registry server
///
/// Token UUID v4 (default) atau nama dari aplikasi. Unik di antara koneksi
/// yang masih hidup dalam satu registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    Token(Uuid),
    Named(Arc<str>),
}

impl ClientIdentity {
    /// Token acak baru
    pub fn generate() -> Self {
        Self::Token(Uuid::new_v4())
    }

    pub fn named(name: impl AsRef<str>) -> Self {
        Self::Named(Arc::from(name.as_ref()))
    }

    pub fn is_named(&self) -> bool {
        matches!(self, Self::Named(_))
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(uuid) => write!(f, "{uuid}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl From<&str> for ClientIdentity {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl IdentityPolicy {
    /// Buat identitas untuk koneksi dari `peer`
    pub(crate) fn mint(&self, peer: Option<SocketAddr>) -> ClientIdentity {
        match (self, peer) {
            (Self::Named(name_for), Some(addr)) => ClientIdentity::named(name_for(addr)),
            _ => ClientIdentity::generate(),
        }
    }
}
