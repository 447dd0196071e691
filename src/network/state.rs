//! State koneksi client dan state agregat server
//!
//! Dua enum ini adalah satu-satunya sinyal kegagalan terstruktur yang
//! dipublikasikan. Equality sengaja kasar: dua `Error` selalu sama apa pun
//! penyebabnya. Penyebab asli dibaca lewat `cause()` saat transisi terjadi.

use std::fmt;
use std::sync::Arc;

use crate::core::{StateCell, Subscription};
use crate::error::{Error, Result};

/// Lifecycle satu koneksi client
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error(Arc<Error>),
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Error(_) => "error",
        }
    }

    /// Penyebab jika state ini `Error`
    pub fn cause(&self) -> Option<&Arc<Error>> {
        match self {
            Self::Error(cause) => Some(cause),
            _ => None,
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl PartialEq for ConnectionState {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for ConnectionState {}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(cause) => write!(f, "error({cause})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Input untuk state machine client
#[derive(Debug)]
pub enum ConnectionEvent {
    ConnectRequested,
    Established,
    ConnectFailed(Error),
    DisconnectRequested,
    Closed,
    IoError(Error),
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectRequested => "connect requested",
            Self::Established => "established",
            Self::ConnectFailed(_) => "connect failed",
            Self::DisconnectRequested => "disconnect requested",
            Self::Closed => "closed",
            Self::IoError(_) => "io error",
        }
    }
}

/// State machine satu koneksi client
///
/// Hanya dipakai dari serial context client. Setiap transisi yang valid
/// langsung dipublikasikan ke observable.
pub struct ConnectionStateMachine {
    current: ConnectionState,
    cell: StateCell<ConnectionState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            current: ConnectionState::Disconnected,
            cell: StateCell::new(ConnectionState::Disconnected),
        }
    }

    #[inline(always)]
    pub fn current(&self) -> &ConnectionState {
        &self.current
    }

    /// Observable yang bisa dibaca dari thread lain
    pub fn cell(&self) -> StateCell<ConnectionState> {
        self.cell.clone()
    }

    pub fn subscribe(&self) -> Subscription<ConnectionState> {
        self.cell.subscribe()
    }

    /// Terapkan event. Transisi yang tidak valid ditolak dan state tidak berubah.
    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (&self.current, event) {
            (S::Disconnected | S::Error(_), E::ConnectRequested) => S::Connecting,
            (S::Connecting, E::Established) => S::Connected,
            (S::Connecting, E::ConnectFailed(cause)) => S::Error(Arc::new(cause)),
            (S::Connecting | S::Connected | S::Error(_), E::DisconnectRequested) => {
                S::Disconnecting
            }
            (S::Connected | S::Error(_) | S::Disconnecting, E::Closed) => S::Disconnected,
            (_, E::IoError(cause)) => S::Error(Arc::new(cause)),
            (from, event) => {
                return Err(Error::InvalidTransition {
                    from: from.name(),
                    event: event.name(),
                })
            }
        };

        tracing::debug!(from = self.current.name(), to = next.name(), "connection state");
        self.current = next.clone();
        self.cell.publish(next.clone());
        Ok(next)
    }
}

/// State agregat server
#[derive(Debug, Clone)]
pub enum ServerListeningState {
    Off,
    Listening,
    ActiveConnections,
    ShuttingDown,
    Error(Arc<Error>),
}

impl ServerListeningState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Listening => "listening",
            Self::ActiveConnections => "active connections",
            Self::ShuttingDown => "shutting down",
            Self::Error(_) => "error",
        }
    }

    pub fn cause(&self) -> Option<&Arc<Error>> {
        match self {
            Self::Error(cause) => Some(cause),
            _ => None,
        }
    }

    /// Fungsi murni dari (listener bound, jumlah koneksi, shutdown, error terakhir)
    pub fn derive(
        bound: bool,
        connections: usize,
        shutting_down: bool,
        last_error: Option<&Arc<Error>>,
    ) -> Self {
        if shutting_down {
            Self::ShuttingDown
        } else if let Some(cause) = last_error {
            Self::Error(Arc::clone(cause))
        } else if !bound {
            Self::Off
        } else if connections > 0 {
            Self::ActiveConnections
        } else {
            Self::Listening
        }
    }
}

impl PartialEq for ServerListeningState {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for ServerListeningState {}

impl fmt::Display for ServerListeningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(cause) => write!(f, "error({cause})"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn refused() -> Error {
        Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused))
    }

    #[test]
    fn test_happy_path() {
        let mut sm = ConnectionStateMachine::new();
        let sub = sm.subscribe();

        sm.apply(ConnectionEvent::ConnectRequested).unwrap();
        sm.apply(ConnectionEvent::Established).unwrap();
        sm.apply(ConnectionEvent::DisconnectRequested).unwrap();
        sm.apply(ConnectionEvent::Closed).unwrap();

        let seen: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(
            seen,
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[test]
    fn test_peer_close_from_connected() {
        let mut sm = ConnectionStateMachine::new();
        sm.apply(ConnectionEvent::ConnectRequested).unwrap();
        sm.apply(ConnectionEvent::Established).unwrap();
        assert_eq!(
            sm.apply(ConnectionEvent::Closed).unwrap(),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_connect_failure_keeps_cause() {
        let mut sm = ConnectionStateMachine::new();
        sm.apply(ConnectionEvent::ConnectRequested).unwrap();
        let state = sm.apply(ConnectionEvent::ConnectFailed(refused())).unwrap();

        assert!(state.is_error());
        let cause = state.cause().unwrap();
        assert!(matches!(&**cause, Error::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_error_equality_is_coarse() {
        let a = ConnectionState::Error(Arc::new(refused()));
        let b = ConnectionState::Error(Arc::new(Error::TornDown));
        assert_eq!(a, b);
        assert_ne!(a, ConnectionState::Disconnected);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut sm = ConnectionStateMachine::new();
        let sub = sm.subscribe();
        let _ = sub.try_recv();

        assert!(matches!(
            sm.apply(ConnectionEvent::Established),
            Err(Error::InvalidTransition { from: "disconnected", .. })
        ));
        assert!(sm.apply(ConnectionEvent::DisconnectRequested).is_err());
        assert!(sm.apply(ConnectionEvent::Closed).is_err());

        sm.apply(ConnectionEvent::ConnectRequested).unwrap();
        assert!(sm.apply(ConnectionEvent::ConnectRequested).is_err());

        assert_eq!(sm.current(), &ConnectionState::Connecting);
        assert_eq!(sub.try_recv(), Some(ConnectionState::Connecting));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_io_error_needs_close_to_reach_disconnected() {
        let mut sm = ConnectionStateMachine::new();
        sm.apply(ConnectionEvent::ConnectRequested).unwrap();
        sm.apply(ConnectionEvent::Established).unwrap();
        sm.apply(ConnectionEvent::IoError(refused())).unwrap();
        assert!(sm.current().is_error());

        // Error hanya bisa keluar lewat connect, disconnect atau close
        assert!(sm.apply(ConnectionEvent::Established).is_err());
        assert_eq!(
            sm.apply(ConnectionEvent::Closed).unwrap(),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_reconnect_from_error() {
        let mut sm = ConnectionStateMachine::new();
        sm.apply(ConnectionEvent::ConnectRequested).unwrap();
        sm.apply(ConnectionEvent::ConnectFailed(refused())).unwrap();
        assert_eq!(
            sm.apply(ConnectionEvent::ConnectRequested).unwrap(),
            ConnectionState::Connecting
        );
    }

    #[test]
    fn test_server_state_derivation() {
        let cause = Arc::new(Error::TornDown);
        use ServerListeningState as S;

        assert_eq!(S::derive(false, 0, false, None), S::Off);
        assert_eq!(S::derive(true, 0, false, None), S::Listening);
        assert_eq!(S::derive(true, 3, false, None), S::ActiveConnections);
        assert_eq!(S::derive(true, 3, false, Some(&cause)), S::Error(cause.clone()));
        assert_eq!(S::derive(true, 3, true, Some(&cause)), S::ShuttingDown);
        // Koneksi tetap hidup setelah stop listening
        assert_eq!(S::derive(false, 2, false, None), S::Off);
    }
}
