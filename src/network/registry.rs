//! Connection registry server
//!
//! Memiliki semua koneksi yang hidup dan menurunkan `ServerListeningState`
//! dari okupansinya. Hanya disentuh dari serial context server; setiap
//! mutasi langsung mempublikasikan state agregat dan daftar identitas
//! sebelum job yang melakukannya selesai.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use super::identity::ClientIdentity;
use super::state::ServerListeningState;
use super::transport::{Channel, ChannelId};
use crate::core::StateCell;
use crate::error::{Error, Result};

/// Pasangan identitas + handle koneksi
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    identity: ClientIdentity,
    channel: Channel,
}

impl ConnectedClient {
    pub fn new(identity: ClientIdentity, channel: Channel) -> Self {
        Self { identity, channel }
    }

    #[inline(always)]
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    #[inline(always)]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Kirim frame yang sudah di-encode
    #[inline]
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.channel.write(frame)
    }
}

pub struct ConnectionRegistry {
    clients: HashMap<ClientIdentity, ConnectedClient>,
    /// Urutan masuk; elemen terakhir adalah koneksi paling baru
    order: Vec<ClientIdentity>,
    bound: Option<SocketAddr>,
    shutting_down: bool,
    last_error: Option<Arc<Error>>,
    state: StateCell<ServerListeningState>,
    identities: StateCell<Vec<ClientIdentity>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            order: Vec::new(),
            bound: None,
            shutting_down: false,
            last_error: None,
            state: StateCell::new(ServerListeningState::Off),
            identities: StateCell::new(Vec::new()),
        }
    }

    /// Observable state agregat
    pub fn state_cell(&self) -> StateCell<ServerListeningState> {
        self.state.clone()
    }

    /// Observable daftar identitas (urutan koneksi)
    pub fn identities_cell(&self) -> StateCell<Vec<ClientIdentity>> {
        self.identities.clone()
    }

    pub fn state(&self) -> ServerListeningState {
        ServerListeningState::derive(
            self.bound.is_some(),
            self.clients.len(),
            self.shutting_down,
            self.last_error.as_ref(),
        )
    }

    pub fn identities(&self) -> Vec<ClientIdentity> {
        self.order.clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Listener berhasil bind
    pub fn listener_bound(&mut self, addr: SocketAddr) {
        self.bound = Some(addr);
        self.last_error = None;
        self.publish_state();
    }

    /// Listener ditutup; koneksi yang ada tidak disentuh
    pub fn listener_unbound(&mut self) {
        self.bound = None;
        self.last_error = None;
        self.publish_state();
    }

    /// Kegagalan transport (misal bind)
    pub fn record_error(&mut self, cause: Error) {
        self.last_error = Some(Arc::new(cause));
        self.publish_state();
    }

    /// Daftarkan koneksi yang baru di-accept
    pub fn add_connection(&mut self, client: ConnectedClient) -> Result<ClientIdentity> {
        if self.shutting_down {
            return Err(Error::TornDown);
        }
        if self.clients.contains_key(&client.identity) {
            return Err(Error::DuplicateIdentity(client.identity));
        }

        let identity = client.identity.clone();
        self.order.push(identity.clone());
        self.clients.insert(identity.clone(), client);

        tracing::info!(client = %identity, connections = self.clients.len(), "client connected");
        self.publish_state();
        self.publish_identities();
        Ok(identity)
    }

    /// Hapus koneksi. Idempotent: identitas yang sudah hilang, atau yang
    /// sekarang dipakai koneksi lain (`channel` berbeda), diabaikan.
    pub fn remove_connection(
        &mut self,
        identity: &ClientIdentity,
        channel: ChannelId,
    ) -> Option<ConnectedClient> {
        match self.clients.get(identity) {
            Some(client) if client.channel.id() == channel => {}
            _ => return None,
        }

        let client = self.clients.remove(identity)?;
        self.order.retain(|id| id != identity);

        tracing::info!(client = %identity, connections = self.clients.len(), "client disconnected");
        self.publish_state();
        self.publish_identities();
        Some(client)
    }

    pub fn get(&self, identity: &ClientIdentity) -> Option<&ConnectedClient> {
        self.clients.get(identity)
    }

    /// Koneksi paling baru yang masih hidup
    pub fn most_recent(&self) -> Option<&ConnectedClient> {
        self.order.last().and_then(|id| self.clients.get(id))
    }

    /// Semua koneksi sesuai urutan masuk
    pub fn iter(&self) -> impl Iterator<Item = &ConnectedClient> {
        self.order.iter().filter_map(|id| self.clients.get(id))
    }

    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        self.publish_state();
    }

    /// Ambil semua koneksi untuk ditutup
    pub fn drain(&mut self) -> Vec<ConnectedClient> {
        let order = std::mem::take(&mut self.order);
        let drained = order
            .into_iter()
            .filter_map(|id| self.clients.remove(&id))
            .collect();
        self.clients.clear();
        self.publish_state();
        self.publish_identities();
        drained
    }

    pub fn finish_shutdown(&mut self) {
        self.shutting_down = false;
        self.bound = None;
        self.last_error = None;
        self.publish_state();
    }

    fn publish_state(&self) {
        let next = self.state();
        let current = self.state.get();
        // Error baru selalu dipublikasikan karena equality-nya kasar
        if next != current || next.cause().is_some() {
            tracing::debug!(from = current.name(), to = next.name(), "server state");
            self.state.publish(next);
        }
    }

    fn publish_identities(&self) {
        self.identities.publish(self.order.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::{ChannelIo, CloseNotifier};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct NullIo;

    impl ChannelIo for NullIo {
        fn write(&self, _id: ChannelId, _bytes: Bytes) -> io::Result<()> {
            Ok(())
        }
        fn close(&self, _id: ChannelId, done: CloseNotifier) {
            done.notify(Ok(()));
        }
        fn resume(&self, _id: ChannelId) {}
    }

    static NEXT: AtomicUsize = AtomicUsize::new(1);

    fn channel() -> Channel {
        let channel = Channel::new(
            ChannelId(NEXT.fetch_add(1, Ordering::Relaxed)),
            None,
            Arc::new(NullIo),
        );
        channel.mark_open();
        channel
    }

    fn client(name: &str) -> ConnectedClient {
        ConnectedClient::new(ClientIdentity::named(name), channel())
    }

    fn listening() -> ConnectionRegistry {
        let mut registry = ConnectionRegistry::new();
        registry.listener_bound("127.0.0.1:9000".parse().unwrap());
        registry
    }

    #[test]
    fn test_n_adds_then_all_removed() {
        let mut registry = listening();
        assert_eq!(registry.state(), ServerListeningState::Listening);

        let clients: Vec<_> = (0..5)
            .map(|_| ConnectedClient::new(ClientIdentity::generate(), channel()))
            .collect();
        for c in &clients {
            registry.add_connection(c.clone()).unwrap();
        }

        assert_eq!(registry.identities().len(), 5);
        assert_eq!(registry.identities_cell().get().len(), 5);
        assert_eq!(registry.state(), ServerListeningState::ActiveConnections);
        assert_eq!(
            registry.state_cell().get(),
            ServerListeningState::ActiveConnections
        );

        for c in &clients {
            assert!(registry
                .remove_connection(c.identity(), c.channel().id())
                .is_some());
        }
        assert!(registry.is_empty());
        assert_eq!(registry.state_cell().get(), ServerListeningState::Listening);
    }

    #[test]
    fn test_state_visible_before_identity_list() {
        for _ in 0..200 {
            let mut registry = listening();
            let a = client("a");

            let state = registry.state_cell();
            let ids = registry.identities_cell().subscribe();
            let watcher = thread::spawn(move || {
                let seen = ids.wait_for(Duration::from_secs(5), |l| !l.is_empty());
                (seen.is_some(), state.get())
            });
            registry.add_connection(a.clone()).unwrap();
            let (seen, state) = watcher.join().unwrap();
            assert!(seen);
            assert_eq!(state, ServerListeningState::ActiveConnections);

            let state = registry.state_cell();
            let ids = registry.identities_cell().subscribe();
            let watcher = thread::spawn(move || {
                let seen = ids.wait_for(Duration::from_secs(5), |l| l.is_empty());
                (seen.is_some(), state.get())
            });
            registry.remove_connection(a.identity(), a.channel().id());
            let (seen, state) = watcher.join().unwrap();
            assert!(seen);
            assert_eq!(state, ServerListeningState::Listening);
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = listening();
        let a = client("a");
        let b = client("b");
        registry.add_connection(a.clone()).unwrap();
        registry.add_connection(b.clone()).unwrap();

        assert!(registry.remove_connection(a.identity(), a.channel().id()).is_some());
        assert!(registry.remove_connection(a.identity(), a.channel().id()).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.state(), ServerListeningState::ActiveConnections);
    }

    #[test]
    fn test_stale_channel_does_not_remove_new_owner() {
        let mut registry = listening();
        let old = client("alice");
        registry.add_connection(old.clone()).unwrap();
        registry.remove_connection(old.identity(), old.channel().id());

        let new = client("alice");
        registry.add_connection(new.clone()).unwrap();

        // Close terlambat dari koneksi lama
        assert!(registry
            .remove_connection(old.identity(), old.channel().id())
            .is_none());
        assert_eq!(
            registry.get(new.identity()).map(|c| c.channel().id()),
            Some(new.channel().id())
        );
    }

    #[test]
    fn test_duplicate_named_identity_rejected() {
        let mut registry = listening();
        registry.add_connection(client("alice")).unwrap();

        let err = registry.add_connection(client("alice")).unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity(ref id) if id.to_string() == "alice"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_most_recent_falls_back_to_newest_live() {
        let mut registry = listening();
        let a = client("a");
        let b = client("b");
        let c = client("c");
        for x in [&a, &b, &c] {
            registry.add_connection(x.clone()).unwrap();
        }
        assert_eq!(registry.most_recent().unwrap().identity(), c.identity());

        registry.remove_connection(c.identity(), c.channel().id());
        assert_eq!(registry.most_recent().unwrap().identity(), b.identity());

        registry.remove_connection(a.identity(), a.channel().id());
        assert_eq!(registry.most_recent().unwrap().identity(), b.identity());

        registry.remove_connection(b.identity(), b.channel().id());
        assert!(registry.most_recent().is_none());
    }

    #[test]
    fn test_stop_listening_keeps_connections() {
        let mut registry = listening();
        registry.add_connection(client("a")).unwrap();

        registry.listener_unbound();
        assert_eq!(registry.state(), ServerListeningState::Off);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bind_error_then_recover() {
        let mut registry = ConnectionRegistry::new();
        let sub = registry.state_cell().subscribe();

        registry.record_error(Error::Io(io::Error::from(io::ErrorKind::AddrInUse)));
        registry.listener_bound("127.0.0.1:9001".parse().unwrap());

        let seen: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(
            seen,
            vec![
                ServerListeningState::Off,
                ServerListeningState::Error(Arc::new(Error::TornDown)),
                ServerListeningState::Listening,
            ]
        );
        assert!(seen[1].cause().is_some());
    }

    #[test]
    fn test_shutdown_sequence() {
        let mut registry = listening();
        registry.add_connection(client("a")).unwrap();
        registry.add_connection(client("b")).unwrap();

        registry.begin_shutdown();
        assert_eq!(registry.state(), ServerListeningState::ShuttingDown);
        assert!(matches!(
            registry.add_connection(client("c")),
            Err(Error::TornDown)
        ));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.state(), ServerListeningState::ShuttingDown);
        assert!(registry.identities_cell().get().is_empty());

        registry.finish_shutdown();
        assert_eq!(registry.state_cell().get(), ServerListeningState::Off);
    }
}
