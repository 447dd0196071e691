//! Server facade: banyak koneksi masuk
//!
//! Registry koneksi hidup di serial context server. Koneksi yang baru
//! di-accept dimulai dalam keadaan pause dan baru membaca setelah job
//! `admit` mendaftarkannya, jadi state agregat dan daftar identitas sudah
//! dipublikasikan sebelum pesan pertama koneksi itu sampai ke handler.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use super::dispatch::{decode_chunk, Dispatcher, ServerHandler};
use super::identity::ClientIdentity;
use super::registry::{ConnectedClient, ConnectionRegistry};
use super::state::ServerListeningState;
use super::transport::{Acceptor, Channel, ChannelHandler, CloseReceipt, Listener, Transport};
use crate::config::{FramingConfig, IdentityPolicy, ServerConfig};
use crate::core::{SerialExecutor, StateCell, Subscription};
use crate::error::{Error, Result};
use crate::protocol::{FrameDecoder, FrameEncoder};

/// State milik serial context server
struct ServerCore {
    registry: ConnectionRegistry,
    listener: Option<Listener>,
    engine: Arc<dyn Transport>,
    owns_engine: bool,
    bind_ip: IpAddr,
    identity: IdentityPolicy,
    framing: FramingConfig,
    encoder: FrameEncoder,
    dispatcher: Arc<Dispatcher>,
    local_addr: StateCell<Option<SocketAddr>>,
}

impl ServerCore {
    fn listen(&mut self, port: u16, handler: Arc<dyn ServerHandler>, exec: SerialExecutor<ServerCore>) {
        if self.registry.is_shutting_down() {
            tracing::warn!(port, "listen during shutdown ignored");
            return;
        }
        if let Some(listener) = &self.listener {
            tracing::warn!(bound = %listener.local_addr(), port, "already listening, listen ignored");
            return;
        }

        let addr = SocketAddr::new(self.bind_ip, port);
        let acceptor = ServerAcceptor {
            ctx: ServerContext { exec: exec.clone() },
            exec,
            policy: self.identity.clone(),
            framing: self.framing,
            dispatcher: Arc::clone(&self.dispatcher),
            handler,
        };

        match self.engine.bind(addr, Box::new(acceptor)) {
            Ok(listener) => {
                let local = listener.local_addr();
                tracing::info!(addr = %local, "listening");
                self.listener = Some(listener);
                self.local_addr.publish(Some(local));
                self.registry.listener_bound(local);
            }
            Err(source) => {
                let cause = Error::Bind { addr, source };
                tracing::error!(error = %cause, "listen failed");
                self.registry.record_error(cause);
            }
        }
    }

    /// Daftarkan koneksi yang baru di-accept lalu mulai membaca
    fn admit(&mut self, client: ConnectedClient) {
        let channel = client.channel().clone();
        match self.registry.add_connection(client) {
            Ok(identity) => {
                tracing::debug!(client = %identity, channel = %channel.id(), peer = ?channel.peer_addr(), "admitted");
                channel.resume();
            }
            Err(e) => {
                tracing::warn!(channel = %channel.id(), error = %e, "connection rejected");
                let _ = channel.close();
            }
        }
    }

    fn on_closed(&mut self, identity: &ClientIdentity, channel: &Channel) {
        // Bisa sudah dihapus lewat disconnect_client atau shutdown
        let _ = self.registry.remove_connection(identity, channel.id());
    }

    fn send(&mut self, message: &str, target: Option<&ClientIdentity>) -> Result<()> {
        let client = match target {
            Some(identity) => self
                .registry
                .get(identity)
                .ok_or_else(|| Error::UnknownIdentity(identity.clone()))?,
            None => self.registry.most_recent().ok_or(Error::NoClients)?,
        };

        let frame = self.encoder.encode(message);
        client.send(frame)
    }

    fn broadcast(&mut self, message: &str) {
        let frame = self.encoder.encode(message);
        for client in self.registry.iter() {
            if let Err(e) = client.send(frame.clone()) {
                tracing::warn!(client = %client.identity(), error = %e, "broadcast send failed");
            }
        }
    }

    /// Hapus dari registry sekarang lalu tutup koneksinya
    fn disconnect_client(&mut self, identity: &ClientIdentity) -> Option<CloseReceipt> {
        let channel_id = self.registry.get(identity)?.channel().id();
        let client = self.registry.remove_connection(identity, channel_id)?;
        Some(client.channel().close())
    }

    fn stop_listening(&mut self) -> Option<CloseReceipt> {
        let listener = self.listener.take()?;
        tracing::info!(addr = %listener.local_addr(), "stopped listening");
        let receipt = listener.close();
        self.local_addr.publish(None);
        self.registry.listener_unbound();
        Some(receipt)
    }

    /// Tahap pertama shutdown: `ShuttingDown`, tutup listener dan semua koneksi
    fn begin_shutdown(&mut self) -> Vec<(String, CloseReceipt)> {
        self.registry.begin_shutdown();

        let mut receipts = Vec::with_capacity(self.registry.len() + 1);
        if let Some(listener) = self.listener.take() {
            receipts.push((format!("listener {}", listener.local_addr()), listener.close()));
        }
        for client in self.registry.drain() {
            receipts.push((client.identity().to_string(), client.channel().close()));
        }
        receipts
    }

    fn finish_shutdown(&mut self) {
        self.dispatcher.stop();
        if self.owns_engine {
            self.engine.shutdown();
        }
        self.local_addr.publish(None);
        self.registry.finish_shutdown();
        tracing::info!("server shut down");
    }
}

/// Acceptor untuk listener server. Berjalan di worker engine.
struct ServerAcceptor {
    exec: SerialExecutor<ServerCore>,
    ctx: ServerContext,
    policy: IdentityPolicy,
    framing: FramingConfig,
    dispatcher: Arc<Dispatcher>,
    handler: Arc<dyn ServerHandler>,
}

impl Acceptor for ServerAcceptor {
    fn accept(&mut self, channel: &Channel) -> Box<dyn ChannelHandler> {
        Box::new(ServerChannelHandler {
            exec: self.exec.clone(),
            identity: self.policy.mint(channel.peer_addr()),
            decoder: self.framing.decoder(),
            closing: false,
            dispatcher: Arc::clone(&self.dispatcher),
            handler: Arc::clone(&self.handler),
            ctx: self.ctx.clone(),
        })
    }

    fn errored(&mut self, error: io::Error) {
        tracing::warn!(error = %error, "accept failed");
    }
}

struct ServerChannelHandler {
    exec: SerialExecutor<ServerCore>,
    identity: ClientIdentity,
    decoder: FrameDecoder,
    /// Close sudah diminta karena frame terlalu panjang
    closing: bool,
    dispatcher: Arc<Dispatcher>,
    handler: Arc<dyn ServerHandler>,
    ctx: ServerContext,
}

impl ChannelHandler for ServerChannelHandler {
    fn established(&mut self, channel: &Channel) {
        let client = ConnectedClient::new(self.identity.clone(), channel.clone());
        if self.exec.submit(move |core| core.admit(client)).is_err() {
            let _ = channel.close();
        }
    }

    fn connect_failed(&mut self, channel: &Channel, error: io::Error) {
        tracing::debug!(channel = %channel.id(), error = %error, "accepted connection failed");
    }

    fn read(&mut self, channel: &Channel, bytes: &[u8]) {
        if self.closing {
            return;
        }
        let Self {
            identity,
            decoder,
            dispatcher,
            handler,
            ctx,
            ..
        } = self;

        let open = decode_chunk(decoder, channel, bytes, |message| {
            let handler = Arc::clone(handler);
            let ctx = ctx.clone();
            let identity = identity.clone();
            dispatcher.dispatch(move || handler.on_message(&ctx, &identity, message));
        });
        self.closing = !open;
    }

    fn errored(&mut self, channel: &Channel, error: io::Error) {
        tracing::debug!(client = %self.identity, channel = %channel.id(), error = %error, "connection error");
    }

    fn closed(&mut self, channel: &Channel) {
        let identity = self.identity.clone();
        let channel = channel.clone();
        let _ = self
            .exec
            .submit(move |core| core.on_closed(&identity, &channel));
    }
}

/// Handle untuk handler pesan server dan untuk `Server` sendiri.
///
/// Semua operasi hanya di-enqueue ke serial context server; kegagalan
/// kirim di-log, tidak dikembalikan.
#[derive(Clone)]
pub struct ServerContext {
    exec: SerialExecutor<ServerCore>,
}

impl ServerContext {
    /// Kirim ke `target`, atau ke client yang paling baru connect jika `None`
    pub fn send(&self, message: impl Into<String>, target: Option<ClientIdentity>) -> Result<()> {
        let message = message.into();
        self.exec.submit(move |core| {
            if let Err(e) = core.send(&message, target.as_ref()) {
                tracing::warn!(error = %e, "send failed, message dropped");
            }
        })
    }

    /// Kirim ke semua client yang terhubung
    pub fn broadcast(&self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.exec.submit(move |core| core.broadcast(&message))
    }

    /// Putuskan satu client. Identitasnya langsung hilang dari registry.
    pub fn disconnect_client(&self, identity: ClientIdentity) -> Result<()> {
        self.exec.submit(move |core| {
            if core.disconnect_client(&identity).is_none() {
                tracing::debug!(client = %identity, "disconnect for unknown client ignored");
            }
        })
    }
}

/// Line protocol server
///
/// ```no_run
/// use linewire::network::{ClientIdentity, HandlerResult, Server, ServerContext};
/// use linewire::config::ServerConfig;
///
/// let server = Server::new(ServerConfig::default())?;
/// server.listen(7000, |ctx: &ServerContext, client: &ClientIdentity, msg: String| -> HandlerResult {
///     ctx.send(msg, Some(client.clone()))?;
///     Ok(())
/// })?;
/// # server.shutdown()?;
/// # Ok::<(), linewire::Error>(())
/// ```
pub struct Server {
    ctx: ServerContext,
    state: StateCell<ServerListeningState>,
    clients: StateCell<Vec<ClientIdentity>>,
    local_addr: StateCell<Option<SocketAddr>>,
    shutdown_timeout: Duration,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let (engine, owns_engine) = config.engine.acquire()?;
        let dispatcher = Arc::new(Dispatcher::new(
            "linewire-server-dispatch",
            config.dispatch_threads,
        )?);

        let registry = ConnectionRegistry::new();
        let state = registry.state_cell();
        let clients = registry.identities_cell();
        let local_addr = StateCell::new(None);

        let core = ServerCore {
            registry,
            listener: None,
            engine: Arc::clone(&engine),
            owns_engine,
            bind_ip: config.bind_ip,
            identity: config.identity,
            framing: config.framing,
            encoder: config.framing.encoder(),
            dispatcher: Arc::clone(&dispatcher),
            local_addr: local_addr.clone(),
        };

        let exec = match SerialExecutor::spawn("linewire-server", core) {
            Ok(exec) => exec,
            Err(e) => {
                dispatcher.stop();
                if owns_engine {
                    engine.shutdown();
                }
                return Err(e);
            }
        };

        Ok(Self {
            ctx: ServerContext { exec },
            state,
            clients,
            local_addr,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Bind listener di `port` (0 = port bebas). Hasilnya diamati lewat
    /// `state()`: `Listening` atau `Error`.
    pub fn listen(&self, port: u16, handler: impl ServerHandler) -> Result<()> {
        let handler: Arc<dyn ServerHandler> = Arc::new(handler);
        let exec = self.ctx.exec.clone();
        self.ctx
            .exec
            .submit(move |core| core.listen(port, handler, exec))
    }

    /// Kirim ke `target`, atau ke client paling baru jika `None`.
    /// Identitas yang tidak dikenal hanya di-log.
    pub fn send(&self, message: impl Into<String>, target: Option<ClientIdentity>) -> Result<()> {
        self.ctx.send(message, target)
    }

    pub fn broadcast(&self, message: impl Into<String>) -> Result<()> {
        self.ctx.broadcast(message)
    }

    pub fn disconnect_client(&self, identity: ClientIdentity) -> Result<()> {
        self.ctx.disconnect_client(identity)
    }

    /// Tutup listener saja; koneksi yang ada tetap terbuka
    pub fn stop_listening(&self) -> Result<()> {
        self.ctx.exec.submit(|core| {
            let _ = core.stop_listening();
        })
    }

    pub fn state(&self) -> ServerListeningState {
        self.state.get()
    }

    pub fn subscribe(&self) -> Subscription<ServerListeningState> {
        self.state.subscribe()
    }

    /// Identitas client yang terhubung, urut sesuai waktu connect
    pub fn clients(&self) -> Vec<ClientIdentity> {
        self.clients.get()
    }

    pub fn subscribe_clients(&self) -> Subscription<Vec<ClientIdentity>> {
        self.clients.subscribe()
    }

    /// Alamat listener (berguna setelah `listen(0, ..)`)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get()
    }

    pub fn subscribe_local_addr(&self) -> Subscription<Option<SocketAddr>> {
        self.local_addr.subscribe()
    }

    /// Tutup listener dan semua koneksi, lepaskan engine milik sendiri.
    ///
    /// Block sampai semua koneksi melaporkan closed dan state menjadi `Off`.
    /// Kegagalan close per koneksi di-log, shutdown tetap berlanjut.
    /// Server tidak bisa dipakai lagi setelah ini.
    pub fn shutdown(&self) -> Result<()> {
        let exec = &self.ctx.exec;
        if exec.is_current() {
            return Err(Error::SerialContext);
        }
        if exec.is_stopped() {
            // Shutdown lain sedang berjalan: tunggu sampai selesai
            exec.join();
            return Ok(());
        }

        let receipts = match exec.call(ServerCore::begin_shutdown) {
            Err(Error::TornDown) => {
                exec.join();
                return Ok(());
            }
            other => other?,
        };
        tracing::info!(pending = receipts.len(), "shutting down");

        for (what, receipt) in receipts {
            if let Err(e) = receipt.wait(self.shutdown_timeout) {
                tracing::warn!(resource = %what, error = %e, "close failed during shutdown");
            }
        }

        match exec.finish(ServerCore::finish_shutdown) {
            Err(Error::TornDown) => Ok(()),
            other => other,
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::debug!(error = %e, "server shutdown on drop failed");
        }
    }
}
