//! Client facade: satu koneksi keluar
//!
//! Semua operasi publik dan callback transport dijalankan di serial context
//! milik client. Pesan yang masuk di-decode di worker engine lalu diserahkan
//! ke `Dispatcher`, tidak pernah lewat serial context.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use super::dispatch::{decode_chunk, ClientHandler, Dispatcher};
use super::state::{ConnectionEvent, ConnectionState, ConnectionStateMachine};
use super::transport::{Channel, ChannelHandler, ChannelId, CloseReceipt, Transport};
use crate::config::{ClientConfig, FramingConfig};
use crate::core::{SerialExecutor, StateCell, Subscription};
use crate::error::{Error, Result};
use crate::protocol::{FrameDecoder, FrameEncoder};

/// State milik serial context client
struct ClientCore {
    machine: ConnectionStateMachine,
    channel: Option<Channel>,
    engine: Arc<dyn Transport>,
    owns_engine: bool,
    framing: FramingConfig,
    encoder: FrameEncoder,
    dispatcher: Arc<Dispatcher>,
}

impl ClientCore {
    fn is_current(&self, id: ChannelId) -> bool {
        self.channel.as_ref().map(Channel::id) == Some(id)
    }

    fn apply(&mut self, event: ConnectionEvent) {
        if let Err(e) = self.machine.apply(event) {
            tracing::debug!(error = %e, "connection event ignored");
        }
    }

    /// `target` sudah di-resolve oleh pemanggil, di luar serial context
    fn connect(
        &mut self,
        target: Result<SocketAddr>,
        handler: Arc<dyn ClientHandler>,
        exec: SerialExecutor<ClientCore>,
    ) {
        if let Err(e) = self.machine.apply(ConnectionEvent::ConnectRequested) {
            tracing::warn!(error = %e, "connect ignored");
            return;
        }

        let addr = match target {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                self.apply(ConnectionEvent::ConnectFailed(e));
                return;
            }
        };

        tracing::info!(%addr, "connecting");
        let handler = ClientChannelHandler {
            decoder: self.framing.decoder(),
            closing: false,
            dispatcher: Arc::clone(&self.dispatcher),
            ctx: ClientContext { exec: exec.clone() },
            handler,
            exec,
            addr,
        };
        self.channel = Some(self.engine.connect(addr, Box::new(handler)));
    }

    fn on_established(&mut self, id: ChannelId) {
        if self.is_current(id) {
            tracing::info!(channel = %id, "connected");
            self.apply(ConnectionEvent::Established);
        }
    }

    fn on_connect_failed(&mut self, id: ChannelId, cause: Error) {
        if !self.is_current(id) {
            return;
        }
        self.channel = None;
        tracing::warn!(error = %cause, "connect failed");
        if matches!(self.machine.current(), ConnectionState::Disconnecting) {
            self.apply(ConnectionEvent::Closed);
        } else {
            self.apply(ConnectionEvent::ConnectFailed(cause));
        }
    }

    fn on_io_error(&mut self, id: ChannelId, cause: Error) {
        if self.is_current(id) {
            tracing::warn!(channel = %id, error = %cause, "connection error");
            self.apply(ConnectionEvent::IoError(cause));
        }
    }

    fn on_closed(&mut self, id: ChannelId) {
        if self.is_current(id) {
            tracing::info!(channel = %id, "disconnected");
            self.channel = None;
            self.apply(ConnectionEvent::Closed);
        }
    }

    fn send(&mut self, message: &str) {
        let channel = match (self.machine.current(), &self.channel) {
            (ConnectionState::Connected, Some(channel)) => channel,
            (state, _) => {
                tracing::warn!(state = state.name(), "send while not connected, message dropped");
                return;
            }
        };

        let frame = self.encoder.encode(message);
        if let Err(e) = channel.write(frame) {
            tracing::warn!(error = %e, "send failed");
        }
    }

    /// Minta close. Returns receipt jika ada koneksi yang harus ditunggu.
    fn disconnect(&mut self) -> Option<CloseReceipt> {
        match self.machine.current() {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => return None,
            _ => {}
        }

        self.apply(ConnectionEvent::DisconnectRequested);
        match &self.channel {
            Some(channel) => Some(channel.close()),
            None => {
                // Tidak ada koneksi (connect gagal sebelumnya)
                self.apply(ConnectionEvent::Closed);
                None
            }
        }
    }

    fn finish_shutdown(&mut self) {
        if !matches!(self.machine.current(), ConnectionState::Disconnected) {
            tracing::debug!(state = self.machine.current().name(), "forcing disconnected state");
            self.channel = None;
            self.apply(ConnectionEvent::DisconnectRequested);
            self.apply(ConnectionEvent::Closed);
        }

        self.dispatcher.stop();
        if self.owns_engine {
            self.engine.shutdown();
        }
        tracing::info!("client shut down");
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let target = format!("{host}:{port}");
    (host, port)
        .to_socket_addrs()
        .map_err(|source| Error::Resolve {
            target: target.clone(),
            source,
        })?
        .next()
        .ok_or(Error::NoAddress(target))
}

/// Callback transport untuk koneksi client. Berjalan di worker engine.
struct ClientChannelHandler {
    exec: SerialExecutor<ClientCore>,
    decoder: FrameDecoder,
    /// Close sudah diminta karena frame terlalu panjang
    closing: bool,
    dispatcher: Arc<Dispatcher>,
    handler: Arc<dyn ClientHandler>,
    ctx: ClientContext,
    addr: SocketAddr,
}

impl ChannelHandler for ClientChannelHandler {
    fn established(&mut self, channel: &Channel) {
        let id = channel.id();
        let _ = self.exec.submit(move |core| core.on_established(id));
    }

    fn connect_failed(&mut self, channel: &Channel, error: io::Error) {
        let id = channel.id();
        let cause = Error::Connect {
            addr: self.addr,
            source: error,
        };
        let _ = self.exec.submit(move |core| core.on_connect_failed(id, cause));
    }

    fn read(&mut self, channel: &Channel, bytes: &[u8]) {
        if self.closing {
            return;
        }
        let Self {
            decoder,
            dispatcher,
            handler,
            ctx,
            ..
        } = self;

        let open = decode_chunk(decoder, channel, bytes, |message| {
            let handler = Arc::clone(handler);
            let ctx = ctx.clone();
            dispatcher.dispatch(move || handler.on_message(&ctx, message));
        });
        self.closing = !open;
    }

    fn errored(&mut self, channel: &Channel, error: io::Error) {
        let id = channel.id();
        let _ = self
            .exec
            .submit(move |core| core.on_io_error(id, Error::Io(error)));
    }

    fn closed(&mut self, channel: &Channel) {
        let id = channel.id();
        let _ = self.exec.submit(move |core| core.on_closed(id));
    }
}

/// Handle untuk handler pesan: kirim balasan atau putuskan koneksi.
///
/// Semua operasi hanya di-enqueue ke serial context client.
#[derive(Clone)]
pub struct ClientContext {
    exec: SerialExecutor<ClientCore>,
}

impl ClientContext {
    /// Kirim satu pesan (delimiter ditambahkan otomatis)
    pub fn send(&self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.exec.submit(move |core| core.send(&message))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.exec.submit(|core| {
            core.disconnect();
        })
    }
}

/// Line protocol client
///
/// ```no_run
/// use linewire::network::{Client, ClientContext, HandlerResult};
/// use linewire::config::ClientConfig;
///
/// let client = Client::new(ClientConfig::default())?;
/// client.connect("127.0.0.1", 7000, |_ctx: &ClientContext, msg: String| -> HandlerResult {
///     println!("{msg}");
///     Ok(())
/// })?;
/// client.send("hello")?;
/// client.shutdown()?;
/// # Ok::<(), linewire::Error>(())
/// ```
pub struct Client {
    ctx: ClientContext,
    state: StateCell<ConnectionState>,
    shutdown_timeout: Duration,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let (engine, owns_engine) = config.engine.acquire()?;
        let dispatcher = Arc::new(Dispatcher::new(
            "linewire-client-dispatch",
            config.dispatch_threads,
        )?);

        let machine = ConnectionStateMachine::new();
        let state = machine.cell();
        let core = ClientCore {
            machine,
            channel: None,
            engine: Arc::clone(&engine),
            owns_engine,
            framing: config.framing,
            encoder: config.framing.encoder(),
            dispatcher: Arc::clone(&dispatcher),
        };

        let exec = match SerialExecutor::spawn("linewire-client", core) {
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
            ctx: ClientContext { exec },
            state,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Mulai connect. Hasilnya diamati lewat `state()` / `subscribe()`.
    ///
    /// Nama host di-resolve di thread pemanggil sebelum connect di-enqueue.
    ///
    /// Connect saat `Connecting` atau `Connected` adalah kesalahan pemanggil:
    /// di-log dan diabaikan.
    pub fn connect(&self, host: &str, port: u16, handler: impl ClientHandler) -> Result<()> {
        if self.ctx.exec.is_stopped() {
            return Err(Error::TornDown);
        }
        // Lookup DNS bisa lambat: jalankan di thread pemanggil
        let target = resolve(host, port);
        let handler: Arc<dyn ClientHandler> = Arc::new(handler);
        let exec = self.ctx.exec.clone();
        self.ctx
            .exec
            .submit(move |core| core.connect(target, handler, exec))
    }

    /// Kirim satu pesan. No-op (di-log) jika belum `Connected`.
    pub fn send(&self, message: impl Into<String>) -> Result<()> {
        self.ctx.send(message)
    }

    /// Idempotent
    pub fn disconnect(&self) -> Result<()> {
        self.ctx.disconnect()
    }

    /// State terakhir
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Subscribe ke perubahan state; state terakhir langsung dikirim
    pub fn subscribe(&self) -> Subscription<ConnectionState> {
        self.state.subscribe()
    }

    /// Putuskan koneksi, lepaskan engine milik sendiri, hentikan serial
    /// context. Block sampai selesai. Setelah ini client tidak bisa dipakai.
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

        let receipt = match exec.call(ClientCore::disconnect) {
            Err(Error::TornDown) => {
                exec.join();
                return Ok(());
            }
            other => other?,
        };
        if let Some(receipt) = receipt {
            if let Err(e) = receipt.wait(self.shutdown_timeout) {
                tracing::warn!(error = %e, "disconnect did not complete cleanly");
            }
        }

        match exec.finish(ClientCore::finish_shutdown) {
            Err(Error::TornDown) => Ok(()),
            other => other,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::debug!(error = %e, "client shutdown on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::HandlerResult;

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve("127.0.0.1", 4100).unwrap();
        assert_eq!(addr.port(), 4100);
    }

    #[test]
    fn test_send_before_connect_is_noop() {
        let client = Client::new(ClientConfig::default()).unwrap();
        client.send("nobody listening").unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.shutdown().unwrap();
    }

    #[test]
    fn test_disconnect_when_disconnected_publishes_nothing() {
        let client = Client::new(ClientConfig::default()).unwrap();
        let sub = client.subscribe();
        assert_eq!(sub.recv(), Some(ConnectionState::Disconnected));

        client.disconnect().unwrap();
        client.disconnect().unwrap();
        client.shutdown().unwrap();

        assert_eq!(sub.try_recv(), None);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_unresolvable_host_errors() {
        let client = Client::new(ClientConfig::default()).unwrap();
        let sub = client.subscribe();
        client
            .connect("host.invalid", 80, |_: &ClientContext, _: String| -> HandlerResult {
                Ok(())
            })
            .unwrap();

        let state = sub
            .wait_for(Duration::from_secs(10), ConnectionState::is_error)
            .unwrap();
        assert!(matches!(
            state.cause().map(|c| &**c),
            Some(Error::Resolve { .. } | Error::NoAddress(_))
        ));
        client.shutdown().unwrap();
    }

    #[test]
    fn test_serial_context_gets_resolved_target() {
        let client = Client::new(ClientConfig::default()).unwrap();
        let sub = client.subscribe();
        let exec = client.ctx.exec.clone();
        let handler: Arc<dyn ClientHandler> =
            Arc::new(|_: &ClientContext, _: String| -> HandlerResult { Ok(()) });

        // Hasil lookup sudah jadi sebelum job masuk serial context
        let target = Err(Error::NoAddress("nowhere:1".into()));
        client
            .ctx
            .exec
            .call(move |core| core.connect(target, handler, exec))
            .unwrap();

        let seen: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(
            seen,
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Error(Arc::new(Error::TornDown)),
            ]
        );
        assert!(matches!(
            client.state().cause().map(|c| &**c),
            Some(Error::NoAddress(_))
        ));
        client.shutdown().unwrap();
    }

    #[test]
    fn test_concurrent_shutdown_returns_after_teardown() {
        let client = Arc::new(Client::new(ClientConfig::default()).unwrap());
        let callers: Vec<_> = (0..3)
            .map(|_| {
                let client = Arc::clone(&client);
                std::thread::spawn(move || {
                    client.shutdown().unwrap();
                    client.ctx.exec.is_stopped()
                })
            })
            .collect();
        for caller in callers {
            assert!(caller.join().unwrap());
        }
        assert!(matches!(client.send("late"), Err(Error::TornDown)));
    }

    #[test]
    fn test_shutdown_twice_and_after_teardown() {
        let client = Client::new(ClientConfig::default()).unwrap();
        client.shutdown().unwrap();
        client.shutdown().unwrap();
        assert!(matches!(client.send("late"), Err(Error::TornDown)));
    }
}
