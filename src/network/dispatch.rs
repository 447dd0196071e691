//! Message dispatch ke handler aplikasi
//!
//! Decoder tidak pernah menunggu handler: setiap pesan menjadi job di
//! antrian FIFO dan dijalankan oleh pool thread terpisah. Urutan issue sama
//! dengan urutan ekstraksi; urutan selesai tidak dijamin jika pool > 1.
//! Error dan panic handler ditahan di sini dan hanya di-log.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use super::client::ClientContext;
use super::identity::ClientIdentity;
use super::server::ServerContext;
use super::transport::Channel;
use crate::error::Result;
use crate::protocol::{FrameDecoder, FrameError};

/// Error yang dikembalikan handler aplikasi
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Hasil satu pemanggilan handler
pub type HandlerResult = std::result::Result<(), HandlerError>;

type Job = Box<dyn FnOnce() -> HandlerResult + Send>;

/// Handler pesan di sisi client
pub trait ClientHandler: Send + Sync + 'static {
    fn on_message(&self, ctx: &ClientContext, message: String) -> HandlerResult;
}

impl<F> ClientHandler for F
where
    F: Fn(&ClientContext, String) -> HandlerResult + Send + Sync + 'static,
{
    #[inline]
    fn on_message(&self, ctx: &ClientContext, message: String) -> HandlerResult {
        self(ctx, message)
    }
}

/// Handler pesan di sisi server
pub trait ServerHandler: Send + Sync + 'static {
    fn on_message(
        &self,
        ctx: &ServerContext,
        client: &ClientIdentity,
        message: String,
    ) -> HandlerResult;
}

impl<F> ServerHandler for F
where
    F: Fn(&ServerContext, &ClientIdentity, String) -> HandlerResult + Send + Sync + 'static,
{
    #[inline]
    fn on_message(
        &self,
        ctx: &ServerContext,
        client: &ClientIdentity,
        message: String,
    ) -> HandlerResult {
        self(ctx, client, message)
    }
}

/// Pool thread untuk menjalankan handler
pub struct Dispatcher {
    tx: Mutex<Option<Sender<Job>>>,
    name: String,
}

impl Dispatcher {
    /// Spawn `threads` worker dengan prefix nama `name`
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        for index in 0..threads.max(1) {
            let rx = Arc::clone(&rx);
            let thread_name = format!("{name}-{index}");
            thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run_worker(&thread_name, &rx))?;
        }

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            name,
        })
    }

    /// Issue satu pemanggilan handler tanpa menunggu hasilnya.
    ///
    /// Returns `false` jika dispatcher sudah dihentikan.
    pub fn dispatch(&self, job: impl FnOnce() -> HandlerResult + Send + 'static) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => {
                tracing::debug!(dispatcher = %self.name, "message dropped after dispatcher stopped");
                false
            }
        }
    }

    /// Stop menerima job baru. Job yang sudah di-issue tetap dijalankan.
    pub fn stop(&self) {
        self.tx.lock().take();
    }
}

/// Feed satu chunk ke decoder dan teruskan setiap frame ke `deliver`.
///
/// Frame dengan UTF-8 tidak valid dibuang (koneksi tetap hidup). Frame yang
/// melewati batas panjang menutup koneksi; returns `false` setelah itu dan
/// pemanggil tidak boleh mem-feed chunk lain dari koneksi yang sama.
pub(crate) fn decode_chunk(
    decoder: &mut FrameDecoder,
    channel: &Channel,
    bytes: &[u8],
    mut deliver: impl FnMut(String),
) -> bool {
    for frame in decoder.feed(bytes) {
        match frame {
            Ok(message) => deliver(message),
            Err(e @ FrameError::InvalidUtf8 { .. }) => {
                tracing::warn!(channel = %channel.id(), error = %e, "dropping undecodable frame");
            }
            Err(e @ FrameError::FrameTooLong { .. }) => {
                tracing::warn!(channel = %channel.id(), error = %e, "closing connection");
                let _ = channel.close();
                return false;
            }
        }
    }
    true
}

fn run_worker(name: &str, rx: &Mutex<Receiver<Job>>) {
    loop {
        // Lock hanya selama mengambil job, bukan selama menjalankannya
        let job = match rx.lock().recv() {
            Ok(job) => job,
            Err(_) => break,
        };

        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(dispatcher = name, error = %e, "message handler failed"),
            Err(_) => tracing::error!(dispatcher = name, "message handler panicked"),
        }
    }
}
