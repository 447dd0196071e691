//! Configuration untuk engine, client dan server
//!
//! Semua struct punya `Default` yang masuk akal dan setter gaya builder.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::network::Transport;
use crate::protocol::{FrameDecoder, FrameEncoder, DEFAULT_DELIMITER, DEFAULT_MAX_FRAME_LENGTH};

/// Buffer sizes - tuned untuk typical message sizes
const READ_BUFFER_SIZE: usize = 64 * 1024; // 64KB
const WRITE_BUFFER_SIZE: usize = 64 * 1024; // 64KB
const MAX_PENDING_WRITE: usize = 1024 * 1024; // 1MB, lalu message di-drop

/// Konfigurasi event engine (mio worker group)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Jumlah worker thread; setiap koneksi di-pin ke satu worker
    pub worker_threads: usize,
    /// Ukuran scratch buffer read per worker
    pub read_buffer_size: usize,
    /// Kapasitas awal write buffer per koneksi
    pub write_buffer_size: usize,
    /// Batas bytes yang boleh menunggu di write buffer
    pub max_pending_write: usize,
    /// TCP_NODELAY untuk latency rendah
    pub nodelay: bool,
    /// SO_RCVBUF (unix saja)
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF (unix saja)
    pub send_buffer_size: Option<usize>,
    /// Kapasitas `mio::Events` per poll
    pub events_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            read_buffer_size: READ_BUFFER_SIZE,
            write_buffer_size: WRITE_BUFFER_SIZE,
            max_pending_write: MAX_PENDING_WRITE,
            nodelay: true,
            recv_buffer_size: None,
            send_buffer_size: None,
            events_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n.max(1);
        self
    }

    pub fn socket_buffers(mut self, recv: Option<usize>, send: Option<usize>) -> Self {
        self.recv_buffer_size = recv;
        self.send_buffer_size = send;
        self
    }
}

/// Asal event engine sebuah facade
#[derive(Clone)]
pub enum EngineSource {
    /// Facade membuat engine sendiri dan mematikannya saat `shutdown()`
    Owned(EngineConfig),
    /// Engine dari luar; lifecycle-nya tanggung jawab pemanggil
    Shared(Arc<dyn Transport>),
}

impl Default for EngineSource {
    fn default() -> Self {
        Self::Owned(EngineConfig::default())
    }
}

impl fmt::Debug for EngineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned(config) => f.debug_tuple("Owned").field(config).finish(),
            Self::Shared(_) => f.write_str("Shared(..)"),
        }
    }
}

/// Konfigurasi framing yang dipakai client dan server
#[derive(Debug, Clone, Copy)]
pub struct FramingConfig {
    pub delimiter: u8,
    /// `None` = FrameBuffer tanpa batas
    pub max_frame_length: Option<usize>,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER,
            max_frame_length: Some(DEFAULT_MAX_FRAME_LENGTH),
        }
    }
}

impl FramingConfig {
    pub(crate) fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.delimiter).with_max_frame_length(self.max_frame_length)
    }

    pub(crate) fn encoder(&self) -> FrameEncoder {
        FrameEncoder::new(self.delimiter)
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub engine: EngineSource,
    pub framing: FramingConfig,
    /// Thread untuk menjalankan handler pesan
    pub dispatch_threads: usize,
    /// Batas tunggu close saat `shutdown()`
    pub shutdown_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            engine: EngineSource::Owned(EngineConfig::default().worker_threads(1)),
            framing: FramingConfig::default(),
            dispatch_threads: 2,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn engine(mut self, engine: EngineSource) -> Self {
        self.engine = engine;
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.framing.delimiter = delimiter;
        self
    }

    pub fn max_frame_length(mut self, max: Option<usize>) -> Self {
        self.framing.max_frame_length = max;
        self
    }

    pub fn dispatch_threads(mut self, n: usize) -> Self {
        self.dispatch_threads = n.max(1);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Cara server memberi identitas ke koneksi baru
#[derive(Clone, Default)]
pub enum IdentityPolicy {
    /// Token UUID acak per koneksi
    #[default]
    Generated,
    /// Nama dari aplikasi, berdasarkan alamat peer. Nama yang bentrok dengan
    /// koneksi yang masih hidup ditolak.
    Named(Arc<dyn Fn(SocketAddr) -> String + Send + Sync>),
}

impl fmt::Debug for IdentityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generated => f.write_str("Generated"),
            Self::Named(_) => f.write_str("Named(..)"),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub engine: EngineSource,
    pub framing: FramingConfig,
    /// Alamat IP untuk bind; port diberikan saat `listen`
    pub bind_ip: IpAddr,
    pub identity: IdentityPolicy,
    pub dispatch_threads: usize,
    /// Batas tunggu close per koneksi saat `shutdown()`
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            engine: EngineSource::default(),
            framing: FramingConfig::default(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            identity: IdentityPolicy::Generated,
            dispatch_threads: 4,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn engine(mut self, engine: EngineSource) -> Self {
        self.engine = engine;
        self
    }

    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.framing.delimiter = delimiter;
        self
    }

    pub fn max_frame_length(mut self, max: Option<usize>) -> Self {
        self.framing.max_frame_length = max;
        self
    }

    pub fn identity(mut self, policy: IdentityPolicy) -> Self {
        self.identity = policy;
        self
    }

    pub fn dispatch_threads(mut self, n: usize) -> Self {
        self.dispatch_threads = n.max(1);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
