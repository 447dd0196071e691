//! Transport abstraction
//!
//! Interface sempit antara core dan event engine:
//! - `Transport`: connect / bind / shutdown
//! - `ChannelHandler`: callback lifecycle per koneksi (established, read,
//!   errored, closed), dipanggil di worker tempat koneksi di-pin
//! - `Channel`: handle untuk write / close / resume
//!
//! Core tidak pernah memanggil syscall socket secara langsung.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Identitas koneksi atau listener di dalam engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub usize);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callback lifecycle satu koneksi
///
/// `established`, `connect_failed`, `errored` dan `closed` dipanggil paling
/// banyak sekali per koneksi; `read` dipanggil untuk setiap chunk.
pub trait ChannelHandler: Send + 'static {
    fn established(&mut self, channel: &Channel);
    fn connect_failed(&mut self, channel: &Channel, error: io::Error);
    fn read(&mut self, channel: &Channel, bytes: &[u8]);
    fn errored(&mut self, channel: &Channel, error: io::Error);
    fn closed(&mut self, channel: &Channel);
}

/// Callback untuk listener
pub trait Acceptor: Send + 'static {
    /// Koneksi baru diterima. Channel dimulai dalam keadaan pause (tidak
    /// membaca) sampai `Channel::resume` dipanggil.
    fn accept(&mut self, channel: &Channel) -> Box<dyn ChannelHandler>;
    fn errored(&mut self, error: io::Error);
}

/// Event-driven I/O engine yang dipakai facade
pub trait Transport: Send + Sync + 'static {
    /// Mulai koneksi keluar. Hasil dilaporkan lewat `handler`.
    fn connect(&self, addr: SocketAddr, handler: Box<dyn ChannelHandler>) -> Channel;

    /// Bind listener secara sinkron
    fn bind(&self, addr: SocketAddr, acceptor: Box<dyn Acceptor>) -> io::Result<Listener>;

    /// Tutup semua koneksi dan hentikan worker
    fn shutdown(&self);
}

/// Operasi yang diteruskan handle ke worker pemilik koneksi
pub trait ChannelIo: Send + Sync {
    fn write(&self, id: ChannelId, bytes: Bytes) -> io::Result<()>;
    fn close(&self, id: ChannelId, done: CloseNotifier);
    fn resume(&self, id: ChannelId);
}

const STATUS_PENDING: u8 = 0;
const STATUS_OPEN: u8 = 1;
const STATUS_CLOSING: u8 = 2;
const STATUS_CLOSED: u8 = 3;

struct ChannelInner {
    id: ChannelId,
    peer: Option<SocketAddr>,
    status: AtomicU8,
    io: Arc<dyn ChannelIo>,
}

/// Handle ke satu koneksi (clone murah)
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl Channel {
    /// Dipakai oleh implementasi transport. Channel dimulai `pending`.
    pub fn new(id: ChannelId, peer: Option<SocketAddr>, io: Arc<dyn ChannelIo>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                peer,
                status: AtomicU8::new(STATUS_PENDING),
                io,
            }),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.inner.status.load(Ordering::Acquire) == STATUS_OPEN
    }

    pub fn is_closed(&self) -> bool {
        self.inner.status.load(Ordering::Acquire) == STATUS_CLOSED
    }

    /// Tandai koneksi established (dipanggil transport)
    pub fn mark_open(&self) {
        let _ = self.inner.status.compare_exchange(
            STATUS_PENDING,
            STATUS_OPEN,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Tandai koneksi tertutup (dipanggil transport)
    pub fn mark_closed(&self) {
        self.inner.status.store(STATUS_CLOSED, Ordering::Release);
    }

    /// Queue bytes untuk dikirim. Gagal jika koneksi tidak writable.
    pub fn write(&self, bytes: Bytes) -> Result<()> {
        if !self.is_writable() {
            return Err(Error::NotWritable(self.id()));
        }
        self.inner
            .io
            .write(self.id(), bytes)
            .map_err(|_| Error::NotWritable(self.id()))
    }

    /// Mulai membaca (untuk koneksi yang di-accept dalam keadaan pause)
    pub fn resume(&self) {
        self.inner.io.resume(self.id());
    }

    /// Minta koneksi ditutup. Receipt selesai setelah `closed` dipanggil.
    pub fn close(&self) -> CloseReceipt {
        let (receipt, notifier) = CloseReceipt::pair();
        if self.is_closed() {
            notifier.notify(Ok(()));
            return receipt;
        }

        let _ = self.inner.status.compare_exchange(
            STATUS_OPEN,
            STATUS_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.inner.status.compare_exchange(
            STATUS_PENDING,
            STATUS_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.io.close(self.id(), notifier);
        receipt
    }
}

/// Listener yang sudah ter-bind
pub struct Listener {
    id: ChannelId,
    local_addr: SocketAddr,
    io: Arc<dyn ChannelIo>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Listener {
    pub fn new(id: ChannelId, local_addr: SocketAddr, io: Arc<dyn ChannelIo>) -> Self {
        Self {
            id,
            local_addr,
            io,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tutup listener saja; koneksi yang sudah ada tetap terbuka
    pub fn close(self) -> CloseReceipt {
        let (receipt, notifier) = CloseReceipt::pair();
        self.io.close(self.id, notifier);
        receipt
    }
}

/// Sisi transport dari notifikasi close
pub struct CloseNotifier {
    tx: SyncSender<io::Result<()>>,
}

impl CloseNotifier {
    pub fn notify(self, result: io::Result<()>) {
        let _ = self.tx.send(result);
    }
}

/// Completion signal untuk satu permintaan close
pub struct CloseReceipt {
    rx: Receiver<io::Result<()>>,
}

impl CloseReceipt {
    pub fn pair() -> (Self, CloseNotifier) {
        let (tx, rx) = mpsc::sync_channel(1);
        (Self { rx }, CloseNotifier { tx })
    }

    /// Block sampai close selesai.
    ///
    /// Notifier yang di-drop tanpa kabar (engine sudah berhenti) dianggap
    /// sebagai close yang berhasil.
    pub fn wait(self, timeout: Duration) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(())) | Err(RecvTimeoutError::Disconnected) => Ok(()),
            Ok(Err(e)) => Err(Error::Close(e)),
            Err(RecvTimeoutError::Timeout) => Err(Error::Close(io::Error::new(
                io::ErrorKind::TimedOut,
                "close did not complete in time",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingIo {
        writes: Mutex<Vec<(ChannelId, Bytes)>>,
        resumed: Mutex<Vec<ChannelId>>,
    }

    impl ChannelIo for RecordingIo {
        fn write(&self, id: ChannelId, bytes: Bytes) -> io::Result<()> {
            self.writes.lock().push((id, bytes));
            Ok(())
        }

        fn close(&self, _id: ChannelId, done: CloseNotifier) {
            done.notify(Ok(()));
        }

        fn resume(&self, id: ChannelId) {
            self.resumed.lock().push(id);
        }
    }

    #[test]
    fn test_pending_channel_rejects_writes() {
        let io = Arc::new(RecordingIo::default());
        let channel = Channel::new(ChannelId(4), None, io.clone());

        let err = channel.write(Bytes::from_static(b"x\n")).unwrap_err();
        assert!(matches!(err, Error::NotWritable(ChannelId(4))));

        channel.mark_open();
        channel.write(Bytes::from_static(b"x\n")).unwrap();
        assert_eq!(io.writes.lock().len(), 1);
    }

    #[test]
    fn test_closed_channel_rejects_writes_and_closes_immediately() {
        let io = Arc::new(RecordingIo::default());
        let channel = Channel::new(ChannelId(1), None, io.clone());
        channel.mark_open();
        channel.mark_closed();

        assert!(channel.write(Bytes::from_static(b"late\n")).is_err());
        channel.close().wait(Duration::from_millis(10)).unwrap();
        assert!(io.writes.lock().is_empty());
    }

    #[test]
    fn test_close_marks_closing() {
        let io = Arc::new(RecordingIo::default());
        let channel = Channel::new(ChannelId(2), None, io);
        channel.mark_open();

        channel.close().wait(Duration::from_millis(10)).unwrap();
        assert!(!channel.is_writable());
    }

    #[test]
    fn test_receipt_timeout_and_dropped_notifier() {
        let (receipt, notifier) = CloseReceipt::pair();
        let err = receipt.wait(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, Error::Close(_)));
        drop(notifier);

        let (receipt, notifier) = CloseReceipt::pair();
        drop(notifier);
        assert!(receipt.wait(Duration::from_millis(5)).is_ok());
    }
}
