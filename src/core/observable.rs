//! Current-value observable
//!
//! Menyimpan nilai terakhir dan daftar subscriber. Subscriber baru langsung
//! menerima nilai terakhir, lalu setiap update berikutnya sesuai urutan publish.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

struct Inner<T> {
    value: T,
    subscribers: Vec<Sender<T>>,
}

/// Holder nilai terakhir + fan-out ke subscriber
///
/// Clone murah (shared `Arc`). Publish dilakukan di bawah lock sehingga
/// urutan yang dilihat setiap subscriber sama dengan urutan publish.
pub struct StateCell<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> StateCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Nilai terakhir
    pub fn get(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// Simpan nilai baru dan kirim ke semua subscriber yang masih hidup
    pub fn publish(&self, value: T) {
        let mut inner = self.inner.lock();
        inner
            .subscribers
            .retain(|tx| tx.send(value.clone()).is_ok());
        inner.value = value;
    }

    /// Subscribe: nilai terakhir dikirim langsung
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.inner.lock();
        // Receiver masih di tangan kita, send tidak mungkin gagal
        let _ = tx.send(inner.value.clone());
        inner.subscribers.push(tx);
        Subscription { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Stream update dari satu `StateCell`
///
/// Drop subscription untuk berhenti menerima; sender-nya dibersihkan pada
/// publish berikutnya.
pub struct Subscription<T> {
    rx: Receiver<T>,
}

impl<T> Subscription<T> {
    /// Tunggu update berikutnya. `None` jika cell sudah tidak ada.
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Tunggu update dengan batas waktu
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Update yang sudah tersedia, tanpa blocking
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Tunggu sampai `predicate` terpenuhi atau timeout habis
    pub fn wait_for(&self, timeout: Duration, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let value = self.recv_timeout(remaining)?;
            if predicate(&value) {
                return Some(value);
            }
        }
    }
}

impl<T> Iterator for Subscription<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.recv()
    }
}
