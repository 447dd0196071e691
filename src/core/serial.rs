//! Serial execution context
//!
//! Satu thread memiliki state `S` secara eksklusif. Semua operasi publik dan
//! callback lifecycle dikirim sebagai job ke antrian FIFO thread ini, jadi
//! map dan state bersama tidak butuh lock.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;

use crate::error::{Error, Result};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Envelope<S> {
    Run(Job<S>),
    Stop,
}

struct Shared {
    name: String,
    thread_id: ThreadId,
    stopped: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle ke serial context. Clone murah; semua clone menunjuk ke thread
/// yang sama.
pub struct SerialExecutor<S> {
    tx: Sender<Envelope<S>>,
    shared: Arc<Shared>,
}

impl<S> Clone for SerialExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: 'static> SerialExecutor<S> {
    /// Spawn thread baru yang memiliki `state`
    pub fn spawn(name: impl Into<String>, state: S) -> Result<Self>
    where
        S: Send,
    {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Envelope<S>>();

        let loop_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(&loop_name, state, rx))?;

        let shared = Arc::new(Shared {
            name,
            thread_id: handle.thread().id(),
            stopped: AtomicBool::new(false),
            thread: Mutex::new(Some(handle)),
        });

        Ok(Self { tx, shared })
    }

    /// Apakah thread saat ini adalah serial context ini
    #[inline]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Enqueue job (fire-and-forget)
    pub fn submit(&self, job: impl FnOnce(&mut S) + Send + 'static) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::TornDown);
        }
        self.tx
            .send(Envelope::Run(Box::new(job)))
            .map_err(|_| Error::TornDown)
    }

    /// Enqueue job dan block sampai hasilnya tersedia
    pub fn call<R: Send + 'static>(
        &self,
        job: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R> {
        if self.is_current() {
            return Err(Error::SerialContext);
        }

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.submit(move |state| {
            let _ = reply_tx.send(job(state));
        })?;
        reply_rx.recv().map_err(|_| Error::TornDown)
    }

    /// Jalankan `job` sebagai job terakhir, lalu hentikan thread.
    ///
    /// Job yang sudah ada di antrian tetap dijalankan lebih dulu. Setelah
    /// ini semua `submit` gagal dengan `Error::TornDown`.
    pub fn finish<R: Send + 'static>(
        &self,
        job: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R> {
        if self.is_current() {
            return Err(Error::SerialContext);
        }
        // Dipegang sampai thread di-join; `join` menunggu lock ini
        let mut handle_slot = self.shared.thread.lock();
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return Err(Error::TornDown);
        }

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let queued = self
            .tx
            .send(Envelope::Run(Box::new(move |state: &mut S| {
                let _ = reply_tx.send(job(state));
            })))
            .and_then(|_| self.tx.send(Envelope::Stop));
        if queued.is_err() {
            return Err(Error::TornDown);
        }

        let result = reply_rx.recv().map_err(|_| Error::TornDown);
        if let Some(handle) = handle_slot.take() {
            if handle.join().is_err() {
                tracing::error!(context = %self.shared.name, "serial context thread panicked");
            }
        }
        result
    }

    /// Block sampai `finish` yang sedang berjalan (di thread lain) selesai
    /// dan thread serial context sudah berhenti. Langsung kembali jika
    /// `finish` belum pernah dipanggil.
    pub fn join(&self) {
        if !self.is_current() {
            drop(self.shared.thread.lock());
        }
    }
}

fn run_loop<S>(name: &str, mut state: S, rx: Receiver<Envelope<S>>) {
    tracing::debug!(context = name, "serial context started");

    while let Ok(envelope) = rx.recv() {
        match envelope {
            Envelope::Run(job) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&mut state)));
                if outcome.is_err() {
                    tracing::error!(context = name, "job panicked in serial context");
                }
            }
            Envelope::Stop => break,
        }
    }

    tracing::debug!(context = name, "serial context stopped");
}
