//! Event engine dengan mio worker group
//!
//! Setiap worker punya `Poll`, `Waker` dan antrian command sendiri.
//! Koneksi di-pin ke satu worker (round-robin) selama hidupnya, jadi state
//! per-koneksi (termasuk FrameBuffer di handler) hanya disentuh satu thread.
//!
//! Alur:
//! - Handle (`Channel`, `Listener`) mengirim `Command` ke worker pemilik
//!   lalu membangunkan `Poll` lewat `Waker`
//! - Worker memanggil callback `ChannelHandler` untuk setiap event
//! - Accept terjadi di worker listener, koneksi baru diserahkan ke worker
//!   target dalam keadaan pause

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use super::connection::{configure_socket, Connection, ReadOutcome};
use super::transport::{
    Acceptor, Channel, ChannelHandler, ChannelId, ChannelIo, CloseNotifier, Listener, Transport,
};
use crate::config::{EngineConfig, EngineSource};

const WAKER_TOKEN: Token = Token(usize::MAX);

enum Command {
    Connect {
        addr: SocketAddr,
        channel: Channel,
        handler: Box<dyn ChannelHandler>,
    },
    Adopt {
        stream: TcpStream,
        channel: Channel,
        handler: Box<dyn ChannelHandler>,
    },
    Listen {
        id: ChannelId,
        listener: TcpListener,
        acceptor: Box<dyn Acceptor>,
    },
    Write {
        id: ChannelId,
        bytes: Bytes,
    },
    Resume {
        id: ChannelId,
    },
    Close {
        id: ChannelId,
        done: CloseNotifier,
    },
    Shutdown,
}

/// Sisi pengirim command ke satu worker
struct WorkerIo {
    tx: Sender<Command>,
    waker: Waker,
}

impl WorkerIo {
    fn send(&self, command: Command) -> io::Result<()> {
        self.tx
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "event loop stopped"))?;
        self.waker.wake()
    }
}

impl ChannelIo for WorkerIo {
    fn write(&self, id: ChannelId, bytes: Bytes) -> io::Result<()> {
        self.send(Command::Write { id, bytes })
    }

    fn close(&self, id: ChannelId, done: CloseNotifier) {
        // Worker sudah berhenti → notifier di-drop, receipt dianggap selesai
        let _ = self.send(Command::Close { id, done });
    }

    fn resume(&self, id: ChannelId) {
        let _ = self.send(Command::Resume { id });
    }
}

struct GroupShared {
    config: EngineConfig,
    workers: Vec<Arc<WorkerIo>>,
    next_id: AtomicUsize,
    next_worker: AtomicUsize,
    shut_down: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl GroupShared {
    fn next_channel_id(&self) -> ChannelId {
        ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn pick_worker(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }
}

/// Multiplexed event-driven I/O engine
///
/// Implementasi `Transport` di atas mio. Clone murah.
#[derive(Clone)]
pub struct EventLoopGroup {
    shared: Arc<GroupShared>,
}

impl EventLoopGroup {
    /// Start worker thread sesuai `config.worker_threads`
    pub fn start(config: EngineConfig) -> io::Result<Self> {
        let count = config.worker_threads.max(1);
        let mut polls = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);

        for _ in 0..count {
            let poll = Poll::new()?;
            let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
            let (tx, rx) = mpsc::channel();
            workers.push(Arc::new(WorkerIo { tx, waker }));
            polls.push((poll, rx));
        }

        let shared = Arc::new(GroupShared {
            config,
            workers,
            next_id: AtomicUsize::new(1),
            next_worker: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            threads: Mutex::new(Vec::with_capacity(count)),
        });

        for (index, (poll, rx)) in polls.into_iter().enumerate() {
            let worker = Worker::new(index, poll, rx, Arc::clone(&shared));
            let handle = thread::Builder::new()
                .name(format!("linewire-io-{index}"))
                .spawn(move || worker.run())?;
            shared.threads.lock().push(handle);
        }

        tracing::debug!(workers = count, "event loop group started");
        Ok(Self { shared })
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }
}

impl Transport for EventLoopGroup {
    fn connect(&self, addr: SocketAddr, handler: Box<dyn ChannelHandler>) -> Channel {
        let index = self.shared.pick_worker();
        let io = Arc::clone(&self.shared.workers[index]);
        let channel = Channel::new(self.shared.next_channel_id(), Some(addr), io.clone());

        let command = Command::Connect {
            addr,
            channel: channel.clone(),
            handler,
        };
        match io.tx.send(command) {
            Ok(()) => {
                if let Err(e) = io.waker.wake() {
                    tracing::warn!(%addr, error = %e, "failed to wake event loop");
                }
            }
            Err(mpsc::SendError(command)) => {
                // Engine sudah berhenti: laporkan langsung ke handler
                tracing::warn!(%addr, "connect on stopped event loop");
                channel.mark_closed();
                if let Command::Connect { mut handler, .. } = command {
                    handler.connect_failed(
                        &channel,
                        io::Error::new(io::ErrorKind::BrokenPipe, "event loop stopped"),
                    );
                }
            }
        }
        channel
    }

    fn bind(&self, addr: SocketAddr, acceptor: Box<dyn Acceptor>) -> io::Result<Listener> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let id = self.shared.next_channel_id();

        let index = self.shared.pick_worker();
        let io = Arc::clone(&self.shared.workers[index]);
        io.send(Command::Listen {
            id,
            listener,
            acceptor,
        })?;

        Ok(Listener::new(id, local_addr, io))
    }

    fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for io in &self.shared.workers {
            let _ = io.send(Command::Shutdown);
        }

        let current = thread::current().id();
        let handles: Vec<_> = self.shared.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("event loop worker panicked");
            }
        }
        tracing::debug!("event loop group stopped");
    }
}

impl EngineSource {
    /// Engine untuk facade, plus flag apakah facade yang memilikinya
    pub(crate) fn acquire(self) -> io::Result<(Arc<dyn Transport>, bool)> {
        match self {
            Self::Owned(config) => Ok((Arc::new(EventLoopGroup::start(config)?), true)),
            Self::Shared(transport) => Ok((transport, false)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    /// Sudah established, belum boleh membaca
    Paused,
    Active,
}

struct Slot {
    conn: Connection,
    channel: Channel,
    handler: Box<dyn ChannelHandler>,
    phase: Phase,
    close_waiters: Vec<CloseNotifier>,
}

struct ListenerSlot {
    listener: TcpListener,
    acceptor: Box<dyn Acceptor>,
}

struct Worker {
    index: usize,
    poll: Poll,
    rx: Receiver<Command>,
    shared: Arc<GroupShared>,
    slots: HashMap<Token, Slot>,
    listeners: HashMap<Token, ListenerSlot>,
    read_buffer: Box<[u8]>,
}

impl Worker {
    fn new(index: usize, poll: Poll, rx: Receiver<Command>, shared: Arc<GroupShared>) -> Self {
        let read_buffer = vec![0u8; shared.config.read_buffer_size.max(1)].into_boxed_slice();
        Self {
            index,
            poll,
            rx,
            shared,
            slots: HashMap::new(),
            listeners: HashMap::new(),
            read_buffer,
        }
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(self.shared.config.events_capacity);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(worker = self.index, error = %e, "poll failed, stopping worker");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    token if self.listeners.contains_key(&token) => self.accept_connections(token),
                    token => self.handle_event(token, event),
                }
            }

            if !self.drain_commands() {
                break;
            }
        }

        self.close_everything();
    }

    /// Returns `false` jika worker harus berhenti
    fn drain_commands(&mut self) -> bool {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Connect {
                    addr,
                    channel,
                    handler,
                } => self.start_connect(addr, channel, handler),
                Command::Adopt {
                    stream,
                    channel,
                    handler,
                } => self.adopt(stream, channel, handler),
                Command::Listen {
                    id,
                    listener,
                    acceptor,
                } => self.start_listening(id, listener, acceptor),
                Command::Write { id, bytes } => self.write(Token(id.0), &bytes),
                Command::Resume { id } => self.resume(Token(id.0)),
                Command::Close { id, done } => self.close(Token(id.0), done),
                Command::Shutdown => return false,
            }
        }
        true
    }

    fn start_connect(&mut self, addr: SocketAddr, channel: Channel, mut handler: Box<dyn ChannelHandler>) {
        let token = Token(channel.id().0);
        let stream = TcpStream::connect(addr).and_then(|mut stream| {
            self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
            Ok(stream)
        });

        match stream {
            Ok(stream) => {
                tracing::debug!(worker = self.index, channel = %channel.id(), %addr, "connecting");
                self.slots.insert(
                    token,
                    Slot {
                        conn: Connection::new(stream, &self.shared.config),
                        channel,
                        handler,
                        phase: Phase::Connecting,
                        close_waiters: Vec::new(),
                    },
                );
            }
            Err(e) => {
                channel.mark_closed();
                handler.connect_failed(&channel, e);
            }
        }
    }

    fn adopt(&mut self, mut stream: TcpStream, channel: Channel, mut handler: Box<dyn ChannelHandler>) {
        let token = Token(channel.id().0);
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::WRITABLE)
        {
            tracing::warn!(channel = %channel.id(), error = %e, "failed to register accepted connection");
            channel.mark_closed();
            handler.errored(&channel, e);
            handler.closed(&channel);
            return;
        }

        channel.mark_open();
        handler.established(&channel);
        self.slots.insert(
            token,
            Slot {
                conn: Connection::new(stream, &self.shared.config),
                channel,
                handler,
                phase: Phase::Paused,
                close_waiters: Vec::new(),
            },
        );
    }

    fn start_listening(&mut self, id: ChannelId, mut listener: TcpListener, mut acceptor: Box<dyn Acceptor>) {
        let token = Token(id.0);
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
        {
            acceptor.errored(e);
            return;
        }
        self.listeners.insert(token, ListenerSlot { listener, acceptor });
    }

    fn accept_connections(&mut self, token: Token) {
        let Some(slot) = self.listeners.get_mut(&token) else {
            return;
        };

        loop {
            match slot.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = configure_socket(&stream, &self.shared.config) {
                        tracing::warn!(%addr, error = %e, "failed to configure accepted socket");
                    }

                    let target = self.shared.pick_worker();
                    let io = Arc::clone(&self.shared.workers[target]);
                    let channel =
                        Channel::new(self.shared.next_channel_id(), Some(addr), io.clone());
                    let handler = slot.acceptor.accept(&channel);

                    tracing::debug!(channel = %channel.id(), %addr, worker = target, "accepted connection");
                    if let Err(e) = io.send(Command::Adopt {
                        stream,
                        channel,
                        handler,
                    }) {
                        tracing::warn!(%addr, error = %e, "dropping accepted connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    slot.acceptor.errored(e);
                    break;
                }
            }
        }
    }

    fn handle_event(&mut self, token: Token, event: &Event) {
        let Some(phase) = self.slots.get(&token).map(|s| s.phase) else {
            return;
        };

        if phase == Phase::Connecting && !self.finish_connect(token) {
            return;
        }

        if event.is_error() {
            let error = self
                .slots
                .get(&token)
                .and_then(|s| s.conn.stream().take_error().ok().flatten())
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"));
            self.fail(token, error);
            return;
        }

        if event.is_writable() {
            self.flush(token);
        }
        if event.is_readable() || event.is_read_closed() {
            self.read_available(token);
        }
    }

    /// Returns `true` jika koneksi sudah established
    fn finish_connect(&mut self, token: Token) -> bool {
        let Some(slot) = self.slots.get_mut(&token) else {
            return false;
        };

        let failure = match slot.conn.stream().take_error() {
            Ok(Some(e)) | Err(e) => Some(e),
            Ok(None) => match slot.conn.stream().peer_addr() {
                Ok(_) => None,
                Err(ref e) if e.kind() == io::ErrorKind::NotConnected => return false,
                Err(e) => Some(e),
            },
        };

        if let Some(error) = failure {
            if let Some(mut slot) = self.slots.remove(&token) {
                let _ = self.poll.registry().deregister(slot.conn.stream_mut());
                slot.channel.mark_closed();
                slot.handler.connect_failed(&slot.channel, error);
                for waiter in slot.close_waiters.drain(..) {
                    waiter.notify(Ok(()));
                }
            }
            return false;
        }

        if let Err(e) = configure_socket(slot.conn.stream(), &self.shared.config) {
            tracing::warn!(channel = %slot.channel.id(), error = %e, "failed to configure socket");
        }
        slot.phase = Phase::Active;
        slot.channel.mark_open();
        tracing::debug!(channel = %slot.channel.id(), "connection established");
        slot.handler.established(&slot.channel);
        true
    }

    fn read_available(&mut self, token: Token) {
        let Worker {
            slots, read_buffer, ..
        } = self;
        let Some(slot) = slots.get_mut(&token) else {
            return;
        };
        if slot.phase != Phase::Active {
            return;
        }

        let outcome = loop {
            match slot.conn.read_chunk(read_buffer) {
                Ok(ReadOutcome::Data(n)) => slot.handler.read(&slot.channel, &read_buffer[..n]),
                Ok(ReadOutcome::WouldBlock) => break None,
                Ok(ReadOutcome::Eof) => break Some(Ok(())),
                Err(e) => break Some(Err(e)),
            }
        };

        match outcome {
            None => {}
            Some(Ok(())) => {
                tracing::debug!(channel = %slot.channel.id(), "peer closed connection");
                self.close_slot(token, Vec::new());
            }
            Some(Err(e)) => self.fail(token, e),
        }
    }

    fn flush(&mut self, token: Token) {
        let Some(slot) = self.slots.get_mut(&token) else {
            return;
        };
        if let Err(e) = slot.conn.flush_write_buffer() {
            self.fail(token, e);
        }
    }

    fn write(&mut self, token: Token, bytes: &[u8]) {
        let Some(slot) = self.slots.get_mut(&token) else {
            tracing::trace!(channel = token.0, "write for closed connection dropped");
            return;
        };
        if slot.phase == Phase::Connecting {
            tracing::warn!(channel = %slot.channel.id(), "write before connection established dropped");
            return;
        }

        match slot.conn.queue_write(bytes) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    channel = %slot.channel.id(),
                    pending = slot.conn.write_pending(),
                    "write buffer full, message dropped"
                );
            }
            Err(e) => self.fail(token, e),
        }
    }

    fn resume(&mut self, token: Token) {
        let Some(slot) = self.slots.get_mut(&token) else {
            return;
        };
        if slot.phase != Phase::Paused {
            return;
        }

        if let Err(e) = self.poll.registry().reregister(
            slot.conn.stream_mut(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.fail(token, e);
            return;
        }
        slot.phase = Phase::Active;

        // Data bisa sudah menunggu sebelum register READABLE
        self.read_available(token);
    }

    fn close(&mut self, token: Token, done: CloseNotifier) {
        if let Some(slot) = self.listeners.remove(&token) {
            let mut listener = slot.listener;
            let result = self.poll.registry().deregister(&mut listener);
            tracing::debug!(listener = token.0, "listener closed");
            done.notify(result);
            return;
        }

        if self.slots.contains_key(&token) {
            self.close_slot(token, vec![done]);
        } else {
            done.notify(Ok(()));
        }
    }

    /// Error I/O: laporkan ke handler lalu tutup koneksi
    fn fail(&mut self, token: Token, error: io::Error) {
        if let Some(slot) = self.slots.get_mut(&token) {
            tracing::debug!(channel = %slot.channel.id(), error = %error, "connection error");
            slot.handler.errored(&slot.channel, error);
        }
        self.close_slot(token, Vec::new());
    }

    fn close_slot(&mut self, token: Token, mut waiters: Vec<CloseNotifier>) {
        let Some(mut slot) = self.slots.remove(&token) else {
            for waiter in waiters {
                waiter.notify(Ok(()));
            }
            return;
        };

        if slot.conn.write_pending() > 0 {
            let _ = slot.conn.flush_write_buffer();
        }

        let deregistered = self.poll.registry().deregister(slot.conn.stream_mut());
        if let Err(e) = slot.conn.shutdown() {
            tracing::trace!(channel = %slot.channel.id(), error = %e, "socket shutdown failed");
        }

        slot.channel.mark_closed();
        slot.handler.closed(&slot.channel);
        tracing::debug!(worker = self.index, channel = %slot.channel.id(), "connection closed");

        waiters.append(&mut slot.close_waiters);
        for waiter in waiters {
            waiter.notify(match &deregistered {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }
    }

    fn close_everything(&mut self) {
        let tokens: Vec<Token> = self.slots.keys().copied().collect();
        for token in tokens {
            self.close_slot(token, Vec::new());
        }
        for (_, mut slot) in self.listeners.drain() {
            let _ = self.poll.registry().deregister(&mut slot.listener);
        }
        // Command yang tersisa: notifier close di-drop → dianggap selesai
        while let Ok(command) = self.rx.try_recv() {
            if let Command::Connect {
                channel,
                mut handler,
                ..
            } = command
            {
                channel.mark_closed();
                handler.connect_failed(
                    &channel,
                    io::Error::new(io::ErrorKind::BrokenPipe, "event loop stopped"),
                );
            }
        }
        tracing::debug!(worker = self.index, "worker stopped");
    }
}
