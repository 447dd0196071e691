//! Network Layer: Transport, Engine dan Facade
//!
//! Lapisan dari bawah ke atas:
//! - `transport`: trait sempit antara core dan engine
//! - `engine` + `connection`: mio worker group (epoll/kqueue/IOCP)
//! - `state` + `registry`: state machine client dan registry server
//! - `dispatch`: pool handler, terpisah dari jalur read
//! - `client` / `server`: facade publik dengan serial context masing-masing

mod client;
mod connection;
mod dispatch;
mod engine;
mod identity;
mod registry;
mod server;
mod state;
mod transport;

pub use client::{Client, ClientContext};
pub use dispatch::{ClientHandler, Dispatcher, HandlerError, HandlerResult, ServerHandler};
pub use engine::EventLoopGroup;
pub use identity::ClientIdentity;
pub use registry::{ConnectedClient, ConnectionRegistry};
pub use server::{Server, ServerContext};
pub use state::{ConnectionEvent, ConnectionState, ConnectionStateMachine, ServerListeningState};
pub use transport::{
    Acceptor, Channel, ChannelHandler, ChannelId, ChannelIo, CloseNotifier, CloseReceipt,
    Listener, Transport,
};
