//! # linewire
//!
//! Line-delimited text protocol di atas TCP, untuk peran client (satu
//! koneksi keluar) dan server (banyak koneksi masuk).
//!
//! - `protocol`: framing byte stream → pesan UTF-8
//! - `core`: serial execution context dan observable state
//! - `network`: event engine mio, state machine, registry, facade
//! - `config`: konfigurasi engine, client dan server

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};
