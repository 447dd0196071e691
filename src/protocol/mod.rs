//! Protocol Layer: Line-Delimited UTF-8 Framing
//!
//! Prinsip desain:
//! - Satu delimiter byte per koneksi (default `\n`), tidak dinegosiasi ulang
//! - Tidak ada length prefix, tidak ada escaping
//! - Partial frame tidak pernah dibuang (kecuali melewati batas panjang)

mod frame;

pub use frame::{
    FrameDecoder, FrameEncoder, FrameError, Frames, DEFAULT_DELIMITER, DEFAULT_MAX_FRAME_LENGTH,
};
