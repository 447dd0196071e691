//! Core module: primitif konkurensi
//!
//! Prinsip desain:
//! - Serial context: satu thread memiliki state, tanpa lock di map bersama
//! - Observable: nilai terakhir + update berurutan untuk subscriber

mod observable;
mod serial;

pub use observable::{StateCell, Subscription};
pub use serial::SerialExecutor;
