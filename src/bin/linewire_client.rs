//! Linewire Client
//!
//! Membaca baris dari stdin, mengirimnya ke server, dan mencetak setiap
//! baris yang diterima.
//!
//! Usage:
//!   cargo run --release --bin linewire_client -- --host 127.0.0.1 --port 9999

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use linewire::config::ClientConfig;
use linewire::network::{Client, ClientContext, ConnectionState, HandlerResult};

#[derive(Parser, Debug)]
#[command(name = "linewire_client")]
#[command(about = "Line-delimited client: stdin → server, server → stdout")]
struct Args {
    #[arg(long, env = "LINEWIRE_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, env = "LINEWIRE_PORT", default_value_t = 9999)]
    port: u16,

    /// Batas tunggu connect (detik)
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    /// Batas panjang satu baris (bytes); 0 = tanpa batas
    #[arg(long, default_value_t = 1024 * 1024)]
    max_line: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("linewire=warn".parse()?))
        .init();

    let args = Args::parse();

    let config =
        ClientConfig::default().max_frame_length((args.max_line > 0).then_some(args.max_line));
    let client = Client::new(config).context("failed to start client")?;
    let states = client.subscribe();

    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);
    client.connect(
        &args.host,
        args.port,
        move |_ctx: &ClientContext, message: String| -> HandlerResult {
            counter.fetch_add(1, Ordering::Relaxed);
            println!("{message}");
            Ok(())
        },
    )?;

    let connected = states.wait_for(Duration::from_secs(args.connect_timeout), |s| {
        matches!(s, ConnectionState::Connected | ConnectionState::Error(_))
    });
    match connected {
        Some(ConnectionState::Connected) => {
            eprintln!("✅ Connected to {}:{}", args.host, args.port);
        }
        Some(state) => {
            client.shutdown()?;
            bail!("❌ Connect failed: {state}");
        }
        None => {
            client.shutdown()?;
            bail!("❌ Connect timed out after {}s", args.connect_timeout);
        }
    }

    // Server menutup koneksi → keluar
    let closing = Arc::new(AtomicBool::new(false));
    let watch_closing = Arc::clone(&closing);
    thread::Builder::new()
        .name("state-watch".into())
        .spawn(move || {
            for state in states {
                if watch_closing.load(Ordering::Acquire) {
                    return;
                }
                if matches!(state, ConnectionState::Disconnected | ConnectionState::Error(_)) {
                    eprintln!("⚠️  Connection ended: {state}");
                    std::process::exit(1);
                }
            }
        })?;

    let stdin = io::stdin();
    let mut sent = 0u64;
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        client.send(line)?;
        sent += 1;
    }

    closing.store(true, Ordering::Release);
    client.shutdown()?;
    eprintln!(
        "📊 Sent {} lines, received {}",
        sent,
        received.load(Ordering::Relaxed)
    );
    Ok(())
}
