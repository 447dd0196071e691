//! Linewire Echo Server
//!
//! Setiap baris yang diterima dikirim balik ke client pengirimnya.
//! Dengan `--broadcast`, baris diteruskan ke semua client.
//!
//! Usage:
//!   cargo run --release --bin linewire_server -- [OPTIONS]
//!   RUST_LOG=linewire=debug cargo run --bin linewire_server

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use linewire::config::{EngineConfig, EngineSource, IdentityPolicy, ServerConfig};
use linewire::network::{
    ClientIdentity, HandlerResult, Server, ServerContext, ServerListeningState,
};

#[derive(Parser, Debug)]
#[command(name = "linewire_server")]
#[command(about = "Line-delimited echo server")]
struct Args {
    /// Alamat IP untuk bind
    #[arg(long, env = "LINEWIRE_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, env = "LINEWIRE_PORT", default_value_t = 9999)]
    port: u16,

    /// Worker thread event engine
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Thread untuk handler pesan
    #[arg(long, default_value_t = 4)]
    dispatch_threads: usize,

    /// Batas panjang satu baris (bytes); 0 = tanpa batas
    #[arg(long, default_value_t = 1024 * 1024)]
    max_line: usize,

    /// Kirim setiap baris ke semua client, bukan hanya pengirimnya
    #[arg(long)]
    broadcast: bool,

    /// Pakai alamat peer sebagai identitas client
    #[arg(long)]
    named: bool,

    /// Interval cetak statistik (detik)
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,
}

/// Server statistics
#[derive(Default)]
struct Stats {
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl Stats {
    fn print(&self, uptime: Duration, clients: usize) {
        let msgs = self.messages.load(Ordering::Relaxed);
        let bytes = self.bytes.load(Ordering::Relaxed);
        let rate = msgs as f64 / uptime.as_secs_f64().max(1e-9);

        println!("\n📊 Server Stats (uptime: {:.1}s)", uptime.as_secs_f64());
        println!("   Messages:      {} ({:.1}/sec)", msgs, rate);
        println!("   Bytes in:      {} KB", bytes / 1024);
        println!("   Clients:       {}", clients);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("linewire=info".parse()?))
        .init();

    let args = Args::parse();

    println!("🚀 Linewire Echo Server");
    println!("=======================");
    println!("   Bind:      {}", SocketAddr::new(args.bind, args.port));
    println!("   Workers:   {}", args.workers);
    println!("   Mode:      {}", if args.broadcast { "broadcast" } else { "echo" });

    let mut config = ServerConfig::default()
        .engine(EngineSource::Owned(
            EngineConfig::default().worker_threads(args.workers),
        ))
        .bind_ip(args.bind)
        .dispatch_threads(args.dispatch_threads)
        .max_frame_length((args.max_line > 0).then_some(args.max_line));
    if args.named {
        config = config.identity(IdentityPolicy::Named(Arc::new(|addr: SocketAddr| {
            addr.to_string()
        })));
    }

    let server = Server::new(config).context("failed to start server")?;
    let stats = Arc::new(Stats::default());
    let states = server.subscribe();

    let handler_stats = Arc::clone(&stats);
    let broadcast = args.broadcast;
    server.listen(
        args.port,
        move |ctx: &ServerContext, client: &ClientIdentity, message: String| -> HandlerResult {
            handler_stats.messages.fetch_add(1, Ordering::Relaxed);
            handler_stats
                .bytes
                .fetch_add(message.len() as u64 + 1, Ordering::Relaxed);

            if broadcast {
                ctx.broadcast(message)?;
            } else {
                ctx.send(message, Some(client.clone()))?;
            }
            Ok(())
        },
    )?;

    let start = Instant::now();
    let interval = Duration::from_secs(args.stats_interval.max(1));
    let mut last_stats = Instant::now();

    loop {
        match states.recv_timeout(interval) {
            Some(ServerListeningState::Error(cause)) => {
                server.shutdown()?;
                bail!("server failed: {cause}");
            }
            Some(state) => {
                tracing::info!(state = %state, clients = server.clients().len(), "server state");
            }
            None => {}
        }

        if last_stats.elapsed() >= interval {
            stats.print(start.elapsed(), server.clients().len());
            last_stats = Instant::now();
        }
    }
}
