//! # Polygon Stream Live Test
//!
//! Streams aggregates for a set of symbols through the multiplexer and
//! prints per-symbol message rates over the last minute. Needs
//! `POLYGON_API_KEY` (a `.env` file is honoured).

use chrono::{Duration, Utc};
use clap::Parser;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::sleep;

use lib_marketfeed::{FeedError, Handlers, Multiplexer, MultiplexerConfig};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Polygon API key
    #[clap(long, env = "POLYGON_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Symbols to stream
    #[clap(long, value_delimiter = ',', default_value = "AAPL,MSFT,NVDA,AMZN,GOOGL,META,TSLA,AVGO")]
    symbols: Vec<String>,

    /// Use the real-time cluster instead of the delayed one
    #[clap(long)]
    realtime: bool,

    /// Per-minute aggregates (AM) instead of per-second (A)
    #[clap(long)]
    minute: bool,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_seconds: u64,
}

#[derive(Default)]
struct Stats {
    global_timestamps: VecDeque<chrono::DateTime<Utc>>,
    symbol_timestamps: HashMap<String, VecDeque<chrono::DateTime<Utc>>>,
    last_price: HashMap<String, f64>,
}

fn lock(stats: &Mutex<Stats>) -> std::sync::MutexGuard<'_, Stats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = MultiplexerConfig::for_feed(args.api_key.clone(), args.realtime);
    if args.minute {
        config.channel_prefix = "AM".to_string();
    }
    let mux = Multiplexer::new(config);

    println!("Connecting to {}...", mux.config().url);
    match mux.connect().await {
        Ok(()) => println!("Authenticated."),
        Err(FeedError::AuthenticationFailed(reason)) => {
            eprintln!("\n[ERROR] Authentication failed: {}", reason);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("\n[ERROR] Connect failed: {}", e);
            std::process::exit(1);
        }
    }

    let stats = Arc::new(Mutex::new(Stats::default()));
    let mut handles = Vec::new();
    for symbol in &args.symbols {
        let stats = Arc::clone(&stats);
        let handler = Handlers::new(move |tick| {
            let now = Utc::now();
            let mut data = lock(&stats);
            data.global_timestamps.push_back(now);
            data.symbol_timestamps
                .entry(tick.ticker.clone())
                .or_default()
                .push_back(now);
            data.last_price.insert(tick.ticker.clone(), tick.price);
        })
        .on_error(|e| eprintln!("[WARN] {}", e))
        .on_disconnect(|| eprintln!("[WARN] Upstream disconnected"));
        handles.push(mux.subscribe(symbol, Arc::new(handler)));
    }
    println!("Subscribed to {} symbols. Press Ctrl+C to stop.", handles.len());

    let stats_reporter = Arc::clone(&stats);
    let reporter_mux = mux.clone();
    let report_interval = std::time::Duration::from_secs(args.report_interval_seconds.max(1));
    let reporter = tokio::spawn(async move {
        loop {
            sleep(report_interval).await;
            let now = Utc::now();
            let one_minute_ago = now - Duration::minutes(1);

            let mut data = lock(&stats_reporter);

            while data.global_timestamps.front().is_some_and(|&t| t < one_minute_ago) {
                data.global_timestamps.pop_front();
            }
            let global_rate = data.global_timestamps.len();

            let mut rates: Vec<(String, usize, f64)> = Vec::new();
            let Stats { symbol_timestamps, last_price, .. } = &mut *data;
            for (symbol, dq) in symbol_timestamps.iter_mut() {
                while dq.front().is_some_and(|&t| t < one_minute_ago) {
                    dq.pop_front();
                }
                if !dq.is_empty() {
                    rates.push((symbol.clone(), dq.len(), last_price.get(symbol).copied().unwrap_or_default()));
                }
            }

            // Busiest first
            rates.sort_by(|a, b| b.1.cmp(&a.1));

            let report = rates
                .iter()
                .map(|(s, r, p)| format!("{}: {} msg/min @ {:.2}", s, r, p))
                .collect::<Vec<_>>()
                .join(", ");

            let status = reporter_mux.status();
            println!("\n----- 1-Minute Summary -----");
            println!("Upstream: {:?} (delayed: {})", status.state, status.live_data_delayed);
            println!("Global rate: {} msg/min", global_rate);
            println!("Symbols: {}", if report.is_empty() { "No data" } else { &report });
            println!("----------------------------\n");
        }
    });

    tokio::signal::ctrl_c().await?;
    reporter.abort();
    for handle in handles {
        handle.unsubscribe();
    }
    mux.disconnect();
    println!("Stopped.");
    Ok(())
}
