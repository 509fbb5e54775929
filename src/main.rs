use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use ulid::Ulid;

use allocra::config::Config;
use allocra::engine::{BookingEngine, EngineError};
use allocra::model::{RoomKind, RoomStatus};
use allocra::store::Store;

#[derive(Parser)]
#[command(name = "allocra", version, about = "Room booking allocation engine")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host the store: run the compactor and metrics exporter until shutdown.
    Serve,
    /// Register a bookable room.
    AddRoom {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 1)]
        capacity: u32,
        #[arg(long, value_enum, default_value_t = KindArg::Shared)]
        kind: KindArg,
    },
    /// Request a room; approved or rejected immediately.
    Book(Request),
    /// Record a pending booking for a later approve or reject.
    Submit(Request),
    /// Approve a pending booking.
    Approve { id: Ulid },
    /// Reject a pending booking.
    Reject { id: Ulid },
    /// Force-allocate a booking, displacing overlapping approved bookings.
    Force { id: Ulid },
    /// Approved usage per room this month.
    Usage {
        #[arg(long)]
        json: bool,
    },
    /// Dashboard counters.
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Rewrite the WAL to its minimal form.
    Compact,
    /// Delete every booking (rooms are kept).
    Reset,
}

#[derive(Args)]
struct Request {
    #[arg(long)]
    room: Ulid,
    #[arg(long)]
    requester: Ulid,
    /// RFC 3339 start instant.
    #[arg(long)]
    start: DateTime<Utc>,
    /// RFC 3339 end instant.
    #[arg(long)]
    end: DateTime<Utc>,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Shared,
    Exclusive,
}

impl From<KindArg> for RoomKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Shared => RoomKind::Shared,
            KindArg::Exclusive => RoomKind::Exclusive,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::load_from(cli.config.as_deref()).context("loading configuration")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    let store = Store::open(&config.wal_path())
        .with_context(|| format!("opening {}", config.wal_path().display()))?;
    let engine = BookingEngine::new(store.clone(), config.timeouts);

    match cli.command {
        Command::Serve => serve(store, &config).await?,
        Command::AddRoom {
            name,
            capacity,
            kind,
        } => {
            let room = store
                .register_room(name, capacity, kind.into(), RoomStatus::Online)
                .await?;
            println!("{}", room.id);
        }
        Command::Book(req) => {
            let result = engine
                .create(
                    req.room,
                    req.requester,
                    req.start.timestamp_millis(),
                    req.end.timestamp_millis(),
                )
                .await;
            match result {
                Ok(b) => println!("{} {}", b.id, b.status),
                Err(EngineError::ConflictDetected(b)) => {
                    println!("{} {}", b.id, b.status);
                    anyhow::bail!("conflict with an approved booking");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Submit(req) => {
            let b = engine
                .submit(
                    req.room,
                    req.requester,
                    req.start.timestamp_millis(),
                    req.end.timestamp_millis(),
                )
                .await?;
            println!("{} {}", b.id, b.status);
        }
        Command::Approve { id } => {
            let b = engine.approve(id).await?;
            println!("{} {}", b.id, b.status);
        }
        Command::Reject { id } => {
            engine.reject(id).await?;
            println!("{id} rejected");
        }
        Command::Force { id } => {
            let p = engine.force_allocate(id).await?;
            println!("{} approved, displaced {}", p.booking.id, p.displaced.len());
            for d in p.displaced {
                println!("  {d}");
            }
        }
        Command::Usage { json } => {
            let report = engine.monthly_usage().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for row in report {
                    println!(
                        "{:<24} {:>5} bookings {:>8.1} h",
                        row.room_name, row.approved_bookings, row.total_hours
                    );
                }
            }
        }
        Command::Stats { json } => {
            let stats = engine.system_stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("rooms:       {}", stats.total_rooms);
                println!("bookings:    {}", stats.total_bookings);
                println!("approved:    {}", stats.approved_bookings);
                println!("rejected:    {}", stats.rejected_bookings);
                println!("pending:     {}", stats.pending_bookings);
                println!("utilization: {:.1}%", stats.utilization);
            }
        }
        Command::Compact => {
            store.compact().await?;
            println!("compacted");
        }
        Command::Reset => {
            let removed = store.reset_bookings().await?;
            println!("removed {removed} bookings");
        }
    }
    Ok(())
}

async fn serve(store: Store, config: &Config) -> Result<()> {
    allocra::observability::init(config.metrics_port).context("installing metrics exporter")?;

    info!("allocra serving {}", store.path().display());
    info!("  rooms: {}", store.room_count());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let compactor = tokio::spawn(allocra::maintenance::run_compactor(
        store,
        config.compact_threshold,
        Duration::from_secs(config.compact_interval_secs.max(1)),
    ));

    shutdown_signal().await?;
    info!("shutdown signal received");
    compactor.abort();
    info!("allocra stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("registering SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
