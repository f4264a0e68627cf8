// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Blueteeth command line front end

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blueteeth::bluetooth::{RfcommTransport, SessionManager};
use blueteeth::config::Config;
use blueteeth::events::SessionEvent;
use blueteeth::state::ConnectionState;
use blueteeth::storage::{DurableStore, ReadingDb, ReadingSummary};

#[derive(Parser)]
#[command(name = "blueteeth", version, about = "Oxygen sensor monitor over Bluetooth SPP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a sensor and print its readings
    Monitor {
        /// Sensor address, e.g. 00:11:22:AA:BB:CC (defaults to the configured one)
        address: Option<String>,

        /// Do not reconnect when the link drops
        #[arg(long)]
        no_reconnect: bool,
    },
    /// Show stored readings
    History {
        /// How many days back to look
        #[arg(long, default_value_t = 1)]
        days: u32,

        /// Print readings as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete all stored readings
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blueteeth=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    let db = Arc::new(ReadingDb::new(&config.data_dir)?);

    match cli.command {
        Command::Monitor {
            address,
            no_reconnect,
        } => monitor(&config, db, address, no_reconnect).await,
        Command::History { days, json } => history(&db, days, json),
        Command::Clear => {
            db.clear_all()?;
            println!("Stored readings deleted");
            Ok(())
        }
    }
}

async fn monitor(
    config: &Config,
    db: Arc<ReadingDb>,
    address: Option<String>,
    no_reconnect: bool,
) -> Result<()> {
    let Some(address) = address.or_else(|| config.bluetooth.device_address.clone()) else {
        bail!("No device address given and none configured");
    };

    info!("Starting Blueteeth v{}...", env!("CARGO_PKG_VERSION"));

    let transport = Arc::new(RfcommTransport::new(config.bluetooth.rfcomm_channel).await);
    let store = config.reading_store().with_durable(db);
    let session = SessionManager::new(transport, store, config.session_options());
    if no_reconnect {
        session.set_auto_reconnect(false);
    }

    let mut events = session.subscribe();
    session.connect(&address);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::StateChanged(state) => {
                        println!("* {}", state);
                        match state {
                            ConnectionState::Connected => {
                                session.start_measuring();
                            }
                            ConnectionState::Disconnected | ConnectionState::ConnectionFailed
                                if session.is_inactive() =>
                            {
                                warn!("Connection to {} lost", address);
                                break;
                            }
                            _ => {}
                        }
                    }
                    SessionEvent::LineReceived { reading: Some(reading), .. } => {
                        println!("{}", reading);
                    }
                    SessionEvent::LineReceived { line, reading: None } => {
                        println!("  {}", String::from_utf8_lossy(&line));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    session.disconnect();
    println!("{} readings this session", session.readings().len());
    info!("Blueteeth stopped");
    Ok(())
}

fn history(db: &ReadingDb, days: u32, json: bool) -> Result<()> {
    let readings = db
        .query_last_days(days)
        .context("Failed to query stored readings")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&readings)?);
        return Ok(());
    }

    if readings.is_empty() {
        println!("No readings in the last {} day(s)", days);
        return Ok(());
    }

    for reading in &readings {
        println!(
            "{}  {:<15} {}",
            reading.timestamp().format("%Y-%m-%d %H:%M:%S"),
            reading.kind(),
            reading.formatted_value()
        );
    }

    println!();
    for summary in ReadingSummary::for_all_kinds(&readings) {
        println!(
            "{:<15} n={:<6} min={:.2} max={:.2} mean={:.2}",
            summary.kind, summary.count, summary.min, summary.max, summary.mean
        );
    }
    println!(
        "{} readings stored in total, as of {}",
        db.count()?,
        Local::now().format("%Y-%m-%d %H:%M")
    );

    Ok(())
}
