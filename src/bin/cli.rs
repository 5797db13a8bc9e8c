use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tabcast::storage::schema::{decode_payload, encode_payload};
use tabcast::storage::{Heartbeat, Namespace, StoreKey};
use tabcast::{callback, FileStore, RelayConfig, SharedStore, TabContext};

#[derive(Parser)]
#[command(name = "tabcast")]
#[command(
    about = "Share one real-time connection between sibling processes through a shared store",
    version
)]
#[command(after_help = "The first process to join a namespace becomes master: it holds the
channel connection and writes every event into the store directory, where
the other processes pick it up. When the master stops refreshing its
heartbeat, a slave takes over.

Environment:
   TABCAST_URL     channel base URL (overrides the config file)
   TABCAST_TOKEN   channel auth token (overrides the config file)
   TABCAST_LOG     log filter, e.g. tabcast=debug")]
struct Cli {
    /// TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store key namespace
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Shared store directory
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the namespace and print the given events as they arrive
    Run {
        /// Event names to subscribe to
        #[arg(required = true)]
        events: Vec<String>,

        /// Channel base URL, e.g. https://events.example.com
        #[arg(long)]
        url: Option<String>,

        /// Channel auth token
        #[arg(long)]
        token: Option<String>,
    },

    /// Show the heartbeat and the relayed records of a store
    Inspect,

    /// Write a relayed event record by hand, as a master would
    Emit {
        event: String,

        /// JSON payload
        payload: String,
    },
}

fn load_config(cli: &Cli) -> Result<RelayConfig> {
    let mut config = match &cli.config {
        Some(path) => RelayConfig::load(path)?,
        None => {
            let mut config = RelayConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(namespace) = &cli.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(dir) = &cli.store_dir {
        config.store_dir = Some(dir.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    let _log_guard = tabcast::logging::init(&config.logging)?;

    match cli.command {
        Commands::Run { events, url, token } => {
            config.apply_overrides(url, token);
            config.validate()?;

            println!(
                "{} Joining namespace {} (store {})",
                "→".bright_blue(),
                config.namespace.bright_yellow(),
                config.store_dir().display().to_string().bright_white()
            );

            let ctx = TabContext::from_config(&config).start().await;
            for event in events {
                let name = event.clone();
                ctx.on(
                    &event,
                    callback(move |payload| {
                        println!(
                            "{} {} {}",
                            format!("[{}]", chrono::Local::now().format("%H:%M:%S%.3f"))
                                .bright_black(),
                            name.bright_cyan().bold(),
                            payload
                        );
                    }),
                );
            }

            tokio::signal::ctrl_c().await?;
            ctx.shutdown();
            println!("{} Left namespace", "✓".green());
        }

        Commands::Inspect => {
            let store = FileStore::open(config.store_dir())?;
            let namespace = Namespace::new(config.namespace.clone());
            let now = chrono::Utc::now().timestamp_millis();

            println!(
                "{}",
                format!("Namespace {} in {}", namespace, store.dir().display())
                    .cyan()
                    .bold()
            );
            println!("{}", "═".repeat(60).bright_black());

            let stale_ms = config.election.stale_after.as_millis() as i64;
            for key in store.keys()? {
                let Some(parsed) = namespace.parse(&key) else {
                    continue;
                };
                let value = store.get(&key)?.unwrap_or_default();
                match parsed {
                    StoreKey::Heartbeat => match Heartbeat::decode(&value) {
                        Some(hb) => {
                            let age = hb.age_millis(now);
                            let status = if age > stale_ms {
                                "stale".red()
                            } else {
                                "live".green()
                            };
                            println!(
                                "{} heartbeat {}ms ago ({})",
                                "♥".bright_red(),
                                age,
                                status
                            );
                        }
                        None => println!("{} heartbeat unreadable: {}", "♥".red(), value),
                    },
                    StoreKey::Event(name) => {
                        let shown = match decode_payload(&value) {
                            Ok(payload) => payload.to_string().bright_white(),
                            Err(_) => value.red(),
                        };
                        println!("{} {} {}", "•".bright_blue(), name.bright_cyan(), shown);
                    }
                }
            }
        }

        Commands::Emit { event, payload } => {
            if !StoreKey::is_relayable(&event) {
                anyhow::bail!("event name {event:?} is reserved for the heartbeat");
            }
            let payload = decode_payload(&payload).context("payload is not valid JSON")?;
            let store = FileStore::open(config.store_dir())?;
            let key = Namespace::new(config.namespace.clone()).key(&StoreKey::event(event));
            store.set(&key, &encode_payload(&payload)?)?;
            println!("{} wrote {}", "✓".green(), key.bright_yellow());
        }
    }

    Ok(())
}
