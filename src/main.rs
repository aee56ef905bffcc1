use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use storecast::clock::{Clock, SystemClock};
use storecast::config::{self, BroadcastConfig};
use storecast::device::{MemoryDevice, PlaybackDevice};
use storecast::repository::JsonSlotStore;
use storecast::rodio_device::RodioDevice;
use storecast::station::Station;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "storecast", about = "In-store announcement broadcaster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the station: music plus scheduled announcements
    Run {
        /// Config file (JSON). Defaults to the user config directory.
        #[arg(short, long, env = "STORECAST_CONFIG")]
        config: Option<PathBuf>,
        /// Slot table (JSON). Defaults to the user data directory.
        #[arg(short, long, env = "STORECAST_SLOTS")]
        slots: Option<PathBuf>,
        /// Use the in-memory device instead of the sound card
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate the config and print the effective values
    CheckConfig {
        #[arg(short, long, env = "STORECAST_CONFIG")]
        config: Option<PathBuf>,
    },
    /// List the slots in the slot table
    Slots {
        #[arg(short, long, env = "STORECAST_SLOTS")]
        slots: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("storecast=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, slots, dry_run } => {
            let config = load_config(config);
            let slots_path = slots.unwrap_or_else(config::default_slots_path);
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);

            let device: Box<dyn PlaybackDevice> = if dry_run {
                tracing::info!("Dry run: using in-memory device");
                Box::new(MemoryDevice::new(clock.clone()))
            } else {
                match RodioDevice::new() {
                    Ok(d) => Box::new(d),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        std::process::exit(1);
                    }
                }
            };

            tracing::info!(slots = %slots_path.display(), "Using slot table");
            let repository = Box::new(JsonSlotStore::new(&slots_path));
            let mut station = match Station::new(config, repository, device, clock) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            station.run();
        }
        Commands::CheckConfig { config } => {
            let config = load_config(config);
            match serde_json::to_string_pretty(&config) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Slots { slots } => {
            let path = slots.unwrap_or_else(config::default_slots_path);
            let store = JsonSlotStore::new(&path);
            let slots = match store.load() {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            if slots.is_empty() {
                println!("No slots in {}", path.display());
                return;
            }
            println!("{} slot(s) in {}:", slots.len(), path.display());
            for slot in &slots {
                let forced = if slot.is_forced() { " (forced)" } else { "" };
                let announcer = if slot.announcer.is_empty() {
                    "-"
                } else {
                    slot.announcer.as_str()
                };
                println!(
                    "  {:>6}  {:<7} {}{}  p{}  [{}]  {}",
                    slot.id,
                    slot.status.to_string(),
                    slot.effective_time().format("%Y-%m-%d %H:%M:%S"),
                    forced,
                    slot.priority,
                    announcer,
                    slot.file
                );
            }
        }
    }
}

fn load_config(path: Option<PathBuf>) -> BroadcastConfig {
    let path = path.unwrap_or_else(config::default_config_path);
    match BroadcastConfig::load(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
