mod config;
mod render;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use hsm_bridge::abi::CKR_OK;
use hsm_bridge::{load_library, ProviderHandle};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{AppConfig, OutputFormat};
use crate::render::SlotRow;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Inspect PKCS#11 tokens through hsm-bridge",
    propagate_version = true
)]
struct Cli {
    /// PKCS#11 provider module (env: HSM_BRIDGE_MODULE). Defaults to the
    /// Belgian eID middleware location for this platform.
    #[arg(long, env = "HSM_BRIDGE_MODULE", global = true)]
    module: Option<PathBuf>,

    /// Configuration file (TOML). Defaults to the per-user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format; overrides the config file.
    #[arg(long, value_enum, global = true)]
    format: Option<OutputFormat>,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the provider's library information.
    Info,
    /// List slots that hold a token.
    Slots,
    /// Dump the data objects stored on a token.
    Objects {
        /// Slot to read; defaults to the first slot with a token.
        #[arg(long)]
        slot: Option<u64>,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = AppConfig::load(cli.config.as_deref())?;
    let format = cli.format.unwrap_or(config.format);
    let module = config.module_path(cli.module.clone());

    let mut provider = load_library(&module)
        .with_context(|| format!("loading provider module {}", module.display()))?;
    let rv = provider.initialize()?;
    if rv != CKR_OK {
        bail!("C_Initialize failed with CK_RV {rv:#x}");
    }
    info!(module = %module.display(), "provider initialized");

    let outcome = run(&provider, &cli.command, format, &config);

    let rv = provider.finalize_provider()?;
    if rv != CKR_OK {
        warn!(rv, "C_Finalize failed");
    }
    provider.release();

    println!("{}", outcome?);
    Ok(())
}

fn run(
    provider: &ProviderHandle,
    command: &Commands,
    format: OutputFormat,
    config: &AppConfig,
) -> Result<String> {
    match command {
        Commands::Info => render::info(&provider.get_info()?, format),
        Commands::Slots => {
            let rows: Vec<SlotRow> = provider
                .get_slot_list()?
                .into_iter()
                .map(|slot| SlotRow {
                    slot: u64::from(slot),
                    info: provider.get_slot_info(slot).ok(),
                    token: provider.get_token_info(slot).ok(),
                })
                .collect();
            render::slots(&rows, format)
        }
        Commands::Objects { slot } => {
            let slot = match slot {
                Some(slot) => (*slot)
                    .try_into()
                    .with_context(|| format!("slot id {slot} out of range"))?,
                None => match provider.get_slot_list()?.first() {
                    Some(slot) => *slot,
                    None => bail!("no slot with a token present"),
                },
            };
            debug!(slot, "listing data objects");
            let objects = provider.list_data_objects(slot)?;
            render::objects(&objects, format, config.preview_bytes)
        }
    }
}
