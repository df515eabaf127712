use std::{fs::File, io, path::PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueHint};
use serde::Serialize;
use tracing::{debug, info};
use utxo_bridge::{
    config::BridgeConfig,
    contract_call::decode_call_script,
    script::Script,
    version_vm::{RootVm, VersionVm},
};
use utxo_bridge_cli::{
    batch::{condense, CondenseBatch, CondenseReport},
    cli::CliBridgeConfig,
};

/// Condenses contract transfers into ledger transactions and decodes
/// contract outputs.
#[derive(Parser)]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[clap(flatten)]
    config: CliBridgeConfig,
}

#[derive(Subcommand)]
enum Command {
    /// Condenses a JSON batch of transfers and prints the resulting
    /// transaction and backing updates.
    Condense {
        /// Batch file. Read from stdin when absent.
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        input: Option<PathBuf>,
    },
    /// Decodes a hex contract output script.
    ParseOutput {
        /// The output script, hex.
        script: String,
    },
    /// Splits a raw version header into its fields.
    Version {
        /// The header as an unsigned 32-bit integer.
        raw: u32,
    },
}

#[derive(Serialize)]
struct VersionFields {
    raw: u32,
    format: u8,
    root_vm: u8,
    vm_version: u8,
    flag_options: u16,
    executable: bool,
}

fn print_json(value: &impl Serialize) -> Result<()> {
    serde_json::to_writer_pretty(io::stdout().lock(), value)?;
    println!();
    Ok(())
}

fn main() -> Result<()> {
    utxo_bridge_cli::tracing::init();

    let args = Cli::parse();
    let config: BridgeConfig = args.config.into();
    debug!("running with {config:?}");

    match args.command {
        Command::Condense { input } => {
            let batch = match &input {
                Some(path) => CondenseBatch::from_reader(
                    File::open(path)
                        .with_context(|| format!("cannot open {}", path.display()))?,
                )?,
                None => CondenseBatch::from_reader(io::stdin().lock())?,
            };
            info!(
                "condensing {} transfers over {} prior records",
                batch.transfers.len(),
                batch.priors.len()
            );
            let report = condense(batch, &config)?;
            print_json(&report)?;
            if matches!(report, CondenseReport::VoutOverflow { .. }) {
                std::process::exit(2);
            }
        }
        Command::ParseOutput { script } => {
            let bytes = hex::decode(script.trim_start_matches("0x"))
                .context("output script is not valid hex")?;
            match decode_call_script(&Script::from(bytes)) {
                Ok(call) => print_json(&call)?,
                Err(e) => bail!("not a valid contract output: {e}"),
            }
        }
        Command::Version { raw } => {
            let version = VersionVm::from_raw(raw);
            print_json(&VersionFields {
                raw,
                format: version.format(),
                root_vm: version.root_vm(),
                vm_version: version.vm_version(),
                flag_options: version.flag_options(),
                executable: matches!(version.root(), Some(RootVm::Evm | RootVm::Native)),
            })?;
        }
    }
    Ok(())
}
