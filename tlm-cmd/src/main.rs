mod info;
mod run;
mod sinks;

use std::io::stderr;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use tlm::spacepacket::Apid;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a decommutation pipeline over a spacepacket file.
    ///
    /// Parameter and calibration definitions are read from a JSON mission
    /// file. Decoded samples are written per-batch to the selected sink
    /// format.
    Run(run::RunArgs),
    /// Show information about a spacepacket file
    Info {
        /// Input spacepacket file
        input: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: info::Format,

        /// Decode packet timecodes using this format.
        ///
        /// The cds timecode decoder expects timecodes in the first 8 bytes of
        /// each packets' secondary header.
        #[arg(short, long, default_value = "cds")]
        timecode: info::TCFormat,
    },
}

/// Parse a CSV of APIDs and APID ranges, e.g. 0-5,10,20.
///
/// Range start and end are inclusive.
pub fn parse_apid_ranges(list: &[String]) -> Result<Vec<Apid>> {
    let rx = regex::Regex::new(r"^(?:(\d+)|(\d+)-(\d+))$").expect("regex to compile");
    let mut values = Vec::default();
    for (i, s) in list.iter().enumerate() {
        let Some(cap) = rx.captures(s) else {
            bail!("invalid apid or range at {i}: {s}");
        };

        if cap.get(1).is_some() {
            let x = cap[1]
                .parse::<Apid>()
                .map_err(|_| anyhow!("invalid apid value at {i}"))?;
            values.push(x);
        } else {
            let start = cap[2]
                .parse::<Apid>()
                .map_err(|_| anyhow!("invalid range value at {i}"))?;
            let end = cap[3]
                .parse::<Apid>()
                .map_err(|_| anyhow!("invalid range value at {i}"))?;
            if start >= end {
                bail!("invalid range at {i}: {s}");
            }
            values.extend(start..=end);
        }
    }

    Ok(values)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .without_time()
        .with_env_filter(
            EnvFilter::try_from_env("TLM_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Run(args) => run::run(args),
        Commands::Info {
            input,
            format,
            timecode,
        } => info::info(input, format, timecode),
    }
}
