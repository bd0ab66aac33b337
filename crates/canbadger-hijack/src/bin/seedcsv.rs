use std::io::IsTerminal;
use std::path::PathBuf;

use canbadger_hijack::seeds_to_csv;
use clap::Parser;
use eyre::WrapErr;

/// Convert a hammer seed collection file to a CSV for entropy analysis
///
/// The input is the raw file the seed hammer appends to on the SD card:
/// consecutive 4-byte big-endian seed samples. The output is one row per
/// sample with the delta to its predecessor, ready for plotting.
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// Path to the collected seed samples
    input: PathBuf,

    /// Path to the output. stdout if '-' or if not passed
    output: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    let use_color = std::io::stderr().is_terminal();
    if use_color {
        color_eyre::install()?;
    }

    let args = Args::parse();
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(args.log_level.into())
        .with_env_var("CANBADGER_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();

    let data = std::fs::read(&args.input)
        .wrap_err(format!("Failed to read seed file: {:?}", args.input))?;
    if data.len() % 4 != 0 {
        tracing::warn!(
            "Seed file is {} bytes, not a multiple of 4; trailing bytes ignored",
            data.len()
        );
    }

    match &args.output {
        None => seeds_to_csv(&data, std::io::stdout())?,
        Some(path) if path.as_os_str() == "-" => seeds_to_csv(&data, std::io::stdout())?,
        Some(path) => {
            let file = std::fs::File::create(path)
                .wrap_err(format!("Failed to create output file: {path:?}"))?;
            seeds_to_csv(&data, file)?;
        }
    }
    Ok(())
}
