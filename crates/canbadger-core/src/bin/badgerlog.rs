use std::io::{IsTerminal, Read};
use std::path::PathBuf;

use canbadger_core::record::flags;
use canbadger_core::stdio::{get_input_reader, get_output_writer};
use canbadger_core::{LogRecord, RecordError};
use clap::Parser;

/// Convert a binary capture log to a CSV
///
/// The input is a logging-session dump: consecutive length-tagged records,
/// possibly with zero-filled gaps from ring wraparounds.
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// Path to the input. stdin if '-' or if not passed
    input: Option<PathBuf>,

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

    let mut input = get_input_reader(&args.input)?;
    let mut data = Vec::new();
    input.read_to_end(&mut data)?;

    let output = get_output_writer(&args.output)?;
    let mut writer = csv::Writer::from_writer(output);
    writer.write_record(["timestamp_ms", "bus", "proto", "canid", "format", "dlc", "bitrate", "data"])?;

    let mut offset = 0;
    let mut count = 0usize;
    while offset < data.len() {
        let (record, consumed) = match LogRecord::decode(&data[offset..]) {
            Ok(ok) => ok,
            Err(RecordError::Empty) => break,
            Err(e) => {
                tracing::warn!("Stopping at byte {offset}: {e}");
                break;
            }
        };
        offset += consumed;
        count += 1;

        let bus = if record.flags & flags::BUS1 != 0 { 1 } else { 2 };
        let proto = if record.flags & flags::KLINE != 0 {
            "kline"
        } else {
            "can"
        };
        let format = if record.flags & flags::EXTENDED != 0 {
            "extended"
        } else {
            "standard"
        };
        writer.write_record([
            record.timestamp_ms.to_string(),
            bus.to_string(),
            proto.to_string(),
            format!("{:#X}", record.id),
            format.to_string(),
            record.payload.len().to_string(),
            record.bitrate.to_string(),
            hex::encode_upper(&record.payload),
        ])?;
    }
    writer.flush()?;
    tracing::info!("Converted {count} records");

    Ok(())
}
