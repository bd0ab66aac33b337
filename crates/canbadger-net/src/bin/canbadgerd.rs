use std::io::IsTerminal;
use std::path::PathBuf;

use canbadger_core::{MemEeprom, MemStorage, SdCard, bus_pair};
use canbadger_net::manager::COMMAND_PORT;
use canbadger_net::{Device, Dispatcher, EthernetManager};
use clap::Parser;

/// Run the CANBadger control plane on this host
///
/// Binds the command socket, broadcasts the discovery beacon, and serves
/// the full command set. The two CAN ports are loopback simulations, so
/// this is a bench target for server development rather than a vehicle
/// tool; the far ends of both buses answer nothing on their own.
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// Directory standing in for the SD card
    #[clap(long, default_value = "./sd")]
    sd_root: PathBuf,

    /// UDP command port
    #[clap(long, default_value_t = COMMAND_PORT)]
    port: u16,
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

    std::fs::create_dir_all(&args.sd_root)?;
    let sd = SdCard::new(&args.sd_root);
    let (can1, _can1_far) = bus_pair();
    let (can2, _can2_far) = bus_pair();
    let device = Device::new(can1, can2, sd, MemEeprom::new());
    tracing::info!(
        "CANBadger '{}' on UDP port {}, SD at {:?}",
        device.settings.id,
        args.port,
        args.sd_root
    );

    let manager = if args.port == COMMAND_PORT {
        EthernetManager::new(&device.settings.id)?
    } else {
        use std::net::{IpAddr, Ipv4Addr, SocketAddr};
        EthernetManager::with_ports(
            &device.settings.id,
            args.port,
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                canbadger_net::manager::DISCOVERY_PORT,
            ),
        )?
    };

    let mut dispatcher = Dispatcher::new(manager, device, MemStorage::new())?;
    while !dispatcher.reset_requested() {
        dispatcher.poll()?;
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    tracing::info!("Reset requested, shutting down");
    Ok(())
}
