// Helpers shared by the tools
#![allow(dead_code)]

use clap::{Arg, ArgMatches, Command};
use imux::{
    provider::UsbmuxdProvider,
    usbmuxd::UsbmuxdAddr,
};
use tracing_subscriber::EnvFilter;

/// Logs to stderr, filtered by `RUST_LOG` (default `info`)
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Adds the `--udid` and `--muxer` arguments
pub fn device_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("udid")
                .short('u')
                .long("udid")
                .value_name("UDID")
                .help("Target specific device by UDID (default: first attached)"),
        )
        .arg(muxer_arg())
}

pub fn muxer_arg() -> Arg {
    Arg::new("muxer")
        .short('m')
        .long("muxer")
        .value_name("ADDR")
        .help("Muxer to use, unix:/path or host:port (default: $USBMUXD_SOCKET_ADDRESS)")
}

/// The muxer address from `--muxer`, the environment or the platform default
pub fn muxer_addr(matches: &ArgMatches) -> Result<UsbmuxdAddr, String> {
    match matches.get_one::<String>("muxer") {
        Some(a) => UsbmuxdAddr::parse(a).map_err(|e| format!("Invalid muxer address {a}: {e}")),
        None => UsbmuxdAddr::from_env_var()
            .map_err(|e| format!("Invalid {}: {e}", UsbmuxdAddr::ENV_VAR)),
    }
}

/// Finds the requested device, or the first one, on the muxer
pub async fn get_provider(matches: &ArgMatches, label: &str) -> Result<UsbmuxdProvider, String> {
    let addr = muxer_addr(matches)?;
    let mut muxer = addr
        .connect(0)
        .await
        .map_err(|e| format!("Unable to connect to the muxer at {addr}: {e}"))?;

    let device = match matches.get_one::<String>("udid") {
        Some(udid) => muxer
            .get_device(udid)
            .await
            .map_err(|e| format!("Device {udid} not found: {e}"))?,
        None => muxer
            .get_devices()
            .await
            .map_err(|e| format!("Unable to list devices: {e}"))?
            .into_iter()
            .next()
            .ok_or("No devices attached")?,
    };
    Ok(device.to_provider(addr, label))
}
