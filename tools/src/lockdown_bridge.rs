// Stands in for a device's lockdown so host tools can reach a device behind a remote muxer

use std::sync::Arc;

use clap::{Arg, Command};
use imux::{
    provider::DeviceProvider,
    proxy::lockdown::{LockdownBridge, publish_pair_record},
    usbmuxd::UsbmuxdAddr,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::device_args(
        Command::new("lockdown_bridge")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Bridge lockdown and its services to a device on a remote muxer"),
    )
    .arg(
        Arg::new("listen")
            .short('l')
            .long("listen")
            .value_name("ADDR")
            .default_value("127.0.0.1:62078")
            .help("Where lockdown clients connect; services open on the same host"),
    )
    .arg(
        Arg::new("publish")
            .long("publish")
            .value_name("ADDR")
            .help("Store a bridge pair record on this local muxer"),
    )
    .arg(
        Arg::new("publish_id")
            .long("publish-id")
            .value_name("DEVICE_ID")
            .value_parser(clap::value_parser!(u32))
            .help("Device ID on the local muxer (default: the remote one)"),
    )
    .get_matches();

    let provider = match common::get_provider(&matches, "lockdown_bridge").await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let pairing_file = match provider.get_pairing_file().await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Unable to read the pair record for {}: {e}", provider.udid);
            std::process::exit(1);
        }
    };

    if let Some(local) = matches.get_one::<String>("publish") {
        let local = match UsbmuxdAddr::parse(local) {
            Ok(a) => a,
            Err(e) => {
                eprintln!("Invalid publish address {local}: {e}");
                std::process::exit(2);
            }
        };
        let device_id = matches
            .get_one::<u32>("publish_id")
            .copied()
            .unwrap_or(provider.device_id);
        if let Err(e) = publish_pair_record(&local, device_id, &provider.udid, &pairing_file).await
        {
            eprintln!("Unable to publish the pair record: {e}");
            std::process::exit(1);
        }
    }

    let listen = matches
        .get_one::<String>("listen")
        .cloned()
        .unwrap_or_default();
    let listener = match TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Unable to listen on {listen}: {e}");
            std::process::exit(1);
        }
    };
    info!("Bridging lockdown of {}", provider.udid);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let provider: Arc<dyn DeviceProvider> = Arc::new(provider);
    let bridge = LockdownBridge::new(provider, pairing_file);
    if let Err(e) = bridge.serve(listener, cancel).await {
        eprintln!("Bridge failed: {e}");
        std::process::exit(1);
    }
}
