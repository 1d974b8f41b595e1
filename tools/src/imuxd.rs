// Muxer proxy: serves local muxer clients from a registry kept in sync with an upstream muxer

use std::time::Duration;

use clap::{Arg, Command};
use imux::{
    proxy::{MuxProxy, ProxyConfig},
    usbmuxd::UsbmuxdAddr,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = Command::new("imuxd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Serve muxer clients from devices seen on another muxer")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR")
                .default_value("127.0.0.1:27015")
                .help("Where clients connect, unix:/path or host:port"),
        )
        .arg(
            Arg::new("upstream")
                .short('m')
                .long("upstream")
                .value_name("ADDR")
                .help("The muxer that sees the devices (default: $USBMUXD_SOCKET_ADDRESS)"),
        )
        .arg(
            Arg::new("renumber")
                .long("renumber")
                .action(clap::ArgAction::SetTrue)
                .help("Hand out local device IDs instead of the upstream ones"),
        )
        .arg(
            Arg::new("reconnect")
                .long("reconnect")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .default_value("2")
                .help("Wait this long before reconnecting to a lost upstream"),
        )
        .get_matches();

    let listen = match matches.get_one::<String>("listen").map(|a| UsbmuxdAddr::parse(a)) {
        Some(Ok(a)) => a,
        _ => {
            eprintln!("Invalid listen address");
            std::process::exit(2);
        }
    };
    let upstream = match matches.get_one::<String>("upstream") {
        Some(a) => UsbmuxdAddr::parse(a),
        None => UsbmuxdAddr::from_env_var(),
    };
    let upstream = match upstream {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Invalid upstream address: {e}");
            std::process::exit(2);
        }
    };
    if listen == upstream {
        eprintln!("Refusing to proxy {listen} to itself");
        std::process::exit(2);
    }

    let mut config = ProxyConfig::new(listen, upstream);
    config.renumber = matches.get_flag("renumber");
    if let Some(secs) = matches.get_one::<u64>("reconnect") {
        config.reconnect_interval = Duration::from_secs(*secs);
    }
    info!("Proxying {} -> {}", config.listen, config.upstream);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, shutting down");
            }
            cancel.cancel();
        });
    }

    if let Err(e) = MuxProxy::run(config, cancel).await {
        eprintln!("Proxy failed: {e}");
        std::process::exit(1);
    }
}
