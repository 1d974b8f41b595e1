// Exposes a remote muxer on a local socket, byte for byte

use clap::{Arg, Command};
use imux::{
    proxy::{ProxyListener, forward::Forwarder},
    usbmuxd::UsbmuxdAddr,
};
use tokio_util::sync::CancellationToken;

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = Command::new("mux_forward")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Forward a local muxer socket to a remote muxer")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR")
                .default_value("127.0.0.1:27015")
                .help("Local address, unix:/path or host:port"),
        )
        .arg(
            Arg::new("remote")
                .value_name("ADDR")
                .required(true)
                .help("Remote muxer, host:port"),
        )
        .get_matches();

    let parse = |name: &str| {
        let raw = matches.get_one::<String>(name).cloned().unwrap_or_default();
        match UsbmuxdAddr::parse(&raw) {
            Ok(a) => a,
            Err(e) => {
                eprintln!("Invalid {name} address {raw}: {e}");
                std::process::exit(2);
            }
        }
    };
    let listen = parse("listen");
    let remote = parse("remote");

    let listener = match ProxyListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Unable to listen on {listen}: {e}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    if let Err(e) = Forwarder::new(remote).serve(listener, cancel).await {
        eprintln!("Forwarding failed: {e}");
        std::process::exit(1);
    }
}
