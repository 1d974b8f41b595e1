// Lists the devices a muxer sees, optionally following attach and detach events

use clap::{Arg, Command};
use futures_util::StreamExt;
use imux::usbmuxd::ListenEvent;

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = Command::new("imux_id")
        .version(env!("CARGO_PKG_VERSION"))
        .about("List devices attached to a muxer")
        .arg(common::muxer_arg())
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .action(clap::ArgAction::SetTrue)
                .help("Keep running and print attach and detach events"),
        )
        .get_matches();

    let addr = match common::muxer_addr(&matches) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let mut muxer = match addr.connect(0).await {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Unable to connect to the muxer at {addr}: {e}");
            std::process::exit(1);
        }
    };
    let devices = match muxer.get_devices().await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Unable to list devices: {e}");
            std::process::exit(1);
        }
    };
    for d in &devices {
        let connection = d
            .connection()
            .map(|c| format!("{c:?}"))
            .unwrap_or_else(|e| format!("unknown ({e})"));
        println!("{} {} {connection}", d.device_id, d.serial());
    }

    if !matches.get_flag("listen") {
        return;
    }

    let mut events = match muxer.listen().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Listen failed: {e}");
            std::process::exit(1);
        }
    };
    while let Some(event) = events.next().await {
        match event {
            Ok(ListenEvent::Attached(d)) => println!("+ {} {}", d.device_id, d.serial()),
            Ok(ListenEvent::Detached { device_id }) => println!("- {device_id}"),
            Ok(ListenEvent::Paired { device_id }) => println!("* {device_id} paired"),
            Err(e) => {
                eprintln!("Event stream ended: {e}");
                std::process::exit(1);
            }
        }
    }
}
