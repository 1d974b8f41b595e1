// Prints the processes running on a device

use clap::{Arg, Command};
use imux::dvt::{connect_instruments, device_info::DeviceInfoClient};

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::device_args(
        Command::new("device_info")
            .version(env!("CARGO_PKG_VERSION"))
            .about("List running processes through the instruments service"),
    )
    .arg(
        Arg::new("apps")
            .short('a')
            .long("apps")
            .action(clap::ArgAction::SetTrue)
            .help("Only show applications"),
    )
    .get_matches();

    let provider = match common::get_provider(&matches, "device_info").await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let conn = match connect_instruments(&provider).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Unable to reach instruments, is the developer disk image mounted? {e}");
            std::process::exit(1);
        }
    };
    let client = match DeviceInfoClient::new(&conn).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Unable to open device info: {e}");
            std::process::exit(1);
        }
    };

    let processes = match client.running_processes().await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Unable to list processes: {e}");
            std::process::exit(1);
        }
    };
    let apps_only = matches.get_flag("apps");
    for p in processes.iter().filter(|p| !apps_only || p.is_application) {
        match &p.real_app_name {
            Some(path) => println!("{:>6} {} ({path})", p.pid, p.name),
            None => println!("{:>6} {}", p.pid, p.name),
        }
    }
    conn.close().await;
}
