// Launches an app through the instruments service and prints its PID

use clap::{Arg, Command};
use imux::dvt::{connect_instruments, process_control::ProcessControlClient};
use plist::Dictionary;

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::device_args(
        Command::new("process_control")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Launch or kill apps with process control"),
    )
    .arg(
        Arg::new("bundle_id")
            .value_name("BUNDLE_ID")
            .required_unless_present("kill")
            .help("The bundle ID to launch"),
    )
    .arg(
        Arg::new("args")
            .value_name("ARGS")
            .num_args(0..)
            .last(true)
            .help("Arguments for the app, after --"),
    )
    .arg(
        Arg::new("env")
            .short('e')
            .long("env")
            .value_name("KEY=VALUE")
            .action(clap::ArgAction::Append)
            .help("Environment variable for the app"),
    )
    .arg(
        Arg::new("suspended")
            .short('s')
            .long("suspended")
            .action(clap::ArgAction::SetTrue)
            .help("Start the app stopped, waiting for a debugger"),
    )
    .arg(
        Arg::new("keep")
            .long("keep-existing")
            .action(clap::ArgAction::SetTrue)
            .help("Do not kill a running instance first"),
    )
    .arg(
        Arg::new("no_memory_limit")
            .long("no-memory-limit")
            .action(clap::ArgAction::SetTrue)
            .help("Lift the memory limit of the launched app"),
    )
    .arg(
        Arg::new("kill")
            .short('k')
            .long("kill")
            .value_name("PID")
            .value_parser(clap::value_parser!(u64))
            .conflicts_with("bundle_id")
            .help("Kill a process instead of launching"),
    )
    .get_matches();

    let provider = match common::get_provider(&matches, "process_control").await {
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
    let client = match ProcessControlClient::new(&conn).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Unable to open process control: {e}");
            std::process::exit(1);
        }
    };

    if let Some(pid) = matches.get_one::<u64>("kill") {
        if let Err(e) = client.kill_app(*pid).await {
            eprintln!("Kill failed: {e}");
            std::process::exit(1);
        }
        println!("Killed {pid}");
        conn.close().await;
        return;
    }

    let mut env = Dictionary::new();
    for pair in matches.get_many::<String>("env").into_iter().flatten() {
        match pair.split_once('=') {
            Some((k, v)) => {
                env.insert(k.to_string(), v.into());
            }
            None => {
                eprintln!("Environment entries must look like KEY=VALUE, got {pair}");
                std::process::exit(2);
            }
        }
    }
    let args: Vec<String> = matches
        .get_many::<String>("args")
        .into_iter()
        .flatten()
        .cloned()
        .collect();
    let bundle_id = matches
        .get_one::<String>("bundle_id")
        .cloned()
        .unwrap_or_default();

    let pid = match client
        .launch_app(
            bundle_id,
            Some(env),
            Some(args),
            matches.get_flag("suspended"),
            !matches.get_flag("keep"),
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Launch failed: {e}");
            std::process::exit(1);
        }
    };

    if matches.get_flag("no_memory_limit") {
        if let Err(e) = client.disable_memory_limit(pid).await {
            eprintln!("Unable to lift the memory limit of {pid}: {e}");
        }
    }
    println!("PID: {pid}");
    conn.close().await;
}
