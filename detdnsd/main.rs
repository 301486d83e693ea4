// The detdns daemon: load the configuration, wire up logging, serve until
// SIGINT/SIGTERM.

use clap::Parser;
use detdns::{Config, Server};
use log::{error, LevelFilter};
use std::path::PathBuf;
use std::process::ExitCode;
use syslog::{BasicLogger, Facility, Formatter3164};

/// DNS proxy for detecting local DNS servers: forwards queries upstream and
/// records each queried name with the client that asked for it.
#[derive(Parser)]
#[command(name = "detdnsd", version, about)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,
}

/// Logs to the local syslog daemon on LOCAL5. When there is no syslog
/// socket (containers, dev machines), stderr via env_logger will do.
fn init_logging(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let formatter = Formatter3164 {
        facility: Facility::LOG_LOCAL5,
        hostname: None,
        process: "detdnsd".to_string(),
        pid: std::process::id(),
    };

    match syslog::unix(formatter) {
        Ok(logger) => {
            if log::set_boxed_logger(Box::new(BasicLogger::new(logger))).is_ok() {
                log::set_max_level(level);
            }
        }
        Err(_) => {
            env_logger::Builder::new().filter_level(level).init();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("detdnsd: {}", err);
            return ExitCode::FAILURE;
        }
    };

    init_logging(config.debug);

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!("detdnsd: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("detdnsd: {}", err);
            ExitCode::FAILURE
        }
    }
}
