//! netium-transport: runs tunnel inbounds over the pluggable transport layer

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use netium_transport::app::Runtime;
use netium_transport::config::Config;
use netium_transport::error::{Error, Result};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    let Some(path) = args.config else {
        print_help();
        return Err(Error::Config("no configuration file given".into()));
    };
    let config = Config::load(&path)?;

    // RUST_LOG wins over the config file
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Netium transport v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(&config)?;
        if args.test {
            info!("Configuration OK: {} inbounds, {} outbounds", config.inbounds.len(), config.outbounds.len());
            return Ok(());
        }
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    test: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut test = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "-t" | "--test" => test = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self { config, test, version }
    }
}

fn print_help() {
    println!(r#"netium-transport - tunnel runner for the Netium transport layer

USAGE:
    netium-transport [OPTIONS] <FILE>

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -t, --test              Validate the configuration and exit
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    netium-transport -c tunnel.json
    netium-transport --test tunnel.json

CARRIERS:
    tcp, udp, websocket (ws), domainsocket
    mkcp (kcp), http (h2), quic accept settings but cannot dial or listen
"#);
}

fn print_version() {
    println!("netium-transport v{}", env!("CARGO_PKG_VERSION"));
    println!("Pluggable transport layer for Netium");
}
