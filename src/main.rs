//! Tunium - tunnel-side traffic interceptor

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tunium::config::Config;
use tunium::error::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&Config::default_config()).unwrap()
        );
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    // Load configuration
    let config = if let Some(path) = args.config {
        Config::load(&path)?
    } else {
        info!("No config file specified, using defaults");
        Config::default()
    };

    info!("Tunium v{} starting...", env!("CARGO_PKG_VERSION"));

    let fd = match args.fd {
        Some(fd) => fd,
        None => {
            eprintln!("No tunnel descriptor given. Pass --fd <N> (see --help).");
            std::process::exit(1);
        }
    };

    run(config, fd)
}

#[cfg(unix)]
fn run(config: Config, fd: i32) -> Result<()> {
    use std::sync::Arc;
    use tracing::warn;
    use tunium::tunnel::{FdDevice, TunnelEngine, TunnelState};

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        // The host hands the descriptor over; it is ours from here on.
        let device = unsafe { FdDevice::from_raw_fd(fd) }?;
        let engine = TunnelEngine::new(config, Arc::new(device))?;
        engine.start()?;

        let mut states = engine.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
            _ = async {
                while states.changed().await.is_ok() {
                    if *states.borrow() == TunnelState::Failed {
                        break;
                    }
                }
            } => warn!("tunnel failed, shutting down"),
        }
        engine.stop().await?;

        if let Ok(stats) = engine.accountant().snapshot().await {
            info!("session traffic: {}", stats.summary());
        }
        Ok::<_, tunium::error::Error>(())
    })?;

    info!("Goodbye!");
    Ok(())
}

#[cfg(not(unix))]
fn run(_config: Config, _fd: i32) -> Result<()> {
    eprintln!("Tunnel descriptor hand-over is only supported on Unix.");
    std::process::exit(1);
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    fd: Option<i32>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut fd = None;
        let mut gen_config = false;
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
                "--fd" => {
                    if i + 1 < args.len() {
                        fd = args[i + 1].parse().ok();
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
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

        Self {
            config,
            fd,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Tunium - tunnel-side traffic interceptor

USAGE:
    tunium [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --fd <N>                Pre-opened tunnel file descriptor (Unix)
    --gen-config            Print an example configuration
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    tunium --gen-config > tunium.json
    tunium -c tunium.json --fd 3
"#
    );
}

fn print_version() {
    println!("Tunium v{}", env!("CARGO_PKG_VERSION"));
    println!("Rule-based tunnel traffic classification and SOCKS5 forwarding");
}
