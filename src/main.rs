use clap::{Parser, Subcommand};
use mcharness::{
    config::HarnessConfig, rewrite, replace_strings, Endpoint, McClient, PortTargets,
    TimeoutConfig,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_appender::non_blocking;
// no EnvFilter feature; use a simple level switch via RUST_LOG

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[derive(Parser)]
#[command(name = "mcharness")]
#[command(about = "Memcache test harness utilities")]
struct Args {
    /// Path to harness configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rewrite host:port literals in a config file
    RewritePorts {
        file: PathBuf,
        /// New ports, assigned to old ports in the order they appear
        #[arg(long, value_delimiter = ',', conflicts_with = "map", required_unless_present = "map")]
        ports: Vec<u16>,
        /// Explicit OLD=NEW port pairs
        #[arg(long, value_delimiter = ',', value_parser = parse_port_pair)]
        map: Vec<(u16, u16)>,
        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Replace literal strings in a config file
    ReplaceStrings {
        file: PathBuf,
        /// OLD=NEW, applied in order
        #[arg(long = "replace", required = true, value_parser = parse_replacement)]
        replacements: Vec<(String, String)>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print server statistics
    Stats {
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(short, long)]
        port: u16,
        /// Stats group, e.g. "items"
        #[arg(long)]
        spec: Option<String>,
    },
    /// Print the server version
    Version {
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(short, long)]
        port: u16,
    },
}

fn parse_port_pair(s: &str) -> Result<(u16, u16), String> {
    let (old, new) = s
        .split_once('=')
        .ok_or_else(|| format!("expected OLD=NEW, got \"{}\"", s))?;
    let old = old.trim().parse().map_err(|e| format!("bad port \"{}\": {}", old, e))?;
    let new = new.trim().parse().map_err(|e| format!("bad port \"{}\": {}", new, e))?;
    Ok((old, new))
}

fn parse_replacement(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .ok_or_else(|| format!("expected OLD=NEW, got \"{}\"", s))
}

fn init_logging() {
    let (non_blocking_writer, guard) = non_blocking(std::io::stderr());
    // Keep guard alive for the program lifetime to avoid log loss
    let _ = LOG_GUARD.set(guard);

    let fmt = tracing_subscriber::fmt()
        .with_writer(non_blocking_writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .compact();

    // Map RUST_LOG to a max level (debug/info/warn/error/trace)
    let level = match std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let _ = fmt.with_max_level(level).try_init();
}

async fn load_timeouts(config_path: Option<&str>) -> Result<TimeoutConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => Ok(HarnessConfig::from_yaml_file(path).await?.timeouts),
        None => Ok(TimeoutConfig::default()),
    }
}

async fn emit(text: &str, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        Some(path) => {
            tokio::fs::write(path, text).await?;
            info!("Wrote {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

async fn connect(host: String, port: u16, timeouts: TimeoutConfig) -> Result<McClient, Box<dyn std::error::Error>> {
    let mut client = McClient::with_timeouts(Endpoint::new(host, port), timeouts);
    client.connect().await?;
    Ok(client)
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let timeouts = load_timeouts(args.config.as_deref()).await?;

    match args.command {
        Command::RewritePorts {
            file,
            ports,
            map,
            output,
        } => {
            let targets = if map.is_empty() {
                PortTargets::List(ports)
            } else {
                PortTargets::Map(map.into_iter().collect::<HashMap<_, _>>())
            };
            let text = tokio::fs::read_to_string(&file).await?;
            let rewritten = rewrite(&text, &targets)?;
            for (old, new) in rewritten.port_map.iter() {
                info!("{} -> {}", old, new);
            }
            emit(&rewritten.text, output.as_deref()).await?;
        }
        Command::ReplaceStrings {
            file,
            replacements,
            output,
        } => {
            let text = tokio::fs::read_to_string(&file).await?;
            emit(&replace_strings(&text, &replacements), output.as_deref()).await?;
        }
        Command::Stats { host, port, spec } => {
            let mut client = connect(host, port, timeouts).await?;
            match client.stats(spec.as_deref()).await? {
                Some(stats) => {
                    let mut stats: Vec<_> = stats.into_iter().collect();
                    stats.sort();
                    for (name, value) in stats {
                        println!("{} {}", name, value);
                    }
                }
                None => return Err(format!("No stats from {}", client.endpoint()).into()),
            }
        }
        Command::Version { host, port } => {
            let mut client = connect(host, port, timeouts).await?;
            println!("{}", client.version().await?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{}", e);
        return Err(e);
    }
    Ok(())
}
