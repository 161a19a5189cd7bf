//! dnsdrip - chunked file transfer over DNS queries
//!
//! `send` pushes a file through a resolver as a sequence of query names,
//! `serve` answers for the tunnel domain and writes completed transfers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dnsdrip::json_logger::{self, LogFormat};
use dnsdrip::{dns, DripConfig, ExfilServer, FsSink, TransferEngine, UdpQuerySender};

#[derive(Parser)]
#[command(name = "dnsdrip")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_DATE"), ")"))]
#[command(about = "Chunked file transfer carried in DNS query names", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file
    Send {
        /// File to send
        #[arg(short, long)]
        file: PathBuf,

        /// Tunnel domain the server is authoritative for
        #[arg(short, long)]
        domain: String,

        /// Comma-separated resolvers (default: system resolvers)
        #[arg(long, value_delimiter = ',')]
        nameservers: Vec<String>,

        /// Resolver port
        #[arg(short, long, default_value_t = 53)]
        port: u16,
    },

    /// Receive transfers
    Serve {
        /// Bind address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// UDP port
        #[arg(short, long)]
        port: Option<u16>,

        /// Tunnel domain to strip from query names
        #[arg(short, long)]
        domain: Option<String>,

        /// Directory for reassembled files
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DripConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DripConfig::default(),
    };

    match cli.command {
        Commands::Send {
            file,
            domain,
            nameservers,
            port,
        } => {
            init_logging(cli.verbose, cli.log_format, &config, "client")?;
            config.validate().context("Invalid configuration")?;
            run_send(config, &file, &domain, nameservers, port).await?;
        }
        Commands::Serve {
            bind,
            port,
            domain,
            output_dir,
        } => {
            if let Some(bind) = bind {
                config.address = bind;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if domain.is_some() {
                config.domain = domain;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            init_logging(cli.verbose, cli.log_format, &config, "server")?;
            config.validate().context("Invalid configuration")?;
            run_serve(config).await?;
        }
        Commands::Config { output } => {
            config.validate().context("Invalid configuration")?;
            write_config(&config, output.as_deref())?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, format: LogFormat, config: &DripConfig, role: &str) -> Result<()> {
    json_logger::init(verbose, format, config.log_dir.as_deref(), role)
        .context("Failed to initialise logging")
}

async fn run_send(
    config: DripConfig,
    file: &Path,
    domain: &str,
    nameservers: Vec<String>,
    port: u16,
) -> Result<()> {
    let nameservers = if nameservers.is_empty() {
        let system = dns::system_nameservers();
        if system.is_empty() {
            warn!("No system resolvers found, falling back to 127.0.0.1");
            vec!["127.0.0.1".to_string()]
        } else {
            system
        }
    } else {
        nameservers
    };

    let sender = UdpQuerySender::resolve(&nameservers, port, config.query_timeout)
        .await
        .context("No usable nameservers")?;
    let engine = TransferEngine::new(config, Arc::new(sender), domain);

    let report = engine
        .send_file(file)
        .await
        .with_context(|| format!("Transfer of {} failed", file.display()))?;

    info!(
        "Transfer complete: session {}, {} bytes, {} chunks, {} retries in {:.1}s",
        report.session_id,
        report.bytes,
        report.chunks,
        report.retries,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

async fn run_serve(config: DripConfig) -> Result<()> {
    let sink = Arc::new(FsSink::new(&config.output_dir));
    let server = ExfilServer::bind(&config, sink)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;

    info!(
        "Writing transfers to {} (max {} sessions, idle timeout {})",
        config.output_dir.display(),
        config.max_sessions,
        humantime::format_duration(config.chunk_timeout)
    );

    server.run().await.context("Server stopped")
}

fn write_config(config: &DripConfig, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            config
                .to_file(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{}", config.to_toml()?),
    }
    Ok(())
}
