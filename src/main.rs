pub mod config;
pub mod error;
pub mod graph;
pub mod mail;
pub mod oauth;
pub mod smtp;

#[cfg(test)]
mod testutil;

use log::{debug, info, warn, error, LevelFilter};
use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, PlainSecrets};
use graph::GraphClient;
use oauth::{IdentityClient, TokenCache};
use reqwest::blocking::Client;
use smtp::{Relay, SmtpServer};
use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

/// SMTP relay that submits mail through the Microsoft Graph API.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file [default: config.toml next to the executable]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `listen_addr`
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<()>
{
    let args = Args::parse();

    let path = match args.config {
        Some(path) => path,
        None => default_config_path()?
    };

    let mut config = Config::load(&path, &PlainSecrets)
        .with_context(|| format!("failed to load config from {}", path.display()))?;

    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    init_logging(&config)?;

    if config.fallback_smtp_user.is_empty() != config.fallback_smtp_pass.is_empty() {
        warn!("Only one of fallback_smtp_user/fallback_smtp_pass is set; fallback credentials are disabled");
    }

    let http = Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("failed to build HTTP client")?;

    let identity = IdentityClient::new(
        http.clone(),
        config.token_url()?,
        &config.oauth2.client_id,
        &config.oauth2.client_secret,
        &config.oauth2.scopes
    );

    let relay = Arc::new(Relay {
        tokens: Arc::new(TokenCache::new(identity)),
        mailer: Arc::new(GraphClient::new(http, config.graph_endpoint()?, config.save_to_sent)?),
        host_name: config.host_name.clone(),
        fallback: config.fallback_credentials(),
        max_message_bytes: config.max_message_bytes
    });

    let listener = TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("failed to listen on {}", config.listen_addr))?;

    info!("Graph SMTP Relay {} listening at {}", env!("CARGO_PKG_VERSION"), listener.local_addr()?);

    loop
    {
        let (stream, addr) = match listener.accept() {
            Ok(conn) => conn,
            Err(err) => {
                error!("Accept error: {err}");
                continue;
            }
        };

        info!("Accepted connection from {addr}");

        if let Err(err) = stream.set_read_timeout(config.read_timeout()) {
            warn!("Cannot set read timeout for {addr}: {err}");
        }

        let relay = relay.clone();

        std::thread::spawn(move || {
            if let Err(err) = handle_connection(relay, stream) {
                warn!("Connection from {addr} ended with error: {err:#}");
            }
        });
    }
}

fn handle_connection(relay: Arc<Relay>, stream: TcpStream) -> Result<()> {
    let reader = BufReader::new(stream.try_clone()?);
    let writer = BufWriter::new(stream.try_clone()?);

    let mut smtp = SmtpServer::new(relay, reader, writer);
    let result = smtp.serve();

    debug!("Session ended in state {:?}", smtp.state());

    // already closed by the peer in most error cases
    let _ = stream.shutdown(Shutdown::Both);

    result
}

fn default_config_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate the executable")?;

    Ok(exe
        .parent()
        .map(|dir| dir.join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml")))
}

fn init_logging(config: &Config) -> Result<()> {
    let level = match config.log_level.to_ascii_lowercase().as_str() {
        "warning" => LevelFilter::Warn,
        other => other.parse().unwrap_or(LevelFilter::Info)
    };

    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(level);

    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    if !config.log.is_empty() {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log)
            .with_context(|| format!("cannot open log file {}", config.log))?;

        builder
            .write_style(env_logger::WriteStyle::Never)
            .target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("failed to initialize logger")?;

    Ok(())
}
