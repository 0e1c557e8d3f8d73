#![forbid(unsafe_code)]

//! HTTP entry point for the video gateway.
//!
//! One connection pass runs before the listener binds; after that the
//! keep-alive loop owns reconnection.

use std::{net::IpAddr, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use newtube_gateway::client::NetworkClient;
use newtube_gateway::config::{ConfigOverrides, resolve_gateway_config};
use newtube_gateway::executor::NetworkExecutor;
use newtube_gateway::gateway::{Gateway, GatewaySettings};
use newtube_gateway::http::{AppState, router};
use newtube_gateway::mtproto::MtprotoClient;
use newtube_gateway::security::ensure_not_root;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "newtube_gateway=info,gateway=info,warn";

#[derive(Debug, Clone, Default, PartialEq)]
struct GatewayArgs {
    port: Option<u16>,
    host: Option<IpAddr>,
    env_file: Option<PathBuf>,
    download_dir: Option<PathBuf>,
}

impl GatewayArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };
            match flag.as_str() {
                "--port" => parsed.port = Some(parse_port_arg(&value()?)?),
                "--host" => parsed.host = Some(parse_host_arg(&value()?)?),
                "--env-file" => parsed.env_file = Some(PathBuf::from(value()?)),
                "--download-dir" => parsed.download_dir = Some(PathBuf::from(value()?)),
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }

    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            port: self.port,
            host: self.host,
            download_dir: self.download_dir,
            env_path: self.env_file,
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host")
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = GatewayArgs::parse()?;
    ensure_not_root("gateway")?;

    let config = resolve_gateway_config(args.into_overrides())?;
    init_tracing();

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| format!("creating {}", config.download_dir.display()))?;

    if config.api_id == 0 || config.api_hash.is_empty() {
        warn!("API_ID/API_HASH not set; connecting to the network will fail");
    }

    let client: Arc<dyn NetworkClient> = Arc::new(MtprotoClient::from_config(&config));
    let executor = NetworkExecutor::spawn(client).context("starting network executor")?;
    let gateway = Arc::new(Gateway::new(GatewaySettings::from_config(&config), executor));

    match gateway.ensure_connected().await {
        Ok(true) => info!("session authorized"),
        Ok(false) => warn!("session not authorized; use /login and /code"),
        Err(err) => error!(error = %err, "initial connection failed; keep-alive will retry"),
    }
    gateway
        .start_background()
        .context("starting background tasks")?;

    let app = router(AppState::new(gateway));
    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, publishers = config.publishers.len(), "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running gateway server")?;

    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}
