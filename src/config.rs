#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_GATEWAY_PORT: u16 = 8080;
pub const DEFAULT_GATEWAY_HOST: &str = "0.0.0.0";
pub const DEFAULT_PUBLIC_URL: &str = "https://consulta-pe-bot.up.railway.app";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_PUBLISHERS: &[&str] = &[
    "@Peliculas_HD_4K",
    "@Videos_publicos_pe",
    "@Educacion_pe",
    "@Turismo_pe",
    "@Musica_pe",
];

/// Upper bound on the recent-video ring buffer.
pub const RECENT_CACHE_CAPACITY: usize = 500;
/// Messages scanned per publisher during a search.
pub const SEARCH_MESSAGE_LIMIT: usize = 50;
/// Wall-clock bound on a whole fan-out search.
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(45);
/// Extra time a caller waits on the executor beyond the search bound.
pub const CALLER_GRACE: Duration = Duration::from_secs(5);
/// Keep-alive / reconnect period.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_RECENT_LIMIT: usize = 20;

/// Everything the gateway needs to start, resolved from env, `.env` and CLI.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_id: i32,
    pub api_hash: String,
    pub public_url: String,
    pub session_string: Option<String>,
    pub port: u16,
    pub host: IpAddr,
    pub publishers: Vec<String>,
    pub download_dir: PathBuf,
    /// Env file the configuration was read from; the session token is
    /// written back here after a successful sign-in.
    pub env_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub host: Option<IpAddr>,
    pub download_dir: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_gateway_config(overrides: ConfigOverrides) -> Result<GatewayConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_gateway_config(&file_vars, env_var_string, overrides, env_path)
}

fn build_gateway_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
    env_path: PathBuf,
) -> Result<GatewayConfig> {
    let api_id = match lookup_value("API_ID", file_vars, &env_lookup) {
        Some(raw) => raw
            .parse::<i32>()
            .with_context(|| format!("API_ID must be an integer, got {raw:?}"))?,
        None => 0,
    };
    let api_hash = lookup_value("API_HASH", file_vars, &env_lookup).unwrap_or_default();
    let public_url = lookup_value("PUBLIC_URL", file_vars, &env_lookup)
        .unwrap_or_else(|| DEFAULT_PUBLIC_URL.to_string())
        .trim_end_matches('/')
        .to_string();
    let session_string = lookup_value("SESSION_STRING", file_vars, &env_lookup)
        .filter(|value| !value.trim().is_empty());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("PORT", file_vars, &env_lookup).and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_GATEWAY_PORT);
    let host = match overrides.host {
        Some(host) => host,
        None => {
            let raw = lookup_value("HOST", file_vars, &env_lookup)
                .unwrap_or_else(|| DEFAULT_GATEWAY_HOST.to_string());
            raw.parse::<IpAddr>()
                .map_err(|_| anyhow!("HOST must be an IPv4 or IPv6 address, got {raw:?}"))?
        }
    };
    let publishers = lookup_value("PUBLISHERS", file_vars, &env_lookup)
        .map(|raw| parse_publishers(&raw))
        .filter(|list| !list.is_empty())
        .unwrap_or_else(|| DEFAULT_PUBLISHERS.iter().map(|s| s.to_string()).collect());
    let download_dir = overrides
        .download_dir
        .or_else(|| lookup_value("DOWNLOAD_DIR", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR));

    Ok(GatewayConfig {
        api_id,
        api_hash,
        public_url,
        session_string,
        port,
        host,
        publishers,
        download_dir,
        env_path,
    })
}

/// Splits a comma separated publisher list, dropping blanks and duplicates
/// while keeping the configured order.
pub fn parse_publishers(raw: &str) -> Vec<String> {
    let mut publishers: Vec<String> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        if !publishers.iter().any(|existing| existing == name) {
            publishers.push(name.to_string());
        }
    }
    publishers
}

fn env_var_string(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Process environment first, then the env file.
fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Reads `KEY=value` pairs from a dotenv style file. A missing file yields an
/// empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    Ok(content.lines().filter_map(parse_env_line).collect())
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Updates or appends a single env var inside the target file while preserving
/// unrelated lines and comments.
pub fn upsert_env_value(path: &Path, key: &str, value: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("Creating {}", parent.display()))?;
    }

    let raw = fs::read_to_string(path).unwrap_or_default();
    let mut lines = Vec::new();
    let mut updated = false;
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");

    for line in raw.lines() {
        let trimmed = line.trim_start();
        let indent = &line[..line.len() - trimmed.len()];
        let (prefix, rest) = match trimmed.strip_prefix("export ") {
            Some(stripped) => ("export ", stripped),
            None => ("", trimmed),
        };
        match rest.split_once('=') {
            Some((candidate, _)) if candidate.trim() == key => {
                lines.push(format!("{indent}{prefix}{key}=\"{escaped}\""));
                updated = true;
            }
            _ => lines.push(line.to_string()),
        }
    }

    if !updated {
        lines.push(format!("{key}=\"{escaped}\""));
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, lines.join("\n") + "\n")
        .with_context(|| format!("Writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("Replacing {}", path.display()))?;
    Ok(())
}
