use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cbus_core::{build_router, CbusConfig, HttpToolBackend, ServerConfig, SqliteEngramStore};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_filter())
        .init();

    let defaults = ServerConfig::default();

    let bind = parse_socket("CBUS_BIND", defaults.bind);
    let heartbeat_interval = parse_duration("CBUS_HEARTBEAT_SECS", defaults.heartbeat_interval);
    let idle_timeout = parse_duration("CBUS_IDLE_SECS", defaults.idle_timeout);
    let breaker_window = parse_duration("CBUS_CALL_WINDOW_SECS", defaults.breaker_window);
    let breaker_max_calls = parse_usize("CBUS_CALL_LIMIT", defaults.breaker_max_calls);
    let message_retention = parse_usize("CBUS_RETAIN_MESSAGES", defaults.message_retention);

    let config = ServerConfig {
        bind,
        heartbeat_interval,
        idle_timeout,
        breaker_window,
        breaker_max_calls,
        message_retention,
    };

    let file_config = match CbusConfig::load() {
        Ok(file_config) => file_config,
        Err(err) => {
            let path = CbusConfig::config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "~/.cbus/config.toml".to_string());
            tracing::warn!(%path, error = %err, "failed to load cbus config; using defaults");
            CbusConfig::default()
        }
    };

    let db_path = env::var("CBUS_DB_PATH").unwrap_or_else(|_| "cbus.db".to_string());
    let store = Arc::new(SqliteEngramStore::open(Path::new(&db_path))?);

    let backend_url = env::var("CBUS_MCP_URL")
        .ok()
        .or_else(|| file_config.backend.url.clone());
    let backend = Arc::new(HttpToolBackend::new(backend_url.as_deref())?);

    let app = build_router(config.clone(), file_config, store, backend);

    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn parse_socket(key: &str, default: SocketAddr) -> SocketAddr {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_duration(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map(Duration::from_secs).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(v) => v.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn tracing_filter() -> tracing_subscriber::EnvFilter {
    let explicit = env::var("CBUS_LOG").or_else(|_| env::var("RUST_LOG")).ok();
    if let Some(filter) = explicit {
        return tracing_subscriber::EnvFilter::new(filter);
    }
    if matches!(
        env::var("CBUS_DEBUG").as_deref(),
        Ok("1" | "true" | "TRUE" | "yes" | "YES")
    ) {
        return tracing_subscriber::EnvFilter::new("debug");
    }
    tracing_subscriber::EnvFilter::new("info")
}
