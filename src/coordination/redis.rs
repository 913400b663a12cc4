//! Redis / KeyDB connection pool creation.
//!
//! Builds a [`fred::clients::Pool`] configured from
//! [`crate::config::StoreConfig`], optionally enabling TLS via `rustls` and
//! reading the password from an environment variable.

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, CustomCommand};

use crate::config::StoreConfig;

/// Create a connection pool for the lock store.
///
/// The pool is connected before being returned.  When
/// `config.verify_on_connect` is set the store must also answer a PING, and
/// when `config.client_name` is set every pooled connection announces it with
/// `CLIENT SETNAME`.
pub async fn create_pool(config: &StoreConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    let endpoint = strip_scheme(&config.endpoint);
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = FredConfig {
        server: ServerConfig::new_centralized(host, port),
        database: Some(config.database),
        ..FredConfig::default()
    };

    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(token) = auth_token.filter(|t| !t.is_empty()) {
        fred_config.password = Some(token);
    }

    let mut builder = Builder::from_config(fred_config);
    builder.with_connection_config(|conn| {
        conn.connection_timeout = config.connect_timeout();
    });

    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(config.pool_size)
        .context("failed to build lock store connection pool")?;

    pool.init().await.context("failed to connect to lock store")?;

    if config.verify_on_connect {
        let _: String = pool
            .ping(None)
            .await
            .context("lock store PING failed after connect")?;
    }

    if let Some(name) = &config.client_name {
        for client in pool.clients() {
            let _: String = client
                .custom(
                    CustomCommand::new_static("CLIENT", None::<u16>, false),
                    vec!["SETNAME".to_string(), name.clone()],
                )
                .await
                .with_context(|| format!("CLIENT SETNAME {name} failed"))?;
        }
    }

    tracing::info!(
        host = host,
        port = port,
        tls = config.tls,
        database = config.database,
        pool_size = config.pool_size,
        "lock store pool created"
    );

    Ok(pool)
}

/// Drop an optional `redis://` or `rediss://` scheme.
fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://")
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. a `/0` database suffix).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_port() {
        let (host, port) = parse_host_port("redis.local:6380").unwrap();
        assert_eq!(host, "redis.local");
        assert_eq!(port, 6380);
    }

    #[test]
    fn test_parse_host_port_default() {
        let (host, port) = parse_host_port("redis.local").unwrap();
        assert_eq!(host, "redis.local");
        assert_eq!(port, 6379);
    }

    #[test]
    fn test_parse_host_port_ignores_database_path() {
        let (host, port) = parse_host_port(strip_scheme("redis://10.0.0.5:7000/2")).unwrap();
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, 7000);
    }

    #[test]
    fn test_parse_host_port_rejects_bad_port() {
        assert!(parse_host_port("redis.local:http").is_err());
    }
}
