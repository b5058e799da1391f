use anyhow::{Context, Result};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_postgres::NoTls;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Use with caution.
    /// Only honoured in Prefer/Require modes.
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    /// If not set, the system CA store is used.
    pub ca_cert_path: Option<String>,
    pub connect_timeout_secs: u64,
}

/// Standard libpq `sslmode` values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    /// TLS when the server offers it.
    #[default]
    Prefer,
    /// TLS, certificate not verified unless a CA file is configured.
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    fn strict(self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

impl ConnectionConfig {
    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            connect_timeout_secs: 10,
        }
    }
}

/// Bounds of the shared connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_size: usize,
    /// How long a request may wait for a free connection.
    pub wait_timeout_ms: u64,
    pub create_timeout_ms: u64,
    /// Upper bound on the health check of an idle connection before reuse.
    pub recycle_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            wait_timeout_ms: 5_000,
            create_timeout_ms: 10_000,
            recycle_timeout_ms: 2_000,
        }
    }
}

/// Build the bounded PostgreSQL pool. Connections are opened lazily.
pub fn create_pool(config: &ConnectionConfig, settings: &PoolSettings) -> Result<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.dbname = Some(config.database.clone());
    cfg.user = Some(config.username.clone());
    if !config.password.is_empty() {
        cfg.password = Some(config.password.clone());
    }
    cfg.connect_timeout = Some(Duration::from_secs(config.connect_timeout_secs));
    cfg.ssl_mode = Some(match config.ssl_mode {
        SslMode::Disable => deadpool_postgres::SslMode::Disable,
        SslMode::Prefer => deadpool_postgres::SslMode::Prefer,
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            deadpool_postgres::SslMode::Require
        }
    });
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let mut timeouts = Timeouts::default();
    timeouts.wait = Some(Duration::from_millis(settings.wait_timeout_ms));
    timeouts.create = Some(Duration::from_millis(settings.create_timeout_ms));
    timeouts.recycle = Some(Duration::from_millis(settings.recycle_timeout_ms));
    let mut pool_config = PoolConfig::new(settings.max_size);
    pool_config.timeouts = timeouts;
    cfg.pool = Some(pool_config);

    let pool = if config.ssl_mode == SslMode::Disable {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
    } else {
        let tls = build_tls_connector(config, config.ssl_mode.strict())?;
        cfg.create_pool(Some(Runtime::Tokio1), tls)
    }
    .with_context(|| format!("Failed to create pool for {}", config.display_string()))?;

    tracing::info!(
        target_db = %config.display_string(),
        max_size = settings.max_size,
        "connection pool ready"
    );
    Ok(pool)
}

/// `strict` ignores `accept_invalid_certs` (verify-ca / verify-full).
fn build_tls_connector(config: &ConnectionConfig, strict: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let ca_data = std::fs::read(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        let cert = native_tls::Certificate::from_pem(&ca_data)
            .context("Failed to parse CA certificate")?;
        builder.add_root_certificate(cert);
    }

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connection() {
        let c = ConnectionConfig::default();
        assert_eq!(c.port, 5432);
        assert_eq!(c.ssl_mode, SslMode::Prefer);
        assert_eq!(c.display_string(), "postgres@localhost:5432/postgres");
    }

    #[test]
    fn test_ssl_mode_from_toml() {
        let c: ConnectionConfig = toml::from_str(
            r#"
            host = "db.internal"
            database = "hr"
            ssl_mode = "verify-full"
            "#,
        )
        .unwrap();
        assert_eq!(c.host, "db.internal");
        assert_eq!(c.database, "hr");
        assert_eq!(c.port, 5432);
        assert_eq!(c.ssl_mode, SslMode::VerifyFull);
    }

    #[test]
    fn test_password_is_never_serialized() {
        let c = ConnectionConfig {
            password: "hunter2".into(),
            ..Default::default()
        };
        let out = toml::to_string(&c).unwrap();
        assert!(!out.contains("hunter2"));
    }

    #[test]
    fn test_strict_modes() {
        assert!(!SslMode::Require.strict());
        assert!(SslMode::VerifyCa.strict());
        assert!(SslMode::VerifyFull.strict());
    }

    #[test]
    fn test_default_pool_bounds() {
        let p = PoolSettings::default();
        assert_eq!(p.max_size, 10);
        assert!(p.wait_timeout_ms > 0);
    }

    #[tokio::test]
    async fn test_create_pool_is_lazy() {
        let config = ConnectionConfig {
            ssl_mode: SslMode::Disable,
            port: 1,
            ..Default::default()
        };
        let pool = create_pool(&config, &PoolSettings::default()).unwrap();
        assert_eq!(pool.status().max_size, 10);
        assert_eq!(pool.status().size, 0);
    }
}
