//! config/dispatch_config.rs
//! Configuración del motor de difusión (token, límites de envío, lotes, etc.)

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Configuración del despachador, con valores por defecto.
/// Se carga desde variables de entorno (o un .env) al arrancar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Token del bot (BOT_TOKEN). Obligatorio.
    #[serde(skip_serializing)]
    pub credential: String,
    pub api_base_url: String,
    pub rate_limit: u32,       // envíos por segundo
    pub batch_size: usize,     // destinatarios por lote
    pub max_concurrency: usize, // tope de envíos simultáneos
    pub idle_poll_interval: Duration,
    pub throttle_interval: Duration,
    pub request_timeout: Duration,
    /// Si existe, las difusiones "inprogress" sin latido se devuelven a "pending".
    pub lease_timeout: Option<Duration>,
    pub checkpoint_retries: u32,
    pub database_url: String,
    pub server_addr: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            credential: String::new(),
            api_base_url: "https://api.telegram.org".to_string(),
            rate_limit: 30,
            batch_size: 30,
            max_concurrency: 30,
            idle_poll_interval: Duration::from_secs(10),
            throttle_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            lease_timeout: None,
            checkpoint_retries: 3,
            database_url: "sqlite:./data/broadcasts.db".to_string(),
            server_addr: "0.0.0.0:5022".to_string(),
        }
    }
}

impl DispatchConfig {
    /// Lee la configuración del entorno del proceso.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Igual que `from_env`, pero con una función de búsqueda arbitraria
    /// (útil en tests para no tocar el entorno global).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = DispatchConfig::default();

        let credential = lookup("BOT_TOKEN")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("BOT_TOKEN environment variable not set"))?;

        let config = DispatchConfig {
            credential,
            api_base_url: lookup("TELEGRAM_API_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base_url),
            rate_limit: parse_or(&lookup, "BROADCAST_RATE_LIMIT", defaults.rate_limit)?,
            batch_size: parse_or(&lookup, "BROADCAST_BATCH_SIZE", defaults.batch_size)?,
            max_concurrency: parse_or(&lookup, "BROADCAST_MAX_WORKERS", defaults.max_concurrency)?,
            idle_poll_interval: Duration::from_secs(parse_or(
                &lookup,
                "BROADCAST_IDLE_POLL_SECS",
                defaults.idle_poll_interval.as_secs(),
            )?),
            throttle_interval: Duration::from_millis(parse_or(
                &lookup,
                "BROADCAST_THROTTLE_MS",
                defaults.throttle_interval.as_millis() as u64,
            )?),
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "BROADCAST_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            lease_timeout: match lookup("BROADCAST_LEASE_SECS") {
                Some(raw) => Some(Duration::from_secs(parse_value("BROADCAST_LEASE_SECS", &raw)?)),
                None => None,
            },
            checkpoint_retries: parse_or(
                &lookup,
                "BROADCAST_CHECKPOINT_RETRIES",
                defaults.checkpoint_retries,
            )?,
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            server_addr: lookup("SERVER_ADDR").unwrap_or(defaults.server_addr),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.credential.trim().is_empty() {
            bail!("BOT_TOKEN environment variable not set");
        }
        if self.rate_limit == 0 {
            bail!("BROADCAST_RATE_LIMIT debe ser mayor que 0");
        }
        if self.batch_size == 0 {
            bail!("BROADCAST_BATCH_SIZE debe ser mayor que 0");
        }
        if self.max_concurrency == 0 {
            bail!("BROADCAST_MAX_WORKERS debe ser mayor que 0");
        }
        if matches!(self.lease_timeout, Some(lease) if lease.is_zero()) {
            bail!("BROADCAST_LEASE_SECS debe ser mayor que 0");
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("Valor inválido para {}: '{}'", key, raw))
}
