use anyhow::{Context, Result};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";
const DEFAULT_OUTBOUND_BUFFER: usize = 64;
const DEFAULT_SESSION_IDLE_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    pub session_idle_minutes: i64,
    pub log_format: LogFormat,
}

impl Config {
    /// Reads the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let outbound_buffer = match lookup("OUTBOUND_BUFFER") {
            Some(v) => v.parse().with_context(|| format!("OUTBOUND_BUFFER={v:?}"))?,
            None => DEFAULT_OUTBOUND_BUFFER,
        };
        let session_idle_minutes = match lookup("SESSION_IDLE_MINUTES") {
            Some(v) => v.parse().with_context(|| format!("SESSION_IDLE_MINUTES={v:?}"))?,
            None => DEFAULT_SESSION_IDLE_MINUTES,
        };
        let log_format = match lookup("LOG_FORMAT").as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => anyhow::bail!("LOG_FORMAT must be pretty or json, got {other:?}"),
        };

        Ok(Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_owned()),
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_owned()),
            outbound_buffer,
            session_idle_minutes,
            log_format,
        })
    }

    pub fn session_idle(&self) -> time::Duration {
        time::Duration::minutes(self.session_idle_minutes)
    }
}
