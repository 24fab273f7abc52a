use std::{env, fmt::Display, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use tracing::info;

/// Where the client finds the backend.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub realtime_url: String,
    pub access_token: Option<String>,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>, realtime_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            realtime_url: realtime_url.into(),
            access_token: None,
            request_timeout: Duration::from_secs(15),
        }
    }

    /// Reads `SAVOR_API_URL`, `SAVOR_REALTIME_URL`, `SAVOR_ACCESS_TOKEN` and
    /// `SAVOR_REQUEST_TIMEOUT_SECS`. Loading a `.env` file is left to the
    /// embedding binary.
    pub fn from_env() -> Result<Self> {
        let api_url: String = try_load("SAVOR_API_URL", "http://localhost:3000")?;
        let realtime_url = match env::var("SAVOR_REALTIME_URL") {
            Ok(url) => url,
            Err(_) => realtime_url_for(&api_url),
        };
        let timeout_secs: u64 = try_load("SAVOR_REQUEST_TIMEOUT_SECS", "15")?;

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            realtime_url,
            access_token: env::var("SAVOR_ACCESS_TOKEN").ok().filter(|t| !t.is_empty()),
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

/// `http(s)://host` becomes `ws(s)://host/realtime`.
pub fn realtime_url_for(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws}/realtime")
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    raw.parse()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("Invalid {key} value '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_url_follows_api_scheme() {
        assert_eq!(realtime_url_for("http://localhost:3000"), "ws://localhost:3000/realtime");
        assert_eq!(realtime_url_for("https://api.savor.app/"), "wss://api.savor.app/realtime");
    }
}
