use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use anyhow::{Context, Result};
use tracing::{info, warn};

const DEV_SECRET: &str = "dev-secret-change-me";

pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub storage_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let jwt_secret = env::var("SAVOR_JWT_SECRET").unwrap_or_else(|_| {
            warn!("SAVOR_JWT_SECRET not set, using the development secret");
            DEV_SECRET.to_string()
        });

        Ok(Self {
            host: try_load("SAVOR_HOST", "0.0.0.0")?,
            port: try_load("SAVOR_PORT", "3000")?,
            db_path: try_load("SAVOR_DB_PATH", "savor.db")?,
            jwt_secret,
            storage_dir: try_load("SAVOR_STORAGE_DIR", "./storage")?,
        })
    }
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
