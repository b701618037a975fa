//! Environment-driven configuration
//!
//! All runtime knobs come from the process environment. Secrets have
//! development fallbacks but are fatal when missing in production.

use anyhow::{anyhow, bail, Result};
use std::env;
use std::path::PathBuf;
use tracing::warn;

const DEV_JWT_SECRET: &str = "default-dev-secret-change-in-production";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    /// SQLite database path; `:memory:` is accepted for tests
    pub db_path: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
    /// 32-byte AES-256-GCM key for at-rest wrapping; `None` disables wrapping
    pub encryption_key: Option<[u8; 32]>,
    pub allowed_origins: Vec<String>,
    pub frontend_dir: PathBuf,
    pub upload_dir: PathBuf,
    /// When set, a dropped connection clears the user's voice state and
    /// emits VOICE_STATE_LEAVE. Off by default: a quick reconnect keeps the
    /// voice seat.
    pub clear_voice_on_disconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            environment: Environment::Development,
            db_path: "./shitcord.db".to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_expiry_hours: 72,
            encryption_key: None,
            allowed_origins: vec!["http://localhost:5173".to_string()],
            frontend_dir: PathBuf::from("../frontend/dist"),
            upload_dir: PathBuf::from("./uploads"),
            clear_voice_on_disconnect: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = env::var("HOST") {
            config.host = host;
        }

        if let Ok(port) = env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|_| anyhow!("invalid PORT value: {port}"))?;
        }

        config.environment = match env::var("ENVIRONMENT").as_deref() {
            Ok("production") => Environment::Production,
            _ => Environment::Development,
        };
        let production = config.environment == Environment::Production;

        match env::var("DB_DRIVER").as_deref().unwrap_or("sqlite") {
            "sqlite" => {
                if let Ok(path) = env::var("DB_PATH") {
                    config.db_path = path;
                }
            }
            "postgres" => {
                bail!("DB_DRIVER=postgres is not supported by this build; use DB_DRIVER=sqlite")
            }
            other => bail!("unknown DB_DRIVER: {other}"),
        }

        match env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => config.jwt_secret = secret,
            _ if production => bail!("JWT_SECRET must be set in production"),
            _ => warn!("JWT_SECRET not set, using development default"),
        }

        if let Ok(hours) = env::var("JWT_EXPIRY_HOURS") {
            config.jwt_expiry_hours = hours
                .parse()
                .map_err(|_| anyhow!("invalid JWT_EXPIRY_HOURS value: {hours}"))?;
        }

        match env::var("ENCRYPTION_KEY") {
            Ok(hex_key) if !hex_key.is_empty() => {
                config.encryption_key = Some(parse_encryption_key(&hex_key)?);
            }
            _ if production => bail!("ENCRYPTION_KEY must be set in production"),
            _ => warn!("ENCRYPTION_KEY not set, at-rest message wrapping disabled"),
        }

        if let Ok(origins) = env::var("ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        if let Ok(dir) = env::var("FRONTEND_DIR") {
            config.frontend_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = env::var("UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(dir);
        }

        if let Ok(val) = env::var("VOICE_CLEAR_ON_DISCONNECT") {
            config.clear_voice_on_disconnect = val != "false" && val != "0";
        }

        Ok(config)
    }
}

/// Parse a 64-hex-char string into a 32-byte AES key.
fn parse_encryption_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|_| anyhow!("invalid ENCRYPTION_KEY format: must be hex-encoded"))?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("ENCRYPTION_KEY must be 32 bytes (64 hex characters)"))
}
