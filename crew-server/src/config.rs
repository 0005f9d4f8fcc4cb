//! Environment-sourced server configuration.

use std::env;
use std::path::PathBuf;

use anyhow::Context;

use crew_money::Money;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub admin_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub rules_path: PathBuf,
    pub metrics_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub ocr_enabled: bool,
    pub photo_threshold: Money,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret =
            env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let admin_secret = env::var("INTERNAL_ADMIN_SECRET")
            .context("INTERNAL_ADMIN_SECRET must be set")?;
        let photo_threshold = match env::var("EXPENSE_PHOTO_THRESHOLD") {
            Ok(raw) => Money::parse(&raw)
                .map_err(|err| anyhow::anyhow!("EXPENSE_PHOTO_THRESHOLD: {err}"))?,
            Err(_) => Money::parse("400").map_err(|err| anyhow::anyhow!("{err}"))?,
        };
        Ok(Self {
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "crew.db".into()).into(),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".into()),
            jwt_secret,
            admin_secret,
            access_ttl_secs: parse_secs("JWT_ACCESS_TTL", 900)?,
            refresh_ttl_secs: parse_secs("JWT_REFRESH_TTL", 7 * 24 * 60 * 60)?,
            rules_path: env::var("PRICING_RULES_PATH")
                .unwrap_or_else(|_| "rules/global.yaml".into())
                .into(),
            metrics_dir: env::var("METRICS_DIR")
                .unwrap_or_else(|_| "logs/metrics".into())
                .into(),
            backups_dir: env::var("BACKUPS_DIR").unwrap_or_else(|_| "backups".into()).into(),
            ocr_enabled: env::var("OCR_ENABLED")
                .map(|raw| matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
            photo_threshold,
        })
    }
}

fn parse_secs(var: &str, default: i64) -> anyhow::Result<i64> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("{var} must be an integer number of seconds")),
        Err(_) => Ok(default),
    }
}
