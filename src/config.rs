use anyhow::{anyhow, Result};
use dotenvy::dotenv;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::layers::mailbox::GMAIL_API_BASE;
use crate::layers::resolution::{DEFAULT_MIN_CONFIDENCE, DEFAULT_NAME_THRESHOLD};

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub gmail_access_token: Option<String>,
    pub gmail_api_base: String,
    pub output_dir: PathBuf,
    pub name_match_threshold: f64,
    pub min_match_confidence: f64,
    pub gmail_max_results: usize,
    /// How far back to search the mailbox, counted from the earliest submission date.
    pub gmail_lookback_days: i64,
}

/// Loads `.env`, creating it from `.env.example` on first run.
pub fn load_dotenv() -> Result<()> {
    if !Path::new(".env").exists() && Path::new(".env.example").exists() {
        println!("Creating .env from .env.example...");
        std::fs::copy(".env.example", ".env")?;
    }
    dotenv().ok();
    Ok(())
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let gmail_lookback_days: i64 = parse_var(&var, "GMAIL_LOOKBACK_DAYS", 30)?;
        if gmail_lookback_days < 0 {
            return Err(anyhow!("GMAIL_LOOKBACK_DAYS must not be negative, got {}", gmail_lookback_days));
        }

        Ok(Self {
            gmail_access_token: var("GMAIL_ACCESS_TOKEN"),
            gmail_api_base: var("GMAIL_API_BASE").unwrap_or_else(|| GMAIL_API_BASE.to_string()),
            output_dir: var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("output")),
            name_match_threshold: parse_var(&var, "NAME_MATCH_THRESHOLD", DEFAULT_NAME_THRESHOLD)?,
            min_match_confidence: parse_var(&var, "MIN_MATCH_CONFIDENCE", DEFAULT_MIN_CONFIDENCE)?,
            gmail_max_results: parse_var(&var, "GMAIL_MAX_RESULTS", 500)?,
            gmail_lookback_days,
        })
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}
