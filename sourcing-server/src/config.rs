use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use sourcing_core::Framework;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Frameworks that never incur a charge unless configured otherwise.
pub const DEFAULT_EXCLUDED_FRAMEWORKS: &str = "nuclear-and-gas";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Optional bearer token for the operator API.
    /// If not set, the operator API is disabled (returns 503 Service Unavailable).
    pub status_auth_token: Option<String>,
    /// Deliveries of one message before it is dead-lettered. At least 1.
    pub max_deliveries: u32,
    pub billing_excluded_frameworks: Vec<Framework>,
    /// Credits one data sourcing unit costs, shared by everyone billed for it.
    pub data_sourcing_cost: Decimal,
    /// Base URL of the role resolution service.
    pub role_service_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = var("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let status_auth_token = parse_status_auth_token(var("STATUS_AUTH_TOKEN"));

        let max_deliveries = parse_max_deliveries(var("MAX_DELIVERIES"))?;

        let billing_excluded_frameworks =
            parse_excluded_frameworks(var("BILLING_EXCLUDED_FRAMEWORKS"));

        let data_sourcing_cost = parse_data_sourcing_cost(var("DATA_SOURCING_COST"))?;

        let role_service_url = var("ROLE_SERVICE_URL")
            .filter(|s| !s.trim().is_empty())
            .context("ROLE_SERVICE_URL environment variable is required")?;

        Ok(Config {
            port,
            state_dir,
            status_auth_token,
            max_deliveries,
            billing_excluded_frameworks,
            data_sourcing_cost,
            role_service_url,
        })
    }

    /// Path of the SQLite database inside `state_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("sourcing.db")
    }
}

/// Parse STATUS_AUTH_TOKEN from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace.
/// An empty token must never enable unauthenticated access.
pub fn parse_status_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

pub fn parse_max_deliveries(value: Option<String>) -> Result<u32> {
    let Some(value) = value else {
        return Ok(3);
    };
    let parsed = value
        .trim()
        .parse::<u32>()
        .context("MAX_DELIVERIES must be a valid number")?;
    if parsed == 0 {
        bail!("MAX_DELIVERIES must be at least 1");
    }
    Ok(parsed)
}

/// Comma separated list. Blank entries are skipped; an explicitly empty
/// value bills every framework.
pub fn parse_excluded_frameworks(value: Option<String>) -> Vec<Framework> {
    value
        .unwrap_or_else(|| DEFAULT_EXCLUDED_FRAMEWORKS.to_string())
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(Framework::from)
        .collect()
}

pub fn parse_data_sourcing_cost(value: Option<String>) -> Result<Decimal> {
    let Some(value) = value else {
        return Ok(Decimal::ONE);
    };
    let cost = Decimal::from_str(value.trim())
        .context("DATA_SOURCING_COST must be a decimal number")?;
    if cost.is_sign_negative() {
        bail!("DATA_SOURCING_COST must not be negative");
    }
    Ok(cost)
}
