//! Runtime configuration, read from the environment once at startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::scoring::DEFAULT_ATTRIBUTION_BATCH_SIZE;

const INTERVAL_UNITS: [&str; 12] = [
    "minute", "minutes", "hour", "hours", "day", "days", "week", "weeks", "month", "months",
    "year", "years",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub rds_secret_name: String,
    pub secrets_dir: PathBuf,
    pub schema: String,
    pub event_predicted_table: String,
    pub actor_predicted_table: String,
    pub event_prediction_endpoint: String,
    pub event_estimator_endpoint: String,
    pub actor_prediction_endpoint: String,
    pub actor_estimator_endpoint: String,
    /// Postgres interval literal, e.g. `7 day`.
    pub interval: String,
    /// Only the scoring run needs it; see [`Config::model_endpoint_url`].
    pub model_endpoint_url: Option<String>,
    pub attribution_batch_size: usize,
    pub endpoint_max_concurrency: usize,
    pub endpoint_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str, default: &str| -> Result<String, ConfigError> {
            match lookup(key) {
                None => Ok(default.to_string()),
                Some(value) if value.trim().is_empty() => Err(ConfigError::Missing(key)),
                Some(value) => Ok(value.trim().to_string()),
            }
        };
        let number = |key: &'static str, default: usize| -> Result<usize, ConfigError> {
            let raw = get(key, &default.to_string())?;
            match raw.parse::<usize>() {
                Ok(value) if value > 0 => Ok(value),
                _ => Err(ConfigError::Invalid {
                    name: key,
                    reason: format!("expected a positive integer, got `{raw}`"),
                }),
            }
        };

        let model_endpoint_url = match lookup("MODEL_ENDPOINT_URL") {
            None => None,
            Some(url) if url.trim().is_empty() => return Err(ConfigError::Missing("MODEL_ENDPOINT_URL")),
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                Some(url.trim().to_string())
            }
            Some(_) => {
                return Err(ConfigError::Invalid {
                    name: "MODEL_ENDPOINT_URL",
                    reason: "must be an http(s) URL".to_string(),
                })
            }
        };

        let config = Self {
            rds_secret_name: get("RDS_SECRET_NAME", "dev-anamoly-detection-rds")?,
            secrets_dir: PathBuf::from(get("SECRETS_DIR", "/run/secrets")?),
            schema: identifier("SCHEMA", get("SCHEMA", "public")?)?,
            event_predicted_table: identifier(
                "EVENT_PREDICTED_TABLE",
                get("EVENT_PREDICTED_TABLE", "event_predicted")?,
            )?,
            actor_predicted_table: identifier(
                "PERSON_OF_INTEREST_PREDICTED_TABLE",
                get("PERSON_OF_INTEREST_PREDICTED_TABLE", "person_of_interest_predicted")?,
            )?,
            event_prediction_endpoint: get(
                "EVENT_PREDICTION_ENDPOINT_NAME",
                "anamoly-detection-event-prediction-endpoint",
            )?,
            event_estimator_endpoint: get(
                "EVENT_ESTIMATOR_ENDPOINT_NAME",
                "anamoly-detection-event-estimator-endpoint",
            )?,
            actor_prediction_endpoint: get(
                "PERSON_OF_INTEREST_PREDICTION_ENDPOINT_NAME",
                "anamoly-detection-person_of_interest-prediction-endpoint",
            )?,
            actor_estimator_endpoint: get(
                "PERSON_OF_INTEREST_ESTIMATOR_ENDPOINT_NAME",
                "anamoly-detection-person_of_interest-estimator-endpoint",
            )?,
            interval: parse_interval(&get("INTERVAL", "7 day")?)?,
            model_endpoint_url,
            attribution_batch_size: number("ATTRIBUTION_BATCH_SIZE", DEFAULT_ATTRIBUTION_BATCH_SIZE)?,
            endpoint_max_concurrency: number("ENDPOINT_MAX_CONCURRENCY", 10)?,
            endpoint_timeout: Duration::from_secs(number("ENDPOINT_TIMEOUT_SECS", 60)? as u64),
        };

        Ok(config)
    }

    pub fn model_endpoint_url(&self) -> Result<&str, ConfigError> {
        self.model_endpoint_url
            .as_deref()
            .ok_or(ConfigError::Missing("MODEL_ENDPOINT_URL"))
    }
}

fn identifier(name: &'static str, value: String) -> Result<String, ConfigError> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && value.len() <= 63 {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            name,
            reason: format!("`{value}` is not a plain SQL identifier"),
        })
    }
}

/// Accepts `7 day` as well as the SQL form `interval '7 day'` and returns the
/// bare `<count> <unit>` literal.
pub fn parse_interval(raw: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::Invalid {
        name: "INTERVAL",
        reason: format!("expected `<count> <unit>`, got `{raw}`"),
    };

    let mut text = raw.trim();
    if let Some(prefix) = text.get(..8) {
        if prefix.eq_ignore_ascii_case("interval") {
            text = text[8..].trim();
        }
    }
    let text = text.trim_matches('\'').trim();

    let mut parts = text.split_whitespace();
    let (Some(count), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };
    let count: u32 = count.parse().map_err(|_| invalid())?;
    let unit = unit.to_ascii_lowercase();
    if count == 0 || !INTERVAL_UNITS.contains(&unit.as_str()) {
        return Err(invalid());
    }
    Ok(format!("{count} {unit}"))
}
