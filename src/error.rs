use thiserror::Error;

/// Failure that excludes a whole entity group from featurization.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeatureError {
    #[error("event {event_id} is missing {field}")]
    MissingCoordinate { event_id: i64, field: &'static str },

    #[error("event {event_id} has out-of-range {field}: {value}")]
    InvalidCoordinate {
        event_id: i64,
        field: &'static str,
        value: f64,
    },
}

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("{what} has {actual} rows, expected {expected}")]
    RowCountMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("attribution response has no values for feature `{0}`")]
    MissingFeature(String),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("request to endpoint `{endpoint}` failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("endpoint `{endpoint}` returned {status}: {body}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("endpoint `{endpoint}` returned an undecodable body: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode model input: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret `{id}` could not be read: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("secret `{id}` is malformed: {source}")]
    Malformed {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("secret `{id}` has an invalid port `{port}`")]
    InvalidPort { id: String, port: String },

    #[error("credential variable {name} is not set")]
    MissingVariable { name: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offender() {
        let err = FeatureError::MissingCoordinate {
            event_id: 7,
            field: "event_latitude",
        };
        assert_eq!(err.to_string(), "event 7 is missing event_latitude");

        let err = ScoringError::RowCountMismatch {
            what: "predicted scores".to_string(),
            expected: 3,
            actual: 2,
        };
        assert!(err.to_string().contains("expected 3"));

        assert_eq!(
            ConfigError::Missing("MODEL_ENDPOINT_URL").to_string(),
            "MODEL_ENDPOINT_URL must be set"
        );
    }
}
