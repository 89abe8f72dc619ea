//! Hosted model endpoints: the anomaly scorer and the attribution explainer.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::EndpointError;
use crate::matrix::FeatureMatrix;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoreResponse {
    pub predicted_decision_scores: Vec<f64>,
    pub fitted_decision_scores: Vec<f64>,
}

/// Per-feature attribution values, either as plain lists or as the
/// index-keyed objects a dataframe `to_dict()` produces.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AttributionValues {
    List(Vec<f64>),
    Indexed(BTreeMap<String, f64>),
}

impl AttributionValues {
    pub fn into_vec(self) -> Vec<f64> {
        match self {
            AttributionValues::List(values) => values,
            AttributionValues::Indexed(map) => {
                let mut entries: Vec<(usize, String, f64)> = map
                    .into_iter()
                    .map(|(key, value)| (key.parse().unwrap_or(usize::MAX), key, value))
                    .collect();
                entries.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
                entries.into_iter().map(|(_, _, value)| value).collect()
            }
        }
    }
}

pub type AttributionResponse = HashMap<String, AttributionValues>;

#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    fn name(&self) -> &str;

    /// Sends the matrix as headerless CSV and returns the raw response body.
    async fn invoke(&self, input: &FeatureMatrix) -> Result<Vec<u8>, EndpointError>;

    async fn score(&self, input: &FeatureMatrix) -> Result<ScoreResponse, EndpointError> {
        let body = self.invoke(input).await?;
        serde_json::from_slice(&body).map_err(|source| EndpointError::Decode {
            endpoint: self.name().to_string(),
            source,
        })
    }

    async fn explain(&self, input: &FeatureMatrix) -> Result<AttributionResponse, EndpointError> {
        let body = self.invoke(input).await?;
        serde_json::from_slice(&body).map_err(|source| EndpointError::Decode {
            endpoint: self.name().to_string(),
            source,
        })
    }
}

pub struct HttpModelEndpoint {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpModelEndpoint {
    pub fn new(base_url: &str, name: &str, timeout: Duration) -> Result<Self, EndpointError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|source| EndpointError::Transport {
                endpoint: name.to_string(),
                source,
            })?;

        Ok(Self {
            name: name.to_string(),
            url: invocation_url(base_url, name),
            client,
        })
    }
}

pub fn invocation_url(base_url: &str, name: &str) -> String {
    format!("{}/endpoints/{}/invocations", base_url.trim_end_matches('/'), name)
}

#[async_trait]
impl ModelEndpoint for HttpModelEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: &FeatureMatrix) -> Result<Vec<u8>, EndpointError> {
        let body = input.to_csv_body()?;
        debug!(endpoint = %self.name, rows = input.len(), "invoking model endpoint");

        let transport = |source| EndpointError::Transport {
            endpoint: self.name.clone(),
            source,
        };
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .header(reqwest::header::ACCEPT, "application/json")
            .body(body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EndpointError::Status {
                endpoint: self.name.clone(),
                status,
                body,
            });
        }

        let bytes = response.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }
}
