//! Step sources served by a remote HTTP API

use super::source::{SourceKind, StepSource, StepSourceData};
use crate::error::{Error, Result};
use async_trait::async_trait;
use emx_common::config::RemoteSourceConfig;
use reqwest::StatusCode;
use serde_json::Value;

pub struct HttpStepSource {
    http_client: reqwest::Client,
    kind: SourceKind,
    url_template: String,
    bearer_token: Option<String>,
}

impl HttpStepSource {
    pub fn new(
        http_client: reqwest::Client,
        kind: SourceKind,
        url_template: impl Into<String>,
        bearer_token: Option<String>,
    ) -> Self {
        Self {
            http_client,
            kind,
            url_template: url_template.into(),
            bearer_token,
        }
    }

    pub fn from_config(http_client: reqwest::Client, config: &RemoteSourceConfig) -> Result<Self> {
        let kind = config
            .kind
            .parse::<SourceKind>()
            .map_err(Error::Config)?;
        if !config.url_template.contains("{study_id}") {
            return Err(Error::Config(format!(
                "url_template for {} has no {{study_id}} placeholder",
                kind
            )));
        }
        Ok(Self::new(
            http_client,
            kind,
            config.url_template.clone(),
            config.bearer_token.clone(),
        ))
    }

    pub fn url_for(&self, study_id: &str) -> String {
        self.url_template.replace("{study_id}", study_id)
    }

    fn fetch_error(&self, message: String) -> Error {
        Error::ConfigFetch {
            source_kind: self.kind.to_string(),
            message,
        }
    }
}

/// Responses may wrap the config as `{"data": {...}}`
pub fn unwrap_envelope(body: Value) -> Option<Value> {
    match body {
        Value::Null => None,
        Value::Object(mut map) if map.contains_key("data") => match map.remove("data") {
            Some(Value::Null) | None => None,
            Some(inner) => Some(inner),
        },
        other => Some(other),
    }
}

#[async_trait]
impl StepSource for HttpStepSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn name(&self) -> String {
        format!("http:{}", self.kind)
    }

    async fn get_config(&self, study_id: &str) -> Result<Option<StepSourceData>> {
        let url = self.url_for(study_id);
        tracing::debug!(source = %self.kind, url = %url, "Fetching module config");

        let mut request = self.http_client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.fetch_error(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(self.fetch_error(format!("HTTP {}: {}", status.as_u16(), error_text)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| self.fetch_error(format!("invalid JSON: {}", e)))?;

        Ok(unwrap_envelope(body).map(|config| StepSourceData {
            kind: self.kind,
            config,
        }))
    }
}
