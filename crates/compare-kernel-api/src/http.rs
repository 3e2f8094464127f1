use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use compare_kernel_core::{FetchError, Identifier, VehicleRecord};
use reqwest::StatusCode;
use url::Url;

use crate::resolver::RecordSource;

/// Record source answering `GET {base}/vehicles/{id}` with one JSON vehicle record.
#[derive(Debug, Clone)]
pub struct HttpRecordSource {
    client: reqwest::Client,
    base: Url,
}

impl HttpRecordSource {
    /// # Errors
    /// Returns an error when `base_url` is not an absolute URL or the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base =
            Url::parse(base_url).with_context(|| format!("invalid record store url {base_url}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build record store client")?;

        Ok(Self { client, base })
    }

    /// # Errors
    /// Returns [`FetchError::Transport`] when the record URL cannot be formed.
    pub fn record_url(&self, id: &Identifier) -> Result<Url, FetchError> {
        self.base
            .join(&format!("vehicles/{id}"))
            .map_err(|err| FetchError::Transport(format!("invalid record url: {err}")))
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    async fn fetch(&self, id: &Identifier) -> Result<VehicleRecord, FetchError> {
        let url = self.record_url(id)?;
        let response = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(id.clone()));
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response.json::<VehicleRecord>().await.map_err(|err| FetchError::Malformed(err.to_string()))
    }
}
