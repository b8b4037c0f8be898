use super::error::{self, Result};
use super::ImageFactoryClient;
use crate::constants::DEFAULT_IMAGE_FACTORY_URL;
use crate::image::{Schematic, SchematicId};

use async_trait::async_trait;
use serde::Deserialize;
use snafu::ResultExt;
use tokio::time::Duration;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::instrument;

const IMAGE_FACTORY_URL_ENV_VAR: &str = "TALOS_FACTORY_URL";

// The factory client uses exponential backoff.
// These values configure how long to delay between tries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
const NUM_RETRIES: usize = 5;

fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
        .max_delay(RETRY_MAX_DELAY)
        .map(jitter)
        .take(NUM_RETRIES)
}

#[derive(Debug, Deserialize)]
struct SchematicResponse {
    id: String,
}

#[derive(Clone, Debug)]
pub struct HttpImageFactoryClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpImageFactoryClient {
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        HttpImageFactoryClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Uses `$TALOS_FACTORY_URL`, falling back to the public factory.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var(IMAGE_FACTORY_URL_ENV_VAR)
                .unwrap_or_else(|_| DEFAULT_IMAGE_FACTORY_URL.to_string()),
        )
    }

    fn schematics_url(&self) -> String {
        format!("{}/schematics", self.base_url)
    }
}

#[async_trait]
impl ImageFactoryClient for HttpImageFactoryClient {
    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    #[instrument(skip(self), err)]
    async fn submit_schematic(&self, schematic: &Schematic) -> Result<SchematicId> {
        let url = self.schematics_url();
        Retry::spawn(retry_strategy(), || async {
            let response = self
                .http_client
                .post(&url)
                .json(schematic)
                .send()
                .await
                .context(error::FactoryRequestSnafu { url: url.clone() })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return error::FactoryResponseSnafu {
                    status_code: status,
                    response: body,
                }
                .fail();
            }

            let created = response
                .json::<SchematicResponse>()
                .await
                .context(error::FactoryRequestSnafu { url: url.clone() })?;
            Ok(SchematicId::new(created.id))
        })
        .await
    }
}
