use std::time::Duration;

use snafu::{ResultExt, ensure};

use super::endpoint::ImageEndpoint;
use super::error::{BuildClientSnafu, ImagineResult, ReadBodySnafu, RequestSnafu, StatusSnafu};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct ImageClient {
    http: reqwest::Client,
    endpoint: ImageEndpoint,
}

impl ImageClient {
    pub fn new(endpoint: ImageEndpoint) -> ImagineResult<Self> {
        // Synthesis happens on first GET, so the timeout has to cover render time.
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context(BuildClientSnafu {
                stage: "image-client-build",
            })?;

        Ok(Self {
            http,
            endpoint: endpoint.normalized(),
        })
    }

    pub fn prompt_url(&self, prompt: &str) -> String {
        self.endpoint.prompt_url(prompt)
    }

    /// Fetches the bytes behind `url`. Any non-success status is an error.
    pub async fn fetch_image(&self, url: &str) -> ImagineResult<Vec<u8>> {
        let response = self.http.get(url).send().await.context(RequestSnafu {
            stage: "image-fetch-send",
            url: url.to_string(),
        })?;

        let status = response.status();
        ensure!(
            status.is_success(),
            StatusSnafu {
                stage: "image-fetch-status",
                url: url.to_string(),
                status: status.as_u16(),
            }
        );

        let bytes = response.bytes().await.context(ReadBodySnafu {
            stage: "image-fetch-body",
            url: url.to_string(),
        })?;

        tracing::debug!(url, byte_count = bytes.len(), "fetched image bytes");
        Ok(bytes.to_vec())
    }
}
