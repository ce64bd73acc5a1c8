use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub mod multipart;
pub mod sign;

const DEFAULT_ENDPOINT: &str = "http://v0.api.upyun.com";

#[derive(Clone, Serialize, Deserialize)]
pub struct UpyunConfig {
    pub bucket: String,
    pub operator: String,
    pub password: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl Debug for UpyunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpyunConfig")
            .field("bucket", &self.bucket)
            .field("operator", &self.operator)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Multipart uploads into an UPYUN bucket.
#[derive(Debug)]
pub struct Upyun {
    client: sign::SigningClient,
}

impl Upyun {
    pub fn new(config: &UpyunConfig) -> Result<Self, Error> {
        Ok(Self {
            client: sign::SigningClient::new(config)?,
        })
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to build http client: {}", source))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("Multipart {} request failed: {}", stage, source))]
    Request {
        source: reqwest::Error,
        stage: &'static str,
    },

    #[snafu(display("Multipart {} rejected with status {}: {}", stage, status, body))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
}
