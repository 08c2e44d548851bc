use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::SfError;

pub const DEFAULT_IPFS_GATEWAY: &str = "https://ipfs.io";

/// Fetches objects that are not yet held by the local store.
pub trait RemoteClient: Send + Sync {
    fn fetch_ipfs(&self, cid: &str) -> Result<Vec<u8>, SfError>;
}

#[derive(Clone)]
pub struct GatewayHttpClient {
    client: Client,
    base_url: String,
}

impl GatewayHttpClient {
    pub fn new() -> Result<Self, SfError> {
        let base_url =
            std::env::var("SF_IPFS_GATEWAY").unwrap_or_else(|_| DEFAULT_IPFS_GATEWAY.to_string());
        Self::with_base_url(base_url)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, SfError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("sf-pipeline/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SfError::GatewayHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| SfError::GatewayHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn ipfs_url(&self, cid: &str) -> String {
        format!("{}/ipfs/{cid}", self.base_url)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, SfError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "gateway request failed".to_string());
        Err(SfError::GatewayStatus { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, SfError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        tracing::debug!(status, attempt, "retrying gateway request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(SfError::GatewayHttp(err.to_string()));
                }
            }
        }
    }
}

impl RemoteClient for GatewayHttpClient {
    fn fetch_ipfs(&self, cid: &str) -> Result<Vec<u8>, SfError> {
        let url = self.ipfs_url(cid);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let response = Self::handle_status(response)?;
        let bytes = response
            .bytes()
            .map_err(|err| SfError::GatewayHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipfs_url_strips_trailing_slash() {
        let client = GatewayHttpClient::with_base_url("https://gateway.example/").unwrap();
        assert_eq!(
            client.ipfs_url("bafkreiaeqg3vtca6c6j2"),
            "https://gateway.example/ipfs/bafkreiaeqg3vtca6c6j2"
        );
    }
}
