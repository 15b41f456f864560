use std::time::Duration;

use log::*;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client,
    Method,
    StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::gateway::GatewayError;

pub(crate) const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// A thin JSON client shared by the providers. Requests are sent exactly once.
#[derive(Clone)]
pub(crate) struct RestClient {
    base_url: String,
    client: Client,
}

impl RestClient {
    pub fn new(base_url: &str, headers: &[(&'static str, &str)], timeout: Duration) -> Result<Self, GatewayError> {
        let mut header_map = HeaderMap::with_capacity(headers.len() + 1);
        for (name, value) in headers {
            let val = HeaderValue::from_str(value).map_err(|e| GatewayError::Initialization(e.to_string()))?;
            header_map.insert(*name, val);
        }
        header_map.insert("Content-Type", HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(header_map)
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Initialization(e.to_string()))?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Sends the request and decodes a successful response. A 404 comes back as `Ok(None)` so that callers can map it
    /// to a domain-specific error.
    pub async fn send<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<T>, GatewayError> {
        self.execute(method, path, body, None).await
    }

    /// As [`send`](Self::send), with an `Idempotency-Key` header. The provider applies repeated requests carrying the
    /// same key once, and answers them with the original response.
    pub async fn send_idempotent<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        idempotency_key: &str,
    ) -> Result<Option<T>, GatewayError> {
        self.execute(method, path, body, Some(idempotency_key)).await
    }

    async fn execute<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        idempotency_key: Option<&str>,
    ) -> Result<Option<T>, GatewayError> {
        let url = self.url(path);
        trace!("💳️ {method} {url}");
        let mut req = self.client.request(method, url);
        if let Some(key) = idempotency_key {
            req = req.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let response = req.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("💳️ Provider returned 404 for {path}");
            return Ok(None);
        }
        if status.is_success() {
            let result = response.json::<T>().await.map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
            Ok(Some(result))
        } else {
            let message = response.text().await.unwrap_or_default();
            warn!("💳️ Provider rejected {path}. Error {status}. {message}");
            Err(GatewayError::Rejected { status: status.as_u16(), message })
        }
    }
}
