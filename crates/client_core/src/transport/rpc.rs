use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{RpcEnvelope, RpcRequest, RpcResponse},
};

use super::{Transport, TransportError};

/// Primary transport: `POST {server_url}/rpc` over HTTP.
pub struct RpcTransport {
    http: Client,
    server_url: String,
}

impl RpcTransport {
    pub fn new(server_url: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl Transport for RpcTransport {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn call(
        &self,
        user_id: UserId,
        request: RpcRequest,
    ) -> Result<RpcResponse, TransportError> {
        let method = request.method();
        let response = self
            .http
            .post(format!("{}/rpc", self.server_url))
            .json(&RpcEnvelope { user_id, request })
            .send()
            .await
            .map_err(|e| TransportError::unavailable(format!("{method}: {e}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::unavailable(format!("{method}: {e}")))?;

        if status.is_success() {
            return serde_json::from_slice::<RpcResponse>(&body).map_err(|e| {
                TransportError::unavailable(format!("{method}: malformed response: {e}"))
            });
        }

        match serde_json::from_slice::<ApiError>(&body) {
            Ok(api) => Err(TransportError::Api(api)),
            Err(_) => Err(TransportError::unavailable(format!(
                "{method}: server answered {status}"
            ))),
        }
    }

    async fn health(&self) -> Result<(), TransportError> {
        let response = self
            .http
            .get(format!("{}/healthz", self.server_url))
            .send()
            .await
            .map_err(|e| TransportError::unavailable(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::unavailable(format!(
                "healthz answered {}",
                response.status()
            )))
        }
    }
}
