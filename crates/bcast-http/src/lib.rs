//! HTTP transport for the remote chat endpoint (reqwest).
//!
//! `POST {base}/channels/{destination}/messages` with the identity token as
//! `Authorization`, the client tag as `User-Agent` and `{"content": body}`.

use std::time::Duration;

use async_trait::async_trait;
use bcast_core::{
    errors::Error,
    sender::{PostRequest, Transport, TransportError, TransportResponse},
    Result,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct HttpTransport {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::External(format!("http client build failed: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn messages_url(&self, destination: &str) -> String {
        format!("{}/channels/{destination}/messages", self.base_url)
    }

    async fn post(&self, req: PostRequest<'_>) -> std::result::Result<TransportResponse, TransportError> {
        let resp = self
            .http
            .post(self.messages_url(req.destination))
            .header(reqwest::header::AUTHORIZATION, req.auth_token)
            .header(reqwest::header::USER_AGENT, req.client_tag)
            .json(&serde_json::json!({ "content": req.body }))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(map_reqwest_error)?;
        Ok(TransportResponse { status, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_message(
        &self,
        req: PostRequest<'_>,
        cancel: &CancellationToken,
    ) -> std::result::Result<TransportResponse, TransportError> {
        tracing::debug!(destination = req.destination, "posting message");
        // Dropping the request future aborts the connection.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            out = self.post(req) => out,
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else {
        TransportError::Io(e.to_string())
    }
}
