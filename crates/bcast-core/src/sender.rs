//! One identity's outbound side: credentials + transport + retry.

use std::{
    fmt,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use rand::{seq::SliceRandom, Rng};
use tokio_util::sync::CancellationToken;

use crate::{
    classify::classify,
    domain::{Delivery, FailureCategory, Identity},
    retry::RetryPolicy,
};

const ERROR_BODY_MAX_CHARS: usize = 200;

/// A single outbound HTTP-ish request.
#[derive(Clone, Copy, Debug)]
pub struct PostRequest<'a> {
    pub destination: &'a str,
    pub auth_token: &'a str,
    pub client_tag: &'a str,
    pub body: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Failures below the HTTP status layer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Io(String),

    #[error("cancelled")]
    Cancelled,
}

/// Port for the remote message endpoint.
///
/// Implementations must abort the in-flight request and return
/// [`TransportError::Cancelled`] promptly once `cancel` fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_message(
        &self,
        req: PostRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    Forbidden,
    RateLimited,
    ServerError,
    Other,
}

impl Rejection {
    /// `None` for 2xx.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            403 => Some(Rejection::Forbidden),
            429 => Some(Rejection::RateLimited),
            s if s >= 500 => Some(Rejection::ServerError),
            _ => Some(Rejection::Other),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Rejection::Forbidden => " forbidden",
            Rejection::RateLimited => " rate limited",
            Rejection::ServerError => " server error",
            Rejection::Other => "",
        }
    }
}

fn body_suffix(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(": {body}")
    }
}

/// Why one attempt failed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("HTTP {status}{}{}", .kind.label(), body_suffix(.body))]
    Rejected {
        kind: Rejection,
        status: u16,
        body: String,
    },

    #[error("cancelled")]
    Cancelled,
}

impl From<TransportError> for SendError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => SendError::Cancelled,
            other => SendError::Transport(other.to_string()),
        }
    }
}

/// What the broadcast engine needs from a sender.
#[async_trait]
pub trait MessageSender: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `message` to `destination`. Never fails outward: every failure
    /// becomes a [`Delivery::Failed`].
    async fn send(&self, destination: &str, message: &str, cancel: &CancellationToken)
        -> Delivery;
}

pub struct Sender {
    identity: Identity,
    transport_tag: RwLock<String>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("identity", &self.identity.name)
            .field("transport_tag", &self.transport_tag())
            .finish()
    }
}

impl Sender {
    pub fn new(identity: Identity, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        let tag = identity
            .transport_tag
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(generate_client_tag);
        Self {
            identity,
            transport_tag: RwLock::new(tag),
            transport,
            retry,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn transport_tag(&self) -> String {
        self.transport_tag
            .read()
            .map(|t| t.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Hot-swap the client tag; later requests pick it up.
    pub fn set_transport_tag(&self, tag: impl Into<String>) {
        let mut guard = self
            .transport_tag
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *guard = tag.into();
    }

    /// Send without an external cancellation source.
    pub async fn send_detached(&self, destination: &str, message: &str) -> Delivery {
        self.send(destination, message, &CancellationToken::new())
            .await
    }

    async fn attempt(
        &self,
        destination: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, SendError> {
        let tag = self.transport_tag();
        let req = PostRequest {
            destination,
            auth_token: self.identity.credential.expose(),
            client_tag: &tag,
            body: message,
        };
        let resp = self.transport.post_message(req, cancel).await?;

        match Rejection::from_status(resp.status) {
            None => Ok(resp.body),
            Some(kind) => Err(SendError::Rejected {
                kind,
                status: resp.status,
                body: resp.body.chars().take(ERROR_BODY_MAX_CHARS).collect(),
            }),
        }
    }
}

#[async_trait]
impl MessageSender for Sender {
    fn name(&self) -> &str {
        &self.identity.name
    }

    async fn send(
        &self,
        destination: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Delivery {
        let name = &self.identity.name;
        if cancel.is_cancelled() {
            return Delivery::failed(
                FailureCategory::Cancelled,
                format!("[{name}] {}", SendError::Cancelled),
            );
        }

        let out = self
            .retry
            .execute_until(name, Some(cancel), |_| {
                self.attempt(destination, message, cancel)
            })
            .await;

        match out {
            Ok(payload) => Delivery::Sent { payload },
            Err(err) => Delivery::failed(classify(&err), format!("[{name}] {err}")),
        }
    }
}

const PLATFORMS: [&str; 4] = [
    "Windows NT 10.0; Win64; x64",
    "Macintosh; Intel Mac OS X 10_15_7",
    "X11; Linux x86_64",
    "Windows NT 11.0; Win64; x64",
];

/// Browser-like user agent for identities that did not configure one.
pub fn generate_client_tag() -> String {
    let mut rng = rand::thread_rng();
    let platform = PLATFORMS.choose(&mut rng).copied().unwrap_or(PLATFORMS[0]);
    let major: u32 = rng.gen_range(120..=131);
    format!(
        "Mozilla/5.0 ({platform}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major}.0.0.0 Safari/537.36"
    )
}
