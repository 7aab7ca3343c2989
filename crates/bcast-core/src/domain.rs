use std::fmt;

use serde::Serialize;

/// Opaque credential. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// One credentialed account messages are sent as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub credential: Secret,
    /// Client-identifying header value (user agent). `None` means "generate one".
    pub transport_tag: Option<String>,
}

impl Identity {
    pub fn new(name: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credential: Secret::new(credential),
            transport_tag: None,
        }
    }

    pub fn with_transport_tag(mut self, tag: impl Into<String>) -> Self {
        self.transport_tag = Some(tag.into());
        self
    }
}

/// A named remote chat.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    pub name: String,
    pub destination: String,
}

impl Target {
    pub fn new(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
        }
    }
}

/// Coarse failure buckets used for reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Forbidden,
    RateLimited,
    ServerError,
    Cancelled,
    Other,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Forbidden => "forbidden",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::ServerError => "server_error",
            FailureCategory::Cancelled => "cancelled",
            FailureCategory::Other => "other",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single `send` produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Delivery {
    Sent {
        payload: String,
    },
    Failed {
        category: FailureCategory,
        message: String,
    },
}

impl Delivery {
    pub fn failed(category: FailureCategory, message: impl Into<String>) -> Self {
        Delivery::Failed {
            category,
            message: message.into(),
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent { .. })
    }

    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            Delivery::Sent { .. } => None,
            Delivery::Failed { category, .. } => Some(*category),
        }
    }
}

/// Outcome of one (identity, run) pair. Created once, never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SendResult {
    pub identity: String,
    pub ordinal: usize,
    pub message: String,
    #[serde(flatten)]
    pub delivery: Delivery,
}

impl SendResult {
    pub fn cancelled(identity: impl Into<String>, ordinal: usize) -> Self {
        let identity = identity.into();
        let text = format!("[{identity}] skipped: broadcast stopped");
        Self {
            identity,
            ordinal,
            message: String::new(),
            delivery: Delivery::failed(FailureCategory::Cancelled, text),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.delivery.is_sent()
    }

    pub fn category(&self) -> Option<FailureCategory> {
        self.delivery.category()
    }
}

/// Per-run identifier owned by the control surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let id = Identity::new("alice", "super-secret-token");
        let dbg = format!("{id:?}");
        assert!(!dbg.contains("super-secret-token"));
        assert!(dbg.contains("alice"));
    }

    #[test]
    fn cancelled_result_carries_category() {
        let r = SendResult::cancelled("bob", 4);
        assert_eq!(r.category(), Some(FailureCategory::Cancelled));
        assert!(!r.is_sent());
        assert_eq!(r.ordinal, 4);
        match r.delivery {
            Delivery::Failed { message, .. } => {
                assert_eq!(message, "[bob] skipped: broadcast stopped")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn send_result_serializes_flat() {
        let r = SendResult {
            identity: "alice".into(),
            ordinal: 0,
            message: "hi".into(),
            delivery: Delivery::failed(FailureCategory::Forbidden, "[alice] HTTP 403"),
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(v["category"], "forbidden");
        assert_eq!(v["identity"], "alice");
    }
}
