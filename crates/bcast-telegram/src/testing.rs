//! Shared fakes for handler and run tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bcast_core::{
    config::Config,
    domain::{Identity, Target},
    engine::{BroadcastEngine, BroadcastOptions, Pacing},
    messaging::{ChatId, MessageId, MessageRef, MessagingPort},
    registry::Registry,
    retry::RetryPolicy,
    sender::{PostRequest, Sender, Transport, TransportError, TransportResponse},
    Result,
};
use tokio_util::sync::CancellationToken;

use crate::{router::AppState, runs::RunControl};

#[derive(Default)]
pub struct FakeMessenger {
    next_id: Mutex<i32>,
    pub sends: Mutex<Vec<String>>,
    pub edits: Mutex<Vec<(MessageRef, String)>>,
}

impl FakeMessenger {
    pub fn sent(&self) -> Vec<String> {
        self.sends.lock().unwrap().clone()
    }

    pub fn edited(&self) -> Vec<String> {
        self.edits
            .lock()
            .unwrap()
            .iter()
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn last_text(&self) -> String {
        self.sent().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.sends.lock().unwrap().push(html.to_string());
        let mut id = self.next_id.lock().unwrap();
        *id += 1;
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(*id),
        })
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.edits.lock().unwrap().push((msg, html.to_string()));
        Ok(())
    }
}

/// Answers 200 after `latency`, or 403 for tokens listed in `forbidden`.
#[derive(Default)]
pub struct FakeTransport {
    pub latency: Duration,
    pub forbidden: Vec<String>,
    pub posted: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn post_message(
        &self,
        req: PostRequest<'_>,
        cancel: &CancellationToken,
    ) -> std::result::Result<TransportResponse, TransportError> {
        self.posted.lock().unwrap().push((
            req.auth_token.to_string(),
            req.destination.to_string(),
            req.body.to_string(),
        ));
        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }
        if self.forbidden.iter().any(|t| t == req.auth_token) {
            return Ok(TransportResponse {
                status: 403,
                body: "Missing Access".to_string(),
            });
        }
        Ok(TransportResponse {
            status: 200,
            body: r#"{"id":"1"}"#.to_string(),
        })
    }
}

pub fn test_config(extra: &[(&str, &str)]) -> Config {
    let mut map: HashMap<String, String> = HashMap::from([
        ("TELEGRAM_BOT_TOKEN".to_string(), "123:abc".to_string()),
        ("TELEGRAM_ALLOWED_USERS".to_string(), "1".to_string()),
        ("PROGRESS_THROTTLE_MS".to_string(), "0".to_string()),
    ]);
    for (k, v) in extra {
        map.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(|k| map.get(k).cloned()).unwrap()
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub messenger: Arc<FakeMessenger>,
    pub transport: Arc<FakeTransport>,
}

/// `n` identities (`id0`..), tokens `tok0`.., one target `general -> chan-1`.
pub fn harness(n: usize, transport: FakeTransport, cfg: Config) -> Harness {
    let transport = Arc::new(transport);
    let messenger = Arc::new(FakeMessenger::default());
    let policy = RetryPolicy {
        max_attempts: 1,
        ..RetryPolicy::default()
    };

    let senders = (0..n)
        .map(|i| {
            Arc::new(Sender::new(
                Identity::new(format!("id{i}"), format!("tok{i}")),
                transport.clone(),
                policy,
            ))
        })
        .collect();
    let registry = Arc::new(Registry::default());
    registry
        .bulk_replace(senders, vec![Target::new("general", "chan-1")])
        .unwrap();

    let options = BroadcastOptions {
        concurrency: 2,
        pacing: Pacing::Fixed(Duration::ZERO),
    };
    let state = Arc::new(AppState {
        cfg: Arc::new(cfg),
        registry,
        transport: transport.clone(),
        engine: BroadcastEngine::default(),
        messenger: messenger.clone(),
        runs: Arc::new(RunControl::default()),
        options: Arc::new(Mutex::new(options)),
    });

    Harness {
        state,
        messenger,
        transport,
    }
}
