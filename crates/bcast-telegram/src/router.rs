use std::sync::{Arc, Mutex};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use bcast_core::{
    config::Config,
    engine::{BroadcastEngine, BroadcastOptions},
    messaging::MessagingPort,
    registry::Registry,
    sender::Transport,
};

use crate::handlers;
use crate::runs::RunControl;
use crate::TelegramMessenger;

pub struct AppState {
    pub cfg: Arc<Config>,
    pub registry: Arc<Registry>,
    pub transport: Arc<dyn Transport>,
    pub engine: BroadcastEngine,
    pub messenger: Arc<dyn MessagingPort>,
    pub runs: Arc<RunControl>,
    pub options: Arc<Mutex<BroadcastOptions>>,
}

impl AppState {
    /// Options the next run will use.
    pub fn options(&self) -> BroadcastOptions {
        *self.options.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_options(&self, next: BroadcastOptions) {
        *self.options.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

pub async fn run_polling(
    cfg: Arc<Config>,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => tracing::info!(bot = %me.username(), "control bot started"),
        Err(e) => tracing::warn!(error = %e, "get_me failed"),
    }
    tracing::info!(
        operators = cfg.telegram_allowed_users.len(),
        identities = registry.snapshot().senders().len(),
        "ready"
    );

    let messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let state = Arc::new(AppState {
        options: Arc::new(Mutex::new(cfg.broadcast)),
        cfg,
        registry,
        transport,
        engine: BroadcastEngine::default(),
        messenger,
        runs: Arc::new(RunControl::default()),
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}
