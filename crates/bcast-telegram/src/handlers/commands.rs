use std::{sync::Arc, time::Duration};

use bcast_core::{
    accounts::reload_registry,
    config::parse_range_ms,
    engine::{BroadcastOptions, FixedMessage, MessageProducer, Pacing, SlotRotation},
    messaging::{escape_html, ChatId},
    Error,
};

use crate::{
    router::AppState,
    runs::{start_broadcast, RunStatus},
};

const TELEGRAM_SAFE_LIMIT: usize = 4000;
const PREVIEW_CHARS: usize = 60;

const HELP: &str = "📣 <b>Broadcaster</b>\n\n\
<b>📋 Commands:</b>\n\
/accounts - List loaded identities\n\
/targets - List named targets\n\
/reload - Re-read the account file\n\
/broadcast &lt;target&gt; &lt;message&gt; - Send from every identity\n\
/slots &lt;target&gt; &lt;base&gt; | w1, w2, ... - Rotate words by identity\n\
/stop - Stop the running broadcast\n\
/status - Current or last run\n\
/useragent &lt;identity&gt; &lt;tag&gt; - Swap an identity's user agent\n\
/settings [concurrency N] [delay MS | random MIN-MAX] - Show or change pacing";

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

/// `<target> <message...>`
fn split_target(arg: &str) -> Option<(&str, &str)> {
    let mut parts = arg.trim().splitn(2, char::is_whitespace);
    let target = parts.next().filter(|s| !s.is_empty())?;
    let rest = parts.next().map(str::trim).filter(|s| !s.is_empty())?;
    Some((target, rest))
}

/// `<target> <base> | w1, w2, ...`; the base may be empty.
fn parse_slots(arg: &str) -> Option<(String, String, Vec<String>)> {
    let (head, words) = arg.split_once('|')?;
    let mut parts = head.trim().splitn(2, char::is_whitespace);
    let target = parts.next().filter(|s| !s.is_empty())?.to_string();
    let base = parts.next().unwrap_or("").trim().to_string();
    let words = words.split(',').map(|w| w.trim().to_string()).collect();
    Some((target, base, words))
}

/// Apply `concurrency N`, `delay MS`, `random MIN-MAX` on top of `current`.
fn apply_settings(current: BroadcastOptions, arg: &str) -> Result<BroadcastOptions, String> {
    let mut concurrency = current.concurrency;
    let mut delay = None;
    let mut random = None;

    let mut tokens = arg.split_whitespace();
    while let Some(key) = tokens.next() {
        let Some(value) = tokens.next() else {
            return Err(format!("missing value for {key}"));
        };
        match key.to_lowercase().as_str() {
            "concurrency" => {
                concurrency = value
                    .parse()
                    .map_err(|_| format!("concurrency must be a number, got {value}"))?;
            }
            "delay" => {
                let ms: u64 = value
                    .parse()
                    .map_err(|_| format!("delay must be milliseconds, got {value}"))?;
                delay = Some(Duration::from_millis(ms));
            }
            "random" => {
                random = Some(
                    parse_range_ms(value)
                        .ok_or_else(|| format!("random must look like MIN-MAX, got {value}"))?,
                );
            }
            other => return Err(format!("unknown setting: {other}")),
        }
    }

    // Keep the current pacing when only concurrency changed.
    if delay.is_none() && random.is_none() {
        let next = BroadcastOptions {
            concurrency,
            pacing: current.pacing,
        };
        next.validate().map_err(|e| e.to_string())?;
        return Ok(next);
    }
    BroadcastOptions::from_parts(concurrency, delay, random).map_err(|e| e.to_string())
}

fn format_settings(opts: &BroadcastOptions) -> String {
    let pacing = match opts.pacing {
        Pacing::Fixed(d) => format!("fixed {}ms", d.as_millis()),
        Pacing::Random { min, max } => format!("random {}-{}ms", min.as_millis(), max.as_millis()),
    };
    format!(
        "⚙️ <b>Settings</b>\n\nConcurrency: {}\nDelay: {pacing}",
        opts.concurrency
    )
}

fn format_status(status: &RunStatus) -> String {
    match status {
        RunStatus::Running {
            id,
            target,
            total,
            processed,
            elapsed,
            stopping,
        } => {
            let state = if *stopping { "Stopping" } else { "Running" };
            format!(
                "🔄 <b>Broadcast {id}</b>: {state}\nTarget: <code>{}</code>\nProgress: {processed}/{total}\nElapsed: {}s",
                escape_html(target),
                elapsed.as_secs()
            )
        }
        RunStatus::Idle { last: None } => "⚪ Idle. No broadcast has run yet.".to_string(),
        RunStatus::Idle { last: Some(last) } => format!(
            "⚪ Idle\n\nLast: broadcast {} to <code>{}</code> ({:?})\n✅ Sent: {}/{}\n❌ Failed: {}",
            last.id,
            escape_html(&last.target),
            last.state,
            last.sent,
            last.total,
            last.failed
        ),
    }
}

fn preview(s: &str) -> String {
    let mut out: String = s.chars().take(PREVIEW_CHARS).collect();
    if s.chars().count() > PREVIEW_CHARS {
        out.push('…');
    }
    out
}

/// Split on line boundaries so no chunk exceeds `limit` bytes.
fn split_lines(html: &str, limit: usize) -> Vec<String> {
    if html.len() <= limit {
        return vec![html.to_string()];
    }
    let mut out = Vec::new();
    let mut chunk = String::new();
    for line in html.lines() {
        if !chunk.is_empty() && chunk.len() + line.len() + 1 > limit {
            out.push(std::mem::take(&mut chunk));
        }
        if !chunk.is_empty() {
            chunk.push('\n');
        }
        chunk.push_str(line);
    }
    if !chunk.is_empty() {
        out.push(chunk);
    }
    out
}

async fn send_html_split(state: &AppState, chat_id: ChatId, html: &str) {
    for chunk in split_lines(html, TELEGRAM_SAFE_LIMIT) {
        if let Err(e) = state.messenger.send_html(chat_id, &chunk).await {
            tracing::warn!(error = %e, "reply failed");
        }
    }
}

async fn launch(
    state: &Arc<AppState>,
    chat_id: ChatId,
    target: &str,
    producer: Arc<dyn MessageProducer>,
    title: String,
) {
    if let Err(e) = start_broadcast(state.clone(), chat_id, target, producer, title).await {
        send_html_split(state, chat_id, &launch_error_text(&e)).await;
    }
}

/// Bad requests get a plain "cannot start" line; anything else is reported as a failure.
fn launch_error_text(err: &anyhow::Error) -> String {
    let detail = escape_html(&err.to_string());
    match err.downcast_ref::<Error>() {
        Some(core) if core.is_precondition() => format!("⚠️ Cannot start broadcast: {detail}"),
        _ => format!("❌ Broadcast failed to start: {detail}"),
    }
}

pub async fn handle_command(state: &Arc<AppState>, chat_id: ChatId, text: &str) {
    let (cmd, arg) = parse_command(text);
    tracing::debug!(cmd = %cmd, "command");

    match cmd.as_str() {
        "start" | "help" => send_html_split(state, chat_id, HELP).await,

        "accounts" => {
            let senders = state.registry.list_identities();
            if senders.is_empty() {
                send_html_split(state, chat_id, "No identities loaded.").await;
                return;
            }
            let mut lines = vec![format!("👥 <b>Identities ({})</b>\n", senders.len())];
            for (i, s) in senders.iter().enumerate() {
                lines.push(format!(
                    "{}. <code>{}</code> - {}",
                    i + 1,
                    escape_html(&s.identity().name),
                    escape_html(&preview(&s.transport_tag()))
                ));
            }
            send_html_split(state, chat_id, &lines.join("\n")).await;
        }

        "targets" => {
            let targets = state.registry.list_targets();
            if targets.is_empty() {
                send_html_split(state, chat_id, "No targets configured.").await;
                return;
            }
            let mut lines = vec!["🎯 <b>Targets</b>\n".to_string()];
            for t in targets {
                lines.push(format!(
                    "• <code>{}</code> → {}",
                    escape_html(&t.name),
                    escape_html(&t.destination)
                ));
            }
            send_html_split(state, chat_id, &lines.join("\n")).await;
        }

        "reload" => {
            let out = reload_registry(
                &state.registry,
                &state.cfg.accounts_file,
                state.transport.clone(),
                state.cfg.retry,
            );
            let msg = match out {
                Ok(n) => format!(
                    "🔄 Reloaded {n} identit{}, {} target(s)",
                    if n == 1 { "y" } else { "ies" },
                    state.registry.list_targets().len()
                ),
                Err(e) => format!("❌ Reload failed: {}", escape_html(&e.to_string())),
            };
            send_html_split(state, chat_id, &msg).await;
        }

        "broadcast" => {
            let Some((target, message)) = split_target(&arg) else {
                send_html_split(state, chat_id, "Usage: /broadcast &lt;target&gt; &lt;message&gt;").await;
                return;
            };
            let producer: Arc<dyn MessageProducer> = Arc::new(FixedMessage(message.to_string()));
            launch(state, chat_id, target, producer, preview(message)).await;
        }

        "slots" => {
            let Some((target, base, words)) = parse_slots(&arg) else {
                send_html_split(
                    state,
                    chat_id,
                    "Usage: /slots &lt;target&gt; &lt;base&gt; | w1, w2, ...",
                )
                .await;
                return;
            };
            match SlotRotation::new(base.clone(), words) {
                Ok(rotation) => {
                    let title = format!("{} | {}", preview(&base), rotation.slots().join(", "));
                    launch(state, chat_id, &target, Arc::new(rotation), preview(&title)).await;
                }
                Err(e) => {
                    send_html_split(state, chat_id, &format!("❌ {}", escape_html(&e.to_string())))
                        .await
                }
            }
        }

        "stop" => {
            let msg = match state.runs.stop() {
                Some(id) => format!("⏹ Stopping broadcast {id}…"),
                None => "No broadcast running.".to_string(),
            };
            send_html_split(state, chat_id, &msg).await;
        }

        "status" => send_html_split(state, chat_id, &format_status(&state.runs.status())).await,

        "useragent" => {
            let Some((name, tag)) = split_target(&arg) else {
                send_html_split(state, chat_id, "Usage: /useragent &lt;identity&gt; &lt;tag&gt;").await;
                return;
            };
            let msg = match state.registry.set_transport_tag(name, tag) {
                Ok(()) => format!("✅ User agent for <code>{}</code> updated", escape_html(name)),
                Err(e) => format!("❌ {}", escape_html(&e.to_string())),
            };
            send_html_split(state, chat_id, &msg).await;
        }

        "settings" => {
            if arg.is_empty() {
                send_html_split(state, chat_id, &format_settings(&state.options())).await;
                return;
            }
            let msg = match apply_settings(state.options(), &arg) {
                Ok(next) => {
                    state.set_options(next);
                    tracing::info!(options = ?next, "broadcast settings changed");
                    format_settings(&next)
                }
                Err(e) => format!("❌ {}", escape_html(&e)),
            };
            send_html_split(state, chat_id, &msg).await;
        }

        _ => {
            let msg = format!("Unknown command: /{}", escape_html(&cmd));
            send_html_split(state, chat_id, &msg).await;
        }
    }
}
