//! Telegram update handlers.
//!
//! Only operators listed in `TELEGRAM_ALLOWED_USERS` get through; everything
//! they send is treated as a command.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use crate::router::AppState;

mod commands;

pub fn is_authorized(user_id: Option<i64>, allowed_users: &[i64]) -> bool {
    let Some(user_id) = user_id else {
        return false;
    };
    allowed_users.contains(&user_id)
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let user_id = msg.from().map(|u| u.id.0 as i64);

    if !is_authorized(user_id, &state.cfg.telegram_allowed_users) {
        tracing::warn!(user = ?user_id, "unauthorized message");
        let _ = bot
            .send_message(
                msg.chat.id,
                "Unauthorized. Contact the bot owner for access.",
            )
            .await;
        return Ok(());
    }

    let Some(text) = msg.text() else {
        return Ok(());
    };
    if !text.starts_with('/') {
        let _ = bot.send_message(msg.chat.id, "Send /help for commands.").await;
        return Ok(());
    }

    commands::handle_command(&state, bcast_core::messaging::ChatId(msg.chat.id.0), text).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_requires_listed_user() {
        assert!(is_authorized(Some(5), &[1, 5]));
        assert!(!is_authorized(Some(6), &[1, 5]));
        assert!(!is_authorized(None, &[1]));
        assert!(!is_authorized(Some(1), &[]));
    }
}
