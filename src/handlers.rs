use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::api::{SendMessage, Update, UpdatePayload};

/// State shared by the webhook handlers
pub struct AppState {
    bot_token: String,
    reply_text: String,
}

impl AppState {
    pub fn new(bot_token: &str, reply_text: &str) -> Self {
        Self {
            bot_token: bot_token.to_string(),
            reply_text: reply_text.to_string(),
        }
    }

    fn token_matches(&self, candidate: &str) -> bool {
        self.bot_token.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false)
}

/// Build the reply for an update, if it deserves one.
pub fn reply_for(update: &Update, text: &str) -> Option<SendMessage> {
    match update.payload() {
        UpdatePayload::Message(message) => Some(SendMessage::webhook_reply(message, text)),
        UpdatePayload::InlineQuery(_) | UpdatePayload::Empty => None,
    }
}

pub async fn root() -> &'static str {
    "hi"
}

/// Webhook delivery endpoint.
///
/// Replies in-band with a `sendMessage` body when the update carries a
/// message, otherwise acknowledges with 204.
pub async fn on_update(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // The body is only looked at once the path token is known to be ours.
    if !state.token_matches(&token) {
        warn!("Rejected webhook delivery with unknown path token");
        return StatusCode::NOT_FOUND.into_response();
    }

    if !is_json(&headers) {
        warn!("Webhook delivery without JSON content type");
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("Failed to decode update: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match reply_for(&update, &state.reply_text) {
        Some(reply) => {
            info!(
                "Update {}: replying to message {:?} in chat {}",
                update.update_id, reply.reply_to_message_id, reply.chat_id
            );
            (StatusCode::OK, Json(reply)).into_response()
        }
        None => {
            if let UpdatePayload::InlineQuery(query) = update.payload() {
                debug!(
                    "Update {}: inline query {} left unanswered",
                    update.update_id, query.id
                );
            } else {
                debug!("Update {} carries no message", update.update_id);
            }
            StatusCode::NO_CONTENT.into_response()
        }
    }
}
