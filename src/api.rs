use serde::{Deserialize, Serialize};

/// Method marker that turns a webhook response body into an outbound call.
pub const SEND_MESSAGE: &str = "sendMessage";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub longitude: f32,
    pub latitude: f32,
}

/// Telegram user or bot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Conversation place: "private", "group", "supergroup" or "channel"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub chat_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

/// Special entity inside message text (mention, hashtag, bot_command, url...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Offset in UTF-16 code units
    pub offset: u32,
    /// Length in UTF-16 code units
    pub length: u32,
    /// Only set for "text_link"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    /// Empty for messages sent to channels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    /// Unix time the message was sent
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message: Option<Box<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineQuery {
    pub id: String,
    pub from: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default)]
    pub query: String,
    /// Offset of the results to be returned, controlled by the bot
    #[serde(default)]
    pub offset: String,
}

/// Incoming notification delivered to the webhook.
///
/// At most one payload field is populated per update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_query: Option<InlineQuery>,
}

/// Borrowed view of whichever payload an [`Update`] carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdatePayload<'a> {
    Message(&'a Message),
    InlineQuery(&'a InlineQuery),
    Empty,
}

impl Update {
    pub fn payload(&self) -> UpdatePayload<'_> {
        match (&self.message, &self.inline_query) {
            (Some(message), _) => UpdatePayload::Message(message),
            (None, Some(query)) => UpdatePayload::InlineQuery(query),
            (None, None) => UpdatePayload::Empty,
        }
    }
}

/// Outbound text message. When returned as a webhook response body the
/// `method` field must be set to [`SEND_MESSAGE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Chat id or `@channelusername`
    pub chat_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_web_page_preview: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_notification: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<String>,
}

impl SendMessage {
    /// Reply to `message` in its own chat, shaped as a webhook response.
    pub fn webhook_reply(message: &Message, text: impl Into<String>) -> Self {
        Self {
            method: Some(SEND_MESSAGE.to_string()),
            chat_id: message.chat.id.to_string(),
            text: text.into(),
            parse_mode: None,
            disable_web_page_preview: None,
            disable_notification: None,
            reply_to_message_id: Some(message.message_id),
            reply_markup: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetWebhookRequest {
    pub url: String,
}

/// Acknowledgement of `setWebhook`. Every field is absent on some outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetWebhookResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub result: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub description: String,
}
