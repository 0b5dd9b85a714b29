use std::time::{SystemTime, UNIX_EPOCH};

use chatrelay_contracts::{ChatMessage, Role};
use rand::Rng;
use uuid::Uuid;

use crate::resolve::ResolvedModel;

pub const SYSTEM_INSTRUCTIONS_PREFIX: &str = "[System Instructions]: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemRolePolicy {
    Passthrough,
    RemapToUser { prefix: String },
}

impl SystemRolePolicy {
    pub fn remap_with_default_prefix() -> Self {
        Self::RemapToUser { prefix: SYSTEM_INSTRUCTIONS_PREFIX.to_string() }
    }

    pub fn apply(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let Self::RemapToUser { prefix } = self else {
            return messages;
        };
        messages
            .into_iter()
            .map(|message| match message.role {
                Role::System => {
                    ChatMessage::new(Role::User, format!("{prefix}{}", message.content))
                }
                _ => message,
            })
            .collect()
    }
}

/// Everything an upstream client needs for one call. Built per request and never reused.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub chat_id: String,
    pub message_id: String,
    pub display_model: String,
    pub resolved: ResolvedModel,
    pub messages: Vec<ChatMessage>,
    pub enable_thinking: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub auth_override: Option<String>,
}

/// `<unix millis>-<5 random digits>`.
pub fn new_chat_id() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(10_000..100_000);
    format!("{}-{suffix}", unix_millis())
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

pub fn unix_millis() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_millis()).unwrap_or(0)
}

pub fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
