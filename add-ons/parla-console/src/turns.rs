//! What a voice turn says back.

use parla_core::{Message, MessageStatus};

/// The text to speak, or the failure to show instead of speaking it.
#[cfg_attr(not(feature = "native-audio"), allow(dead_code))]
pub fn spoken_reply(reply: Option<Message>) -> Result<String, String> {
    match reply {
        Some(message) if message.status == MessageStatus::Failed => Err(message.content),
        Some(message) => Ok(message.content),
        None => Err("the conversation was cleared".to_string()),
    }
}
