//! Chat Session State: the ordered message log and the derived "is generating" flag.
//!
//! At most one message is pending at a time. [`ChatSession::begin_turn`] creates
//! it together with a [`PendingTurn`], the only handle allowed to mutate it.

use crate::error::{AssistantError, AssistantResult};
use crate::generation::InlineImage;
use crate::message::{Message, MessageResult, MessageStatus, Role};
use crate::store::{Collection, MediaStore};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

const INTERRUPTED: &str = "The response was interrupted before it finished.";

struct Inner {
    log: Mutex<Vec<Message>>,
    store: Option<MediaStore>,
    revision: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ChatSession {
    pub fn new(store: Option<MediaStore>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                log: Mutex::new(Vec::new()),
                store,
                revision,
            }),
        }
    }

    /// Load the persisted log. A message left pending by an earlier run can
    /// never finish, so it is marked failed.
    pub fn restore(store: MediaStore) -> AssistantResult<Self> {
        let mut messages: Vec<Message> = store.get_all(Collection::Messages)?;
        for message in messages.iter_mut().filter(|m| m.is_pending()) {
            message.status = MessageStatus::Failed;
            message.content = INTERRUPTED.to_string();
            store.put(Collection::Messages, &*message)?;
        }
        debug!(target: "parla::store", count = messages.len(), "chat log restored");
        let session = Self::new(Some(store));
        *session.lock() = messages;
        Ok(session)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        self.inner.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|r| *r += 1);
    }

    fn persist(&self, message: &Message) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.put(Collection::Messages, message) {
                warn!(target: "parla::store", id = %message.id, "failed to persist message: {}", e);
            }
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().clone()
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.lock().iter().find(|m| m.id == id).cloned()
    }

    pub fn is_generating(&self) -> bool {
        self.lock().iter().any(Message::is_pending)
    }

    /// Fires on every change to the log.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Append `user` (if any) and a pending assistant message. Rejected with
    /// `Busy` while another turn is in flight.
    pub fn begin_turn(&self, user: Option<Message>) -> AssistantResult<PendingTurn> {
        let mut log = self.lock();
        if log.iter().any(Message::is_pending) {
            return Err(AssistantError::Busy);
        }
        if let Some(mut user) = user {
            order_after_last(&log, &mut user);
            self.persist(&user);
            log.push(user);
        }
        Ok(self.push_pending(log))
    }

    /// Replace the text of an earlier user message, drop everything after it
    /// and start a new turn from there.
    pub fn begin_edited_turn(&self, id: &str, text: &str) -> AssistantResult<(Message, PendingTurn)> {
        let mut log = self.lock();
        if log.iter().any(Message::is_pending) {
            return Err(AssistantError::Busy);
        }
        let idx = log
            .iter()
            .position(|m| m.id == id && m.role == Role::User)
            .ok_or_else(|| AssistantError::NotFound(id.to_string()))?;

        for dropped in log.drain(idx + 1..) {
            if let Some(store) = &self.inner.store {
                if let Err(e) = store.delete(Collection::Messages, &dropped.store_key()) {
                    warn!(target: "parla::store", id = %dropped.id, "failed to delete message: {}", e);
                }
            }
        }
        let edited = {
            let message = &mut log[idx];
            message.content = text.to_string();
            message.edited = true;
            message.clone()
        };
        self.persist(&edited);
        Ok((edited, self.push_pending(log)))
    }

    fn push_pending(&self, mut log: MutexGuard<'_, Vec<Message>>) -> PendingTurn {
        let mut pending = Message::pending_assistant();
        order_after_last(&log, &mut pending);
        let id = pending.id.clone();
        log.push(pending);
        drop(log);
        self.bump();
        PendingTurn {
            session: self.clone(),
            id,
            showing_status: false,
            finalized: false,
        }
    }

    /// Remove every message, including an in-flight one.
    pub fn clear(&self) -> AssistantResult<()> {
        self.lock().clear();
        if let Some(store) = &self.inner.store {
            store.clear(Collection::Messages)?;
        }
        self.bump();
        Ok(())
    }

    /// Finished messages before `id`, oldest first, at most `limit`.
    pub fn history_before(&self, id: &str, limit: usize) -> Vec<Message> {
        let log = self.lock();
        let end = log.iter().position(|m| m.id == id).unwrap_or(log.len());
        let finished: Vec<&Message> = log[..end]
            .iter()
            .filter(|m| m.status == MessageStatus::Complete)
            .collect();
        let skip = finished.len().saturating_sub(limit);
        finished.into_iter().skip(skip).cloned().collect()
    }

    /// The image produced by the assistant turn immediately before `id`, if
    /// that turn produced one.
    pub fn previous_assistant_image(&self, id: &str) -> Option<InlineImage> {
        let log = self.lock();
        let end = log.iter().position(|m| m.id == id).unwrap_or(log.len());
        let last = log[..end].iter().rev().find(|m| m.role == Role::Assistant)?;
        match (&last.status, &last.result) {
            (MessageStatus::Complete, Some(MessageResult::GeneratedImage { mime, data, .. })) => {
                Some(InlineImage {
                    mime: mime.clone(),
                    data: data.clone(),
                })
            }
            _ => None,
        }
    }

    fn update<F: FnOnce(&mut Message)>(&self, id: &str, f: F) -> Option<Message> {
        let updated = {
            let mut log = self.lock();
            let message = log.iter_mut().find(|m| m.id == id)?;
            f(message);
            message.clone()
        };
        self.bump();
        Some(updated)
    }
}

/// Store keys start with the creation millisecond; keep them strictly
/// increasing so a reload preserves log order.
fn order_after_last(log: &[Message], message: &mut Message) {
    let Some(last) = log.last() else { return };
    let last_ms = last.created_at.timestamp_millis();
    if message.created_at.timestamp_millis() <= last_ms {
        if let Some(next) = DateTime::<Utc>::from_timestamp_millis(last_ms + 1) {
            message.created_at = next;
        }
    }
}

/// Exclusive handle on the in-flight assistant message.
///
/// Finalizes exactly once. Dropping an unfinalized turn marks it failed so a
/// panic or cancelled task never leaves the session stuck generating.
pub struct PendingTurn {
    session: ChatSession,
    id: String,
    showing_status: bool,
    finalized: bool,
}

impl PendingTurn {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    /// Progress text, replaced by the first streamed content.
    pub fn set_status_text(&mut self, text: &str) {
        self.showing_status = true;
        self.session.update(&self.id, |m| m.content = text.to_string());
    }

    pub fn append(&mut self, text: &str) {
        let clear = std::mem::take(&mut self.showing_status);
        self.session.update(&self.id, |m| {
            if clear {
                m.content.clear();
            }
            m.content.push_str(text);
        });
    }

    pub fn set_content(&mut self, text: &str) {
        self.showing_status = false;
        self.session.update(&self.id, |m| m.content = text.to_string());
    }

    /// Current text; empty while only status text is shown.
    pub fn content(&self) -> String {
        if self.showing_status {
            return String::new();
        }
        self.session
            .message(&self.id)
            .map(|m| m.content)
            .unwrap_or_default()
    }

    pub fn set_result(&mut self, result: MessageResult) {
        self.session.update(&self.id, |m| m.result = Some(result));
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn complete(&mut self) -> Option<Message> {
        self.finalize(MessageStatus::Complete, None)
    }

    pub fn fail(&mut self, reason: &str) -> Option<Message> {
        self.finalize(MessageStatus::Failed, Some(reason))
    }

    fn finalize(&mut self, status: MessageStatus, reason: Option<&str>) -> Option<Message> {
        if self.finalized {
            return None;
        }
        self.finalized = true;
        let message = self.session.update(&self.id, |m| {
            m.status = status;
            if let Some(reason) = reason {
                m.content = reason.to_string();
            }
        })?;
        self.session.persist(&message);
        debug!(target: "parla::router", id = %self.id, status = ?status, "turn finalized");
        Some(message)
    }
}

impl Drop for PendingTurn {
    fn drop(&mut self) {
        if !self.finalized {
            self.fail(INTERRUPTED);
        }
    }
}
