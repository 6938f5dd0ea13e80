//! Message Synchronizer.
//!
//! Sends are optimistic: the message is appended locally in `Sending`
//! state and persisted asynchronously carrying a client-generated
//! correlation token. A pending message leaves the pending set exactly
//! when its token shows up in the remote stream; that observation is
//! the only convergence mechanism.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use shared::{
    domain::{MeetingId, Message, MessageId, MessageKind, MessageStatus, UserId},
    ids,
};

use crate::{
    blocklist::BlockListManager,
    lock,
    store::{messages_collection, Document, DocumentStore},
    ClientError, ClientEvent,
};

pub struct MessageSynchronizer {
    store: Arc<dyn DocumentStore>,
    blocklist: Arc<BlockListManager>,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<MessageState>,
}

#[derive(Default)]
struct MessageState {
    meeting_id: Option<MeetingId>,
    remote: Vec<Message>,
    /// Locally pending messages, status `Sending` or `Error`.
    pending: Vec<Message>,
}

impl MessageSynchronizer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blocklist: Arc<BlockListManager>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            store,
            blocklist,
            events,
            state: Mutex::new(MessageState::default()),
        }
    }

    /// Rebind to a different meeting. Pending messages survive a
    /// placeholder-to-real switch: their writes were already
    /// redirected to the real meeting, whose snapshots will confirm
    /// them. Any other switch drops them with the rest of the state.
    pub fn reset(&self, meeting_id: Option<MeetingId>) {
        {
            let mut guard = lock(&self.state);
            let was_placeholder = guard
                .meeting_id
                .as_ref()
                .is_some_and(MeetingId::is_placeholder);
            if !was_placeholder {
                guard.pending.clear();
            }
            guard.remote.clear();
            guard.meeting_id = meeting_id;
        }
        self.emit_current();
    }

    /// Merge a remote snapshot: remote messages are authoritative,
    /// still-pending local messages ride on top until their
    /// correlation token is observed.
    pub fn apply_snapshot(&self, documents: Vec<Document>) -> Vec<Message> {
        let mut remote = Vec::with_capacity(documents.len());
        for doc in documents {
            match Message::from_document(MessageId::new(doc.id.clone()), doc.data) {
                Ok(message) => remote.push(message),
                Err(err) => warn!("chat: skipping malformed message document {}: {err}", doc.id),
            }
        }

        {
            let mut guard = lock(&self.state);
            let confirmed: HashSet<String> = remote
                .iter()
                .filter_map(|m| m.client_msg_id.clone())
                .collect();
            let before = guard.pending.len();
            guard.pending.retain(|p| {
                p.client_msg_id
                    .as_ref()
                    .map_or(true, |token| !confirmed.contains(token))
            });
            if guard.pending.len() != before {
                debug!(
                    "chat: {} pending message(s) confirmed by snapshot",
                    before - guard.pending.len()
                );
            }
            guard.remote = remote;
        }
        self.emit_current()
    }

    /// Optimistic send against `target` (already redirected away from
    /// a placeholder by the caller).
    pub async fn send(
        &self,
        target: MeetingId,
        sender_id: UserId,
        sender_name: String,
        content: String,
    ) -> Result<(), ClientError> {
        let token = ids::client_msg_id();
        let message = Message {
            id: MessageId::new(token.clone()),
            sender_id,
            sender_name: Some(sender_name),
            content,
            timestamp: Some(Utc::now()),
            client_msg_id: Some(token.clone()),
            kind: MessageKind::User,
            status: MessageStatus::Sending,
        };

        let body = serde_json::to_value(&message).map_err(shared::error::StoreError::from)?;
        {
            let mut guard = lock(&self.state);
            guard.pending.push(message);
        }
        self.emit_current();

        match self
            .store
            .add_document(&messages_collection(&target), body)
            .await
        {
            Ok(remote_id) => {
                debug!("chat: message {token} persisted as {remote_id}");
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                {
                    let mut guard = lock(&self.state);
                    for pending in &mut guard.pending {
                        if pending.client_msg_id.as_deref() == Some(token.as_str()) {
                            pending.status = MessageStatus::Error {
                                reason: reason.clone(),
                            };
                        }
                    }
                }
                warn!("chat: failed to persist message {token}: {reason}");
                let _ = self.events.send(ClientEvent::MessageSendFailed {
                    client_msg_id: token,
                    reason,
                });
                self.emit_current();
                Err(err.into())
            }
        }
    }

    /// Fire-and-forget system announcement (joins, leaves). Never
    /// optimistic; failures only log.
    pub async fn post_system(&self, target: &MeetingId, content: String) {
        let message = Message {
            id: MessageId::default(),
            sender_id: UserId::new("system"),
            sender_name: None,
            content,
            timestamp: Some(Utc::now()),
            client_msg_id: None,
            kind: MessageKind::System,
            status: MessageStatus::Sent,
        };
        let Ok(body) = serde_json::to_value(&message) else {
            return;
        };
        if let Err(err) = self
            .store
            .add_document(&messages_collection(target), body)
            .await
        {
            debug!("chat: failed to post system message: {err}");
        }
    }

    /// The merged, displayed transcript: remote plus still-pending,
    /// timestamp order, blocked senders filtered out (display only;
    /// the underlying messages are untouched). System messages are
    /// always shown.
    pub fn messages(&self) -> Vec<Message> {
        let guard = lock(&self.state);
        self.merged_visible(&guard)
    }

    /// Re-derive and broadcast the visible transcript (used after
    /// block-list changes as well as snapshots).
    pub fn emit_current(&self) -> Vec<Message> {
        let visible = {
            let guard = lock(&self.state);
            self.merged_visible(&guard)
        };
        let _ = self
            .events
            .send(ClientEvent::MessagesUpdated(visible.clone()));
        visible
    }

    fn merged_visible(&self, state: &MessageState) -> Vec<Message> {
        let mut merged: Vec<Message> = state
            .remote
            .iter()
            .chain(state.pending.iter())
            .filter(|m| {
                m.kind == MessageKind::System || !self.blocklist.is_blocked(m.sender_id.as_str())
            })
            .cloned()
            .collect();
        merged.sort_by_key(Message::sort_key);
        merged
    }
}
