//! Read-Status Tracker.
//!
//! One "last read message id" per (meeting, user). Two markers
//! coexist: the remotely persisted id (authoritative, slow) and a
//! session-start marker frozen at the first message snapshot, which
//! anchors the "new messages" divider for the rest of the session.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{debug, warn};

use shared::domain::{MeetingId, MessageId, ReadStatus, UserId};

use crate::{
    lock,
    store::{read_status_collection, Document, DocumentStore},
};

pub struct ReadStatusTracker {
    store: Arc<dyn DocumentStore>,
    state: Mutex<ReadState>,
}

#[derive(Default)]
struct ReadState {
    meeting_id: Option<MeetingId>,
    user_id: Option<UserId>,
    server_last_read: Option<MessageId>,
    server_loaded: bool,
    /// Frozen at the first message snapshot of the session.
    /// `Some(None)` means "entered an empty transcript".
    session_marker: Option<Option<MessageId>>,
    last_acked: Option<MessageId>,
}

impl ReadStatusTracker {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            state: Mutex::new(ReadState::default()),
        }
    }

    pub fn reset(&self, meeting_id: Option<MeetingId>, user_id: Option<UserId>) {
        let mut guard = lock(&self.state);
        *guard = ReadState {
            meeting_id,
            user_id,
            ..ReadState::default()
        };
    }

    pub fn apply_remote(&self, document: Option<Document>) {
        let mut guard = lock(&self.state);
        match document {
            Some(doc) => match serde_json::from_value::<ReadStatus>(doc.data) {
                Ok(status) => {
                    guard.server_last_read = status.last_read_message_id;
                    guard.server_loaded = true;
                }
                Err(err) => {
                    warn!("readstatus: malformed read-status document {}: {err}", doc.id)
                }
            },
            None => {
                guard.server_last_read = None;
                guard.server_loaded = true;
            }
        }
    }

    /// Freeze the session-start marker at the last message of the
    /// first snapshot. Later messages arrive below the divider.
    pub fn note_messages_loaded(&self, last_message_id: Option<&MessageId>) {
        let mut guard = lock(&self.state);
        if guard.session_marker.is_none() {
            debug!(
                "readstatus: freezing session marker at {:?}",
                last_message_id.map(MessageId::as_str)
            );
            guard.session_marker = Some(last_message_id.cloned());
        }
    }

    /// The message the "new messages" divider follows. Prefers the
    /// frozen session marker; falls back to the server value before
    /// the first snapshot lands.
    pub fn divider_anchor(&self) -> Option<MessageId> {
        let guard = lock(&self.state);
        match &guard.session_marker {
            Some(marker) => marker.clone(),
            None => guard.server_last_read.clone(),
        }
    }

    pub fn server_last_read(&self) -> Option<MessageId> {
        lock(&self.state).server_last_read.clone()
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.state).server_loaded
    }

    /// Idempotent acknowledgment. A failed write is absorbed; the
    /// live subscription corrects the server value on the next
    /// successful read.
    pub async fn mark_as_read(&self, message_id: MessageId) {
        let (meeting_id, user_id) = {
            let mut guard = lock(&self.state);
            if guard.last_acked.as_ref() == Some(&message_id) {
                return;
            }
            let (Some(meeting_id), Some(user_id)) =
                (guard.meeting_id.clone(), guard.user_id.clone())
            else {
                return;
            };
            guard.last_acked = Some(message_id.clone());
            (meeting_id, user_id)
        };

        let collection = read_status_collection(&meeting_id);
        if let Err(err) = self
            .store
            .set_document(
                &collection,
                user_id.as_str(),
                json!({ "lastReadMessageId": message_id }),
            )
            .await
        {
            debug!("readstatus: failed to persist read marker {message_id}: {err}");
        }
    }
}
