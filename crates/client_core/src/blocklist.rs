//! Block List Manager.
//!
//! The user's block list is global across meetings and lives on their
//! profile document. Local state is a cache: every profile snapshot
//! replaces it wholesale, and optimistic edits only smooth the gap
//! until the next snapshot.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use shared::{
    domain::{UserId, UserRecord},
    ids,
};

use crate::{
    lock,
    store::{ArrayOp, Document, DocumentStore, FIELD_BLOCKED_USERS, USERS_COLLECTION},
    ClientEvent,
};

pub struct BlockListManager {
    store: Arc<dyn DocumentStore>,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<BlockState>,
}

#[derive(Default)]
struct BlockState {
    user_id: Option<UserId>,
    /// Normalized ids.
    blocked: BTreeSet<String>,
    /// Entries exactly as last seen remotely, stringified. Kept so
    /// unblock can remove historically mis-cased forms.
    remote_raw: Vec<String>,
}

impl BlockListManager {
    pub fn new(store: Arc<dyn DocumentStore>, events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            store,
            events,
            state: Mutex::new(BlockState::default()),
        }
    }

    pub fn reset(&self, user_id: Option<UserId>) {
        let mut guard = lock(&self.state);
        guard.user_id = user_id;
        guard.blocked.clear();
        guard.remote_raw.clear();
    }

    /// Replace local state from a profile document snapshot. The
    /// remote document is authoritative; optimistic edits not present
    /// in it are discarded here.
    pub fn apply_snapshot(&self, document: Option<Document>) {
        let record = match document {
            Some(doc) => match serde_json::from_value::<UserRecord>(doc.data) {
                Ok(record) => record,
                Err(err) => {
                    warn!("blocklist: malformed profile document {}: {err}", doc.id);
                    return;
                }
            },
            None => UserRecord::default(),
        };

        let mut raw = Vec::new();
        let mut blocked = BTreeSet::new();
        for entry in record.blocked_users {
            match stringify_entry(&entry) {
                Some(value) => {
                    blocked.insert(ids::normalize_id(&value));
                    raw.push(value);
                }
                None => warn!("blocklist: skipping non-scalar block entry {entry}"),
            }
        }

        {
            let mut guard = lock(&self.state);
            guard.blocked = blocked;
            guard.remote_raw = raw;
        }
        self.emit_updated();
    }

    /// Optimistically add, then confirm remotely. A failed write is
    /// logged but not rolled back; the profile subscription corrects
    /// the cache on the next snapshot.
    pub async fn block(&self, target: &str) -> Result<(), crate::ClientError> {
        let normalized = ids::normalize_id(target);
        let user_id = {
            let mut guard = lock(&self.state);
            let Some(user_id) = guard.user_id.clone() else {
                return Err(crate::ClientError::NotSignedIn);
            };
            if !guard.blocked.insert(normalized.clone()) {
                debug!("blocklist: {normalized} already blocked");
                return Ok(());
            }
            user_id
        };
        self.emit_updated();

        match self
            .store
            .update_array_field(
                USERS_COLLECTION,
                user_id.as_str(),
                FIELD_BLOCKED_USERS,
                ArrayOp::Union(json!(normalized)),
            )
            .await
        {
            Ok(()) => info!("blocklist: blocked {normalized}"),
            Err(err) => warn!("blocklist: failed to persist block of {normalized}: {err}"),
        }
        Ok(())
    }

    /// Optimistically remove, then confirm remotely. Removes every
    /// stored form that matches the target id loosely, since the same
    /// logical id may have been written inconsistently over time.
    pub async fn unblock(&self, target: &str) -> Result<(), crate::ClientError> {
        let normalized = ids::normalize_id(target);
        let (user_id, forms) = {
            let mut guard = lock(&self.state);
            let Some(user_id) = guard.user_id.clone() else {
                return Err(crate::ClientError::NotSignedIn);
            };
            guard
                .blocked
                .retain(|b| !ids::id_forms_match(b, &normalized));

            let mut forms = vec![normalized.clone()];
            for raw in &guard.remote_raw {
                if ids::id_forms_match(raw, &normalized) && !forms.contains(raw) {
                    forms.push(raw.clone());
                }
            }
            (user_id, forms)
        };
        self.emit_updated();

        for form in forms {
            if let Err(err) = self
                .store
                .update_array_field(
                    USERS_COLLECTION,
                    user_id.as_str(),
                    FIELD_BLOCKED_USERS,
                    ArrayOp::Remove(json!(form)),
                )
                .await
            {
                warn!("blocklist: failed to persist unblock of {form}: {err}");
            }
        }
        Ok(())
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        let guard = lock(&self.state);
        crate::roster::is_id_blocked(id, &guard.blocked)
    }

    pub fn blocked_set(&self) -> BTreeSet<String> {
        lock(&self.state).blocked.clone()
    }

    fn emit_updated(&self) {
        let blocked: Vec<String> = {
            let guard = lock(&self.state);
            guard.blocked.iter().cloned().collect()
        };
        let _ = self.events.send(ClientEvent::BlockListUpdated(blocked));
    }
}

fn stringify_entry(entry: &Value) -> Option<String> {
    match entry {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
