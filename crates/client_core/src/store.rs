//! The seam between the synchronization core and the remote backend.
//!
//! The backend is a generic document store (collections of JSON
//! documents, field-equality queries, atomic array set-union/removal,
//! live snapshot subscriptions) plus an identity signal. Concrete
//! implementations live outside this crate; tests inject fakes.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use shared::{
    domain::{MeetingId, UserId},
    error::StoreError,
};

pub const MEETINGS_COLLECTION: &str = "meetings";
pub const USERS_COLLECTION: &str = "users";

pub const FIELD_GROUP_CODE: &str = "groupCode";
pub const FIELD_PARTICIPANT_IDS: &str = "participantIds";
pub const FIELD_PARTICIPANTS: &str = "participants";
pub const FIELD_TITLE: &str = "title";
pub const FIELD_MEETING_LOCATION: &str = "meetingLocation";
pub const FIELD_BLOCKED_USERS: &str = "blockedUsers";

/// Path of a meeting's message sub-collection.
pub fn messages_collection(meeting_id: &MeetingId) -> String {
    format!("{MEETINGS_COLLECTION}/{meeting_id}/messages")
}

/// Path of a meeting's per-user read-status sub-collection.
pub fn read_status_collection(meeting_id: &MeetingId) -> String {
    format!("{MEETINGS_COLLECTION}/{meeting_id}/readStatus")
}

/// A document as delivered by the store: id plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// Atomic array mutation. Union is a set-add (no duplicate is
/// created); Remove deletes every element equal to the value.
#[derive(Debug, Clone)]
pub enum ArrayOp {
    Union(Value),
    Remove(Value),
}

pub type QuerySnapshotHandler = Box<dyn Fn(Vec<Document>) + Send + Sync>;
pub type DocumentSnapshotHandler = Box<dyn Fn(Option<Document>) + Send + Sync>;
pub type IdentityHandler = Box<dyn Fn(Option<UserId>) + Send + Sync>;

/// Live-listener registration. Dropping the guard releases the
/// listener; a released listener must never fire again.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A guard with nothing to release.
    pub fn noop() -> Self {
        Self { cancel: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Remote document store operations the core depends on.
///
/// Subscription registration is synchronous: the store starts the
/// listener and invokes the handler on every subsequent snapshot until
/// the returned [`Subscription`] is dropped.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn add_document(&self, collection: &str, data: Value) -> Result<String, StoreError>;

    async fn get_document(&self, collection: &str, id: &str)
        -> Result<Option<Value>, StoreError>;

    /// Keyed upsert (used for per-(meeting, user) read-status docs).
    async fn set_document(&self, collection: &str, id: &str, data: Value)
        -> Result<(), StoreError>;

    /// Merge the given fields into an existing document.
    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> Result<(), StoreError>;

    async fn update_array_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        op: ArrayOp,
    ) -> Result<(), StoreError>;

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: Value,
    ) -> Result<Vec<Document>, StoreError>;

    /// Subscribe to documents matching `field == value` (for array
    /// fields, array-contains where the backend supports it).
    fn subscribe_by_field(
        &self,
        collection: &str,
        field: &str,
        value: Value,
        on_change: QuerySnapshotHandler,
    ) -> Result<Subscription, StoreError>;

    /// Subscribe to every document of a collection (message streams).
    fn subscribe_to_collection(
        &self,
        collection: &str,
        on_change: QuerySnapshotHandler,
    ) -> Result<Subscription, StoreError>;

    fn subscribe_to_document(
        &self,
        collection: &str,
        id: &str,
        on_change: DocumentSnapshotHandler,
    ) -> Result<Subscription, StoreError>;
}

/// Current-user signal from the auth layer.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;

    /// Fires with the new uid on sign-in and `None` on sign-out.
    fn on_identity_change(&self, on_change: IdentityHandler) -> Subscription;
}

/// Fallback store used before a real backend is injected.
pub struct MissingDocumentStore;

#[async_trait]
impl DocumentStore for MissingDocumentStore {
    async fn add_document(&self, collection: &str, _data: Value) -> Result<String, StoreError> {
        Err(StoreError::Unavailable(format!(
            "no document store configured (add to {collection})"
        )))
    }

    async fn get_document(
        &self,
        collection: &str,
        _id: &str,
    ) -> Result<Option<Value>, StoreError> {
        Err(StoreError::Unavailable(format!(
            "no document store configured (get from {collection})"
        )))
    }

    async fn set_document(
        &self,
        collection: &str,
        _id: &str,
        _data: Value,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(format!(
            "no document store configured (set in {collection})"
        )))
    }

    async fn update_document(
        &self,
        collection: &str,
        _id: &str,
        _patch: Value,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(format!(
            "no document store configured (update in {collection})"
        )))
    }

    async fn update_array_field(
        &self,
        collection: &str,
        _id: &str,
        _field: &str,
        _op: ArrayOp,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(format!(
            "no document store configured (array update in {collection})"
        )))
    }

    async fn delete_document(&self, collection: &str, _id: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(format!(
            "no document store configured (delete from {collection})"
        )))
    }

    async fn query_by_field(
        &self,
        collection: &str,
        _field: &str,
        _value: Value,
    ) -> Result<Vec<Document>, StoreError> {
        Err(StoreError::Unavailable(format!(
            "no document store configured (query {collection})"
        )))
    }

    fn subscribe_by_field(
        &self,
        collection: &str,
        _field: &str,
        _value: Value,
        _on_change: QuerySnapshotHandler,
    ) -> Result<Subscription, StoreError> {
        Err(StoreError::Unavailable(format!(
            "no document store configured (subscribe {collection})"
        )))
    }

    fn subscribe_to_collection(
        &self,
        collection: &str,
        _on_change: QuerySnapshotHandler,
    ) -> Result<Subscription, StoreError> {
        Err(StoreError::Unavailable(format!(
            "no document store configured (subscribe {collection})"
        )))
    }

    fn subscribe_to_document(
        &self,
        collection: &str,
        _id: &str,
        _on_change: DocumentSnapshotHandler,
    ) -> Result<Subscription, StoreError> {
        Err(StoreError::Unavailable(format!(
            "no document store configured (subscribe {collection})"
        )))
    }
}

/// Fallback identity provider: permanently signed out.
pub struct MissingIdentityProvider;

impl IdentityProvider for MissingIdentityProvider {
    fn current_user_id(&self) -> Option<UserId> {
        None
    }

    fn on_identity_change(&self, _on_change: IdentityHandler) -> Subscription {
        Subscription::noop()
    }
}
