//! In-memory store and identity fakes shared by the test modules.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use shared::domain::UserId;
use shared::error::StoreError;

use crate::store::{
    ArrayOp, Document, DocumentSnapshotHandler, DocumentStore, IdentityHandler, IdentityProvider,
    QuerySnapshotHandler, Subscription,
};

type SharedQueryHandler = Arc<dyn Fn(Vec<Document>) + Send + Sync>;
type SharedDocHandler = Arc<dyn Fn(Option<Document>) + Send + Sync>;
type SharedIdentityHandler = Arc<dyn Fn(Option<UserId>) + Send + Sync>;

struct QuerySub {
    id: u64,
    collection: String,
    /// `Some` for field-equality listeners, `None` for whole-collection.
    field: Option<(String, Value)>,
    handler: SharedQueryHandler,
}

struct DocSub {
    id: u64,
    collection: String,
    doc_id: String,
    handler: SharedDocHandler,
}

#[derive(Default)]
struct FakeStoreInner {
    next_sub_id: u64,
    next_doc_id: u64,
    added: Vec<(String, Value)>,
    sets: Vec<(String, String, Value)>,
    updates: Vec<(String, String, Value)>,
    array_ops: Vec<(String, String, String, ArrayOp)>,
    deletes: Vec<(String, String)>,
    query_results: HashMap<(String, String, String), Vec<Document>>,
    fail_ops: HashSet<&'static str>,
    query_subs: Vec<QuerySub>,
    doc_subs: Vec<DocSub>,
}

/// Records every write and lets tests push snapshots into live
/// listeners. Individual operations can be made to fail by name.
#[derive(Default)]
pub(crate) struct FakeStore {
    inner: Arc<Mutex<FakeStoreInner>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_op(&self, op: &'static str) {
        crate::lock(&self.inner).fail_ops.insert(op);
    }

    pub fn set_query_result(&self, collection: &str, field: &str, value: Value, docs: Vec<Document>) {
        crate::lock(&self.inner).query_results.insert(
            (collection.to_string(), field.to_string(), value.to_string()),
            docs,
        );
    }

    pub fn added(&self) -> Vec<(String, Value)> {
        crate::lock(&self.inner).added.clone()
    }

    pub fn sets(&self) -> Vec<(String, String, Value)> {
        crate::lock(&self.inner).sets.clone()
    }

    pub fn updates(&self) -> Vec<(String, String, Value)> {
        crate::lock(&self.inner).updates.clone()
    }

    pub fn array_ops(&self) -> Vec<(String, String, String, ArrayOp)> {
        crate::lock(&self.inner).array_ops.clone()
    }

    pub fn deletes(&self) -> Vec<(String, String)> {
        crate::lock(&self.inner).deletes.clone()
    }

    pub fn query_sub_count(&self, collection: &str) -> usize {
        crate::lock(&self.inner)
            .query_subs
            .iter()
            .filter(|sub| sub.collection == collection)
            .count()
    }

    pub fn doc_sub_count(&self, collection: &str) -> usize {
        crate::lock(&self.inner)
            .doc_subs
            .iter()
            .filter(|sub| sub.collection == collection)
            .count()
    }

    /// Deliver a snapshot to every field-equality listener on the
    /// collection. Handlers run outside the lock so they may re-enter
    /// the store.
    pub fn push_query_snapshot(&self, collection: &str, docs: Vec<Document>) {
        let handlers: Vec<SharedQueryHandler> = {
            let inner = crate::lock(&self.inner);
            inner
                .query_subs
                .iter()
                .filter(|sub| sub.collection == collection && sub.field.is_some())
                .map(|sub| Arc::clone(&sub.handler))
                .collect()
        };
        for handler in handlers {
            handler(docs.clone());
        }
    }

    /// Deliver a snapshot to every whole-collection listener.
    pub fn push_collection_snapshot(&self, collection: &str, docs: Vec<Document>) {
        let handlers: Vec<SharedQueryHandler> = {
            let inner = crate::lock(&self.inner);
            inner
                .query_subs
                .iter()
                .filter(|sub| sub.collection == collection && sub.field.is_none())
                .map(|sub| Arc::clone(&sub.handler))
                .collect()
        };
        for handler in handlers {
            handler(docs.clone());
        }
    }

    pub fn push_doc_snapshot(&self, collection: &str, doc_id: &str, doc: Option<Document>) {
        let handlers: Vec<SharedDocHandler> = {
            let inner = crate::lock(&self.inner);
            inner
                .doc_subs
                .iter()
                .filter(|sub| sub.collection == collection && sub.doc_id == doc_id)
                .map(|sub| Arc::clone(&sub.handler))
                .collect()
        };
        for handler in handlers {
            handler(doc.clone());
        }
    }

    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        if crate::lock(&self.inner).fail_ops.contains(op) {
            Err(StoreError::Backend(format!("injected failure: {op}")))
        } else {
            Ok(())
        }
    }

    fn register_query_sub(
        &self,
        collection: &str,
        field: Option<(String, Value)>,
        handler: QuerySnapshotHandler,
    ) -> Subscription {
        let sub_id = {
            let mut inner = crate::lock(&self.inner);
            inner.next_sub_id += 1;
            let sub_id = inner.next_sub_id;
            inner.query_subs.push(QuerySub {
                id: sub_id,
                collection: collection.to_string(),
                field,
                handler: Arc::from(handler),
            });
            sub_id
        };
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            crate::lock(&inner).query_subs.retain(|sub| sub.id != sub_id);
        })
    }
}

#[async_trait]
impl DocumentStore for FakeStore {
    async fn add_document(&self, collection: &str, data: Value) -> Result<String, StoreError> {
        self.check("add_document")?;
        let mut inner = crate::lock(&self.inner);
        inner.next_doc_id += 1;
        let id = format!("doc-{}", inner.next_doc_id);
        inner.added.push((collection.to_string(), data));
        Ok(id)
    }

    async fn get_document(
        &self,
        _collection: &str,
        _id: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.check("get_document")?;
        Ok(None)
    }

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        data: Value,
    ) -> Result<(), StoreError> {
        self.check("set_document")?;
        crate::lock(&self.inner)
            .sets
            .push((collection.to_string(), id.to_string(), data));
        Ok(())
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> Result<(), StoreError> {
        self.check("update_document")?;
        crate::lock(&self.inner)
            .updates
            .push((collection.to_string(), id.to_string(), patch));
        Ok(())
    }

    async fn update_array_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        op: ArrayOp,
    ) -> Result<(), StoreError> {
        self.check("update_array_field")?;
        crate::lock(&self.inner).array_ops.push((
            collection.to_string(),
            id.to_string(),
            field.to_string(),
            op,
        ));
        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check("delete_document")?;
        crate::lock(&self.inner)
            .deletes
            .push((collection.to_string(), id.to_string()));
        Ok(())
    }

    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: Value,
    ) -> Result<Vec<Document>, StoreError> {
        self.check("query_by_field")?;
        let key = (collection.to_string(), field.to_string(), value.to_string());
        Ok(crate::lock(&self.inner)
            .query_results
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    fn subscribe_by_field(
        &self,
        collection: &str,
        field: &str,
        value: Value,
        on_change: QuerySnapshotHandler,
    ) -> Result<Subscription, StoreError> {
        self.check("subscribe_by_field")?;
        Ok(self.register_query_sub(collection, Some((field.to_string(), value)), on_change))
    }

    fn subscribe_to_collection(
        &self,
        collection: &str,
        on_change: QuerySnapshotHandler,
    ) -> Result<Subscription, StoreError> {
        self.check("subscribe_to_collection")?;
        Ok(self.register_query_sub(collection, None, on_change))
    }

    fn subscribe_to_document(
        &self,
        collection: &str,
        id: &str,
        on_change: DocumentSnapshotHandler,
    ) -> Result<Subscription, StoreError> {
        self.check("subscribe_to_document")?;
        let sub_id = {
            let mut inner = crate::lock(&self.inner);
            inner.next_sub_id += 1;
            let sub_id = inner.next_sub_id;
            inner.doc_subs.push(DocSub {
                id: sub_id,
                collection: collection.to_string(),
                doc_id: id.to_string(),
                handler: Arc::from(on_change),
            });
            sub_id
        };
        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(move || {
            crate::lock(&inner).doc_subs.retain(|sub| sub.id != sub_id);
        }))
    }
}

#[derive(Default)]
struct FakeIdentityInner {
    current: Option<UserId>,
    next_id: u64,
    handlers: Vec<(u64, SharedIdentityHandler)>,
}

/// Scriptable identity signal.
#[derive(Default)]
pub(crate) struct FakeIdentity {
    inner: Arc<Mutex<FakeIdentityInner>>,
}

impl FakeIdentity {
    pub fn signed_out() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signed_in(user_id: &str) -> Arc<Self> {
        let identity = Self::default();
        crate::lock(&identity.inner).current = Some(UserId::new(user_id));
        Arc::new(identity)
    }

    pub fn set_user(&self, user_id: Option<UserId>) {
        let handlers: Vec<SharedIdentityHandler> = {
            let mut inner = crate::lock(&self.inner);
            inner.current = user_id.clone();
            inner
                .handlers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in handlers {
            handler(user_id.clone());
        }
    }
}

impl IdentityProvider for FakeIdentity {
    fn current_user_id(&self) -> Option<UserId> {
        crate::lock(&self.inner).current.clone()
    }

    fn on_identity_change(&self, on_change: IdentityHandler) -> Subscription {
        let handler_id = {
            let mut inner = crate::lock(&self.inner);
            inner.next_id += 1;
            let handler_id = inner.next_id;
            inner.handlers.push((handler_id, Arc::from(on_change)));
            handler_id
        };
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            crate::lock(&inner).handlers.retain(|(id, _)| *id != handler_id);
        })
    }
}
