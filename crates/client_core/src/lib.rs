//! Client-side synchronization core for the meetup app.
//!
//! Reconciles optimistic local state (meetings, chat, block list,
//! read markers) against an eventually-consistent remote document
//! store. The store and the identity signal are injected behind the
//! traits in [`store`]; everything else is owned here.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info};

use shared::domain::{
    Friend, Meeting, MeetingId, MeetingLocation, Message, MessageId, UserId, UserProfile,
};
use shared::ids;

pub mod blocklist;
pub mod error;
pub mod membership;
pub mod messages;
pub mod read_status;
pub mod roster;
pub mod store;

pub use blocklist::BlockListManager;
pub use error::ClientError;
pub use membership::{MembershipSynchronizer, DEPARTURE_GRACE_WINDOW};
pub use messages::MessageSynchronizer;
pub use read_status::ReadStatusTracker;

use store::{
    messages_collection, read_status_collection, Document, DocumentStore, IdentityProvider,
    MissingDocumentStore, MissingIdentityProvider, Subscription, FIELD_PARTICIPANT_IDS,
    MEETINGS_COLLECTION, USERS_COLLECTION,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Mutex guard that shrugs off poisoning; state behind these locks is
/// always left consistent between operations.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    MeetingsUpdated(Vec<Meeting>),
    ActiveMeetingChanged(Option<MeetingId>),
    /// The active meeting vanished from the snapshot without a local
    /// leave/delete: it ended or we were removed.
    MembershipLost {
        meeting_id: MeetingId,
    },
    RosterUpdated(Vec<Friend>),
    MessagesUpdated(Vec<Message>),
    MessageSendFailed {
        client_msg_id: String,
        reason: String,
    },
    /// Normalized ids, sorted.
    BlockListUpdated(Vec<String>),
    Error(String),
}

#[derive(Default)]
struct SessionState {
    profile: UserProfile,
    identity_sub: Option<Subscription>,
    meetings_sub: Option<Subscription>,
    profile_sub: Option<Subscription>,
    messages_sub: Option<Subscription>,
    read_status_sub: Option<Subscription>,
    /// Which meeting the message/read-status listeners are keyed on.
    subscribed_meeting: Option<MeetingId>,
}

pub struct MeetupClient {
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    membership: MembershipSynchronizer,
    messages: MessageSynchronizer,
    blocklist: Arc<BlockListManager>,
    read_status: ReadStatusTracker,
    events: broadcast::Sender<ClientEvent>,
    session: Mutex<SessionState>,
}

impl MeetupClient {
    pub fn new() -> Arc<Self> {
        Self::new_with_dependencies(
            Arc::new(MissingDocumentStore),
            Arc::new(MissingIdentityProvider),
        )
    }

    pub fn new_with_dependencies(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let blocklist = Arc::new(BlockListManager::new(Arc::clone(&store), events.clone()));
        Arc::new(Self {
            membership: MembershipSynchronizer::new(Arc::clone(&store), events.clone()),
            messages: MessageSynchronizer::new(
                Arc::clone(&store),
                Arc::clone(&blocklist),
                events.clone(),
            ),
            read_status: ReadStatusTracker::new(Arc::clone(&store)),
            blocklist,
            identity,
            store,
            events,
            session: Mutex::new(SessionState::default()),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Wire the identity signal and pick up the current sign-in
    /// state. Must be called once after construction.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let sub = self.identity.on_identity_change(Box::new(move |user| {
            if let Some(client) = weak.upgrade() {
                client.handle_identity_change(user);
            }
        }));
        {
            let mut session = lock(&self.session);
            session.identity_sub = Some(sub);
        }
        self.handle_identity_change(self.identity.current_user_id());
    }

    /// Release every live listener and clear session state.
    pub fn stop(&self) {
        let identity_sub = lock(&self.session).identity_sub.take();
        drop(identity_sub);
        self.release_user_subscriptions();
        self.membership.set_current_user(None);
        self.blocklist.reset(None);
    }

    pub fn set_profile(&self, profile: UserProfile) {
        lock(&self.session).profile = profile;
    }

    pub fn profile(&self) -> UserProfile {
        lock(&self.session).profile.clone()
    }

    // ---- membership operations ----

    pub async fn create_meeting(self: &Arc<Self>, title: String) -> Result<Meeting, ClientError> {
        let profile = self.profile();
        let meeting = self.membership.create_meeting(title, &profile).await?;
        self.sync_active_subscriptions();
        self.emit_roster();
        Ok(meeting)
    }

    pub async fn join_meeting_by_code(
        self: &Arc<Self>,
        code: &str,
    ) -> Result<Meeting, ClientError> {
        let profile = self.profile();
        let meeting = self.membership.join_by_code(code, &profile).await?;
        self.messages
            .post_system(&meeting.id, format!("{} joined the meeting", profile.nickname))
            .await;
        self.sync_active_subscriptions();
        self.emit_roster();
        Ok(meeting)
    }

    /// Fabricate a local placeholder meeting for the guest flow.
    pub fn start_guest_meeting(self: &Arc<Self>, title: String) -> Meeting {
        let profile = self.profile();
        let meeting = self.membership.register_local_meeting(title, &profile);
        self.sync_active_subscriptions();
        self.emit_roster();
        meeting
    }

    pub async fn leave_meeting(self: &Arc<Self>, meeting_id: &MeetingId) -> Result<(), ClientError> {
        self.membership.leave(meeting_id).await?;
        self.sync_active_subscriptions();
        self.emit_roster();
        Ok(())
    }

    pub async fn delete_meeting(
        self: &Arc<Self>,
        meeting_id: &MeetingId,
    ) -> Result<(), ClientError> {
        self.membership.delete_meeting(meeting_id).await?;
        self.sync_active_subscriptions();
        self.emit_roster();
        Ok(())
    }

    pub async fn rename_meeting(
        &self,
        meeting_id: &MeetingId,
        new_title: String,
    ) -> Result<(), ClientError> {
        self.membership.rename(meeting_id, new_title).await
    }

    pub async fn set_meeting_location(
        &self,
        meeting_id: &MeetingId,
        location: MeetingLocation,
    ) -> Result<(), ClientError> {
        self.membership.set_meeting_location(meeting_id, location).await
    }

    pub async fn update_my_location(
        &self,
        lat: f64,
        lng: f64,
        address: Option<String>,
    ) -> Result<(), ClientError> {
        self.membership.update_my_location(lat, lng, address).await
    }

    pub fn set_active_meeting(
        self: &Arc<Self>,
        meeting_id: Option<MeetingId>,
    ) -> Result<(), ClientError> {
        self.membership.set_active(meeting_id)?;
        self.sync_active_subscriptions();
        self.emit_roster();
        Ok(())
    }

    pub fn meetings(&self) -> Vec<Meeting> {
        self.membership.meetings()
    }

    pub fn active_meeting_id(&self) -> Option<MeetingId> {
        self.membership.active_meeting_id()
    }

    pub fn active_meeting(&self) -> Option<Meeting> {
        self.membership.active_meeting()
    }

    // ---- chat operations ----

    pub async fn send_message(&self, content: String) -> Result<(), ClientError> {
        let target = self.membership.resolve_send_target()?;
        let sender_id = self
            .membership
            .current_user()
            .unwrap_or_else(|| UserId::new(ids::SELF_ALIAS));
        let profile = self.profile();
        let sender_name = if profile.nickname.is_empty() {
            "Unknown".to_string()
        } else {
            profile.nickname
        };
        self.messages
            .send(target, sender_id, sender_name, content)
            .await
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.messages()
    }

    pub async fn mark_as_read(&self, message_id: MessageId) {
        self.read_status.mark_as_read(message_id).await;
    }

    /// Anchor for the "new messages" divider (frozen at session
    /// start; see [`ReadStatusTracker`]).
    pub fn unread_divider_anchor(&self) -> Option<MessageId> {
        self.read_status.divider_anchor()
    }

    // ---- block list operations ----

    pub async fn block_user(&self, target: &str) -> Result<(), ClientError> {
        self.blocklist.block(target).await?;
        self.emit_roster();
        self.messages.emit_current();
        Ok(())
    }

    pub async fn unblock_user(&self, target: &str) -> Result<(), ClientError> {
        self.blocklist.unblock(target).await?;
        self.emit_roster();
        self.messages.emit_current();
        Ok(())
    }

    pub fn blocked_users(&self) -> Vec<String> {
        self.blocklist.blocked_set().into_iter().collect()
    }

    // ---- roster ----

    pub fn friends(&self) -> Vec<Friend> {
        let meeting = self.membership.active_meeting();
        let user = self.membership.current_user();
        roster::derive_friends(
            meeting.as_ref(),
            user.as_ref(),
            &self.blocklist.blocked_set(),
        )
    }

    // ---- snapshot plumbing ----

    /// Drop every store listener tied to the signed-in user and
    /// rebind the per-meeting synchronizers to nothing. Runs on every
    /// identity change: a direct user-to-user switch must not leave
    /// the previous user's meeting listeners live.
    fn release_user_subscriptions(&self) {
        let dropped = {
            let mut session = lock(&self.session);
            (
                session.meetings_sub.take(),
                session.profile_sub.take(),
                session.messages_sub.take(),
                session.read_status_sub.take(),
                std::mem::take(&mut session.subscribed_meeting),
            )
        };
        drop(dropped);
        self.messages.reset(None);
        self.read_status.reset(None, None);
    }

    fn handle_identity_change(self: &Arc<Self>, user: Option<UserId>) {
        self.release_user_subscriptions();
        match user {
            Some(user_id) => {
                info!("session: signed in as {user_id}");
                self.membership.set_current_user(Some(user_id.clone()));
                self.blocklist.reset(Some(user_id.clone()));

                let weak = Arc::downgrade(self);
                let meetings_sub = self.store.subscribe_by_field(
                    MEETINGS_COLLECTION,
                    FIELD_PARTICIPANT_IDS,
                    json!(user_id),
                    Box::new(move |docs| {
                        if let Some(client) = weak.upgrade() {
                            client.handle_meetings_snapshot(docs);
                        }
                    }),
                );
                let meetings_sub = match meetings_sub {
                    Ok(sub) => Some(sub),
                    Err(err) => {
                        error!("membership: meetings subscription failed: {err}");
                        let _ = self.events.send(ClientEvent::Error(format!(
                            "meetings subscription failed: {err}"
                        )));
                        None
                    }
                };

                let weak = Arc::downgrade(self);
                let profile_sub = self.store.subscribe_to_document(
                    USERS_COLLECTION,
                    user_id.as_str(),
                    Box::new(move |doc| {
                        if let Some(client) = weak.upgrade() {
                            client.handle_profile_snapshot(doc);
                        }
                    }),
                );
                let profile_sub = match profile_sub {
                    Ok(sub) => Some(sub),
                    Err(err) => {
                        error!("blocklist: profile subscription failed: {err}");
                        let _ = self.events.send(ClientEvent::Error(format!(
                            "profile subscription failed: {err}"
                        )));
                        None
                    }
                };

                let mut session = lock(&self.session);
                session.meetings_sub = meetings_sub;
                session.profile_sub = profile_sub;
            }
            None => {
                info!("session: signed out");
                self.membership.set_current_user(None);
                self.blocklist.reset(None);
                self.emit_roster();
            }
        }
    }

    fn handle_meetings_snapshot(self: &Arc<Self>, documents: Vec<Document>) {
        self.membership.apply_snapshot(documents);
        self.sync_active_subscriptions();
        self.emit_roster();
    }

    fn handle_profile_snapshot(self: &Arc<Self>, document: Option<Document>) {
        self.blocklist.apply_snapshot(document);
        self.emit_roster();
        self.messages.emit_current();
    }

    fn handle_messages_snapshot(self: &Arc<Self>, documents: Vec<Document>) {
        let visible = self.messages.apply_snapshot(documents);
        self.read_status
            .note_messages_loaded(visible.last().map(|m| &m.id));
    }

    fn handle_read_status_snapshot(self: &Arc<Self>, document: Option<Document>) {
        self.read_status.apply_remote(document);
    }

    /// Re-key the per-meeting listeners whenever the active meeting
    /// changes. The old listeners are dropped before the new ones are
    /// registered, so a stale callback can never touch the new
    /// meeting's state.
    fn sync_active_subscriptions(self: &Arc<Self>) {
        let active = self.membership.active_meeting_id();

        let (changed, old_subs) = {
            let mut session = lock(&self.session);
            if session.subscribed_meeting == active {
                (false, (None, None))
            } else {
                session.subscribed_meeting = active.clone();
                (
                    true,
                    (session.messages_sub.take(), session.read_status_sub.take()),
                )
            }
        };
        drop(old_subs);
        if !changed {
            return;
        }

        self.messages.reset(active.clone());
        self.read_status
            .reset(active.clone(), self.membership.current_user());

        let Some(meeting_id) = active else {
            return;
        };
        if meeting_id.is_placeholder() {
            // Placeholders have no remote sub-resources to listen on.
            return;
        }

        let weak = Arc::downgrade(self);
        match self.store.subscribe_to_collection(
            &messages_collection(&meeting_id),
            Box::new(move |docs| {
                if let Some(client) = weak.upgrade() {
                    client.handle_messages_snapshot(docs);
                }
            }),
        ) {
            Ok(sub) => lock(&self.session).messages_sub = Some(sub),
            Err(err) => {
                error!("chat: message subscription failed for {meeting_id}: {err}");
                let _ = self.events.send(ClientEvent::Error(format!(
                    "message subscription failed: {err}"
                )));
            }
        }

        if let Some(user_id) = self.membership.current_user() {
            let weak = Arc::downgrade(self);
            match self.store.subscribe_to_document(
                &read_status_collection(&meeting_id),
                user_id.as_str(),
                Box::new(move |doc| {
                    if let Some(client) = weak.upgrade() {
                        client.handle_read_status_snapshot(doc);
                    }
                }),
            ) {
                Ok(sub) => lock(&self.session).read_status_sub = Some(sub),
                Err(err) => {
                    error!("readstatus: subscription failed for {meeting_id}: {err}");
                }
            }
        }
    }

    fn emit_roster(&self) {
        let _ = self.events.send(ClientEvent::RosterUpdated(self.friends()));
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
