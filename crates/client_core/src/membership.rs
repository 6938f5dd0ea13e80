//! Membership Synchronizer.
//!
//! Owns the list of meetings the current user belongs to and the
//! single active-meeting pointer. Remote snapshots are authoritative
//! for every meeting id they contain; locally-fabricated placeholder
//! meetings ride along only until a real meeting supersedes them.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use shared::{
    domain::{Meeting, MeetingId, MeetingLocation, Participant, Role, UserId, UserProfile},
    error::StoreError,
    ids,
};

use crate::{
    lock,
    store::{
        ArrayOp, Document, DocumentStore, FIELD_GROUP_CODE, FIELD_MEETING_LOCATION,
        FIELD_PARTICIPANTS, FIELD_PARTICIPANT_IDS, FIELD_TITLE, MEETINGS_COLLECTION,
    },
    ClientError, ClientEvent,
};

/// How long a locally-initiated leave/delete marker is honored when
/// classifying a meeting's disappearance from the snapshot. The
/// marker is consumed on match; the window only bounds how long a
/// failed or echo-less write can suppress a genuine removal.
pub const DEPARTURE_GRACE_WINDOW: Duration = Duration::from_secs(2);

pub struct MembershipSynchronizer {
    store: Arc<dyn DocumentStore>,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<MembershipState>,
}

#[derive(Default)]
struct MembershipState {
    current_user: Option<UserId>,
    /// Remote snapshot, list order preserved.
    remote: Vec<Meeting>,
    /// Local-only placeholder meetings (guest flow).
    local: Vec<Meeting>,
    active: Option<MeetingId>,
    /// Meetings we are leaving/deleting ourselves, so the
    /// subscription echo is not misread as an external removal.
    departures: HashMap<MeetingId, Instant>,
}

impl MembershipState {
    fn merged(&self) -> Vec<Meeting> {
        let mut merged = self.remote.clone();
        merged.extend(self.local.iter().cloned());
        merged
    }

    fn find(&self, id: &MeetingId) -> Option<&Meeting> {
        self.remote
            .iter()
            .chain(self.local.iter())
            .find(|m| &m.id == id)
    }

    fn prune_departures(&mut self) {
        self.departures
            .retain(|_, marked| marked.elapsed() < DEPARTURE_GRACE_WINDOW);
    }

    fn consume_departure(&mut self, id: &MeetingId) -> bool {
        self.prune_departures();
        self.departures.remove(id).is_some()
    }
}

impl MembershipSynchronizer {
    pub fn new(store: Arc<dyn DocumentStore>, events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            store,
            events,
            state: Mutex::new(MembershipState::default()),
        }
    }

    pub fn set_current_user(&self, user_id: Option<UserId>) {
        let (meetings, active_changed) = {
            let mut guard = lock(&self.state);
            if guard.current_user == user_id {
                return;
            }
            guard.current_user = user_id;
            let had_active = guard.active.is_some();
            guard.remote.clear();
            guard.local.clear();
            guard.active = None;
            guard.departures.clear();
            (guard.merged(), had_active)
        };
        let _ = self.events.send(ClientEvent::MeetingsUpdated(meetings));
        if active_changed {
            let _ = self.events.send(ClientEvent::ActiveMeetingChanged(None));
        }
    }

    pub fn current_user(&self) -> Option<UserId> {
        lock(&self.state).current_user.clone()
    }

    pub fn meetings(&self) -> Vec<Meeting> {
        lock(&self.state).merged()
    }

    pub fn active_meeting_id(&self) -> Option<MeetingId> {
        lock(&self.state).active.clone()
    }

    pub fn active_meeting(&self) -> Option<Meeting> {
        let guard = lock(&self.state);
        guard.active.as_ref().and_then(|id| guard.find(id)).cloned()
    }

    /// Fabricate a local-only meeting so a guest can interact before
    /// the real join write is confirmed. Never persisted.
    pub fn register_local_meeting(&self, title: String, profile: &UserProfile) -> Meeting {
        let self_id = lock(&self.state)
            .current_user
            .clone()
            .unwrap_or_else(|| UserId::new(ids::SELF_ALIAS));
        let meeting = Meeting {
            id: ids::local_meeting_id(),
            title,
            group_code: String::new(),
            host_id: self_id.clone(),
            participant_ids: vec![self_id.clone()],
            participants: vec![participant_from_profile(self_id, profile, Role::Host)],
            status: None,
            meeting_location: None,
            created_at: Some(Utc::now()),
        };

        let meetings = {
            let mut guard = lock(&self.state);
            guard.local.push(meeting.clone());
            guard.active = Some(meeting.id.clone());
            guard.merged()
        };
        info!("membership: registered placeholder meeting {}", meeting.id);
        let _ = self.events.send(ClientEvent::MeetingsUpdated(meetings));
        let _ = self
            .events
            .send(ClientEvent::ActiveMeetingChanged(Some(meeting.id.clone())));
        meeting
    }

    /// Reconcile a remote snapshot. Returns the active meeting id
    /// after reconciliation so the caller can re-key its per-meeting
    /// subscriptions.
    pub fn apply_snapshot(&self, documents: Vec<Document>) -> Option<MeetingId> {
        let mut remote = Vec::with_capacity(documents.len());
        for doc in documents {
            match Meeting::from_document(MeetingId::new(doc.id.clone()), doc.data) {
                Ok(meeting) => remote.push(meeting),
                Err(err) => {
                    warn!("membership: skipping malformed meeting document {}: {err}", doc.id)
                }
            }
        }

        let (meetings, lost, active, active_changed) = {
            let mut guard = lock(&self.state);

            // The store cannot index into array-of-object membership;
            // re-filter client-side regardless of how the query was
            // scoped.
            if let Some(user) = guard.current_user.clone() {
                remote.retain(|m| m.has_participant(&user));
            } else {
                remote.clear();
            }

            let remote_ids: HashSet<MeetingId> =
                remote.iter().map(|m| m.id.clone()).collect();

            // A placeholder is superseded by any confirmed membership,
            // not just an id collision: it only ever existed to bridge
            // the gap until the join write landed.
            if !remote.is_empty() {
                guard.local.clear();
            }
            guard.remote = remote;

            let prev_active = guard.active.clone();
            let mut lost = None;
            match prev_active.clone() {
                None => {
                    guard.active = guard.remote.first().map(|m| m.id.clone());
                }
                Some(active) if active.is_placeholder() => {
                    if let Some(first) = guard.remote.first() {
                        guard.active = Some(first.id.clone());
                    } else if !guard.local.iter().any(|m| m.id == active) {
                        guard.active = None;
                    }
                }
                Some(active) if !remote_ids.contains(&active) => {
                    if guard.consume_departure(&active) {
                        debug!("membership: self-initiated departure from {active} confirmed");
                        guard.active = guard.remote.first().map(|m| m.id.clone());
                    } else {
                        lost = Some(active);
                        guard.active = None;
                    }
                }
                Some(_) => {}
            }

            let active = guard.active.clone();
            (
                guard.merged(),
                lost,
                active.clone(),
                active != prev_active,
            )
        };

        let _ = self.events.send(ClientEvent::MeetingsUpdated(meetings));
        if let Some(meeting_id) = lost {
            warn!("membership: meeting {meeting_id} ended or we were removed");
            let _ = self
                .events
                .send(ClientEvent::MembershipLost { meeting_id });
        }
        if active_changed {
            let _ = self
                .events
                .send(ClientEvent::ActiveMeetingChanged(active.clone()));
        }
        active
    }

    pub fn set_active(&self, meeting_id: Option<MeetingId>) -> Result<(), ClientError> {
        let changed = {
            let mut guard = lock(&self.state);
            if let Some(id) = &meeting_id {
                if guard.find(id).is_none() {
                    return Err(ClientError::UnknownMeeting(id.clone()));
                }
            }
            if guard.active == meeting_id {
                false
            } else {
                guard.active = meeting_id.clone();
                true
            }
        };
        if changed {
            let _ = self
                .events
                .send(ClientEvent::ActiveMeetingChanged(meeting_id));
        }
        Ok(())
    }

    /// Where a message send must persist. Placeholders are never
    /// writable; if one is active but a real meeting already exists,
    /// the send is redirected there.
    pub fn resolve_send_target(&self) -> Result<MeetingId, ClientError> {
        let guard = lock(&self.state);
        let Some(active) = guard.active.clone() else {
            return Err(ClientError::NoActiveMeeting);
        };
        if !active.is_placeholder() {
            return Ok(active);
        }
        guard
            .remote
            .iter()
            .map(|m| m.id.clone())
            .find(|id| !id.is_placeholder())
            .ok_or(ClientError::MeetingNotWritable(active))
    }

    pub async fn create_meeting(
        &self,
        title: String,
        profile: &UserProfile,
    ) -> Result<Meeting, ClientError> {
        let user_id = self.current_user().ok_or(ClientError::NotSignedIn)?;
        let mut meeting = Meeting {
            id: MeetingId::default(),
            title,
            group_code: ids::generate_group_code(),
            host_id: user_id.clone(),
            participant_ids: vec![user_id.clone()],
            participants: vec![participant_from_profile(user_id, profile, Role::Host)],
            status: None,
            meeting_location: None,
            created_at: Some(Utc::now()),
        };

        let body = serde_json::to_value(&meeting).map_err(StoreError::from)?;
        let id = self.store.add_document(MEETINGS_COLLECTION, body).await?;
        meeting.id = MeetingId::new(id);
        info!(
            "membership: created meeting {} code={}",
            meeting.id, meeting.group_code
        );

        self.adopt(meeting.clone());
        Ok(meeting)
    }

    /// Join by short code. Joining a meeting we already belong to is
    /// a no-op returning the meeting unchanged.
    pub async fn join_by_code(
        &self,
        code: &str,
        profile: &UserProfile,
    ) -> Result<Meeting, ClientError> {
        let user_id = self.current_user().ok_or(ClientError::NotSignedIn)?;
        let code = ids::normalize_group_code(code);

        let matches = self
            .store
            .query_by_field(MEETINGS_COLLECTION, FIELD_GROUP_CODE, json!(code))
            .await?;
        let Some(doc) = matches.into_iter().next() else {
            return Err(ClientError::InvalidJoinCode(code));
        };
        let mut meeting = Meeting::from_document(MeetingId::new(doc.id.clone()), doc.data)
            .map_err(StoreError::from)?;

        if meeting.has_participant(&user_id) {
            debug!("membership: already a participant of {}", meeting.id);
            self.adopt(meeting.clone());
            return Ok(meeting);
        }

        let participant = participant_from_profile(user_id.clone(), profile, Role::Member);
        let participant_body = serde_json::to_value(&participant).map_err(StoreError::from)?;
        self.store
            .update_array_field(
                MEETINGS_COLLECTION,
                meeting.id.as_str(),
                FIELD_PARTICIPANT_IDS,
                ArrayOp::Union(json!(user_id)),
            )
            .await?;
        self.store
            .update_array_field(
                MEETINGS_COLLECTION,
                meeting.id.as_str(),
                FIELD_PARTICIPANTS,
                ArrayOp::Union(participant_body),
            )
            .await?;

        meeting.participant_ids.push(user_id);
        meeting.participants.push(participant);
        info!("membership: joined meeting {} via code", meeting.id);

        self.adopt(meeting.clone());
        Ok(meeting)
    }

    /// Leave a meeting. The departure marker is set before the write
    /// so the subscription echo is classified as self-initiated.
    pub async fn leave(&self, meeting_id: &MeetingId) -> Result<(), ClientError> {
        if meeting_id.is_placeholder() {
            self.discard_local(meeting_id);
            return Ok(());
        }
        let user_id = self.current_user().ok_or(ClientError::NotSignedIn)?;

        let participant_body = {
            let guard = lock(&self.state);
            guard
                .find(meeting_id)
                .and_then(|m| m.participant(&user_id))
                .map(serde_json::to_value)
                .transpose()
                .map_err(StoreError::from)?
        };

        self.mark_departure(meeting_id);
        self.store
            .update_array_field(
                MEETINGS_COLLECTION,
                meeting_id.as_str(),
                FIELD_PARTICIPANT_IDS,
                ArrayOp::Remove(json!(user_id)),
            )
            .await?;
        if let Some(body) = participant_body {
            self.store
                .update_array_field(
                    MEETINGS_COLLECTION,
                    meeting_id.as_str(),
                    FIELD_PARTICIPANTS,
                    ArrayOp::Remove(body),
                )
                .await?;
        }

        info!("membership: left meeting {meeting_id}");
        self.remove_local_copy(meeting_id);
        Ok(())
    }

    /// Delete a meeting outright. Host-only by convention; the store
    /// rules enforce it, not this client.
    pub async fn delete_meeting(&self, meeting_id: &MeetingId) -> Result<(), ClientError> {
        if meeting_id.is_placeholder() {
            self.discard_local(meeting_id);
            return Ok(());
        }

        self.mark_departure(meeting_id);
        self.store
            .delete_document(MEETINGS_COLLECTION, meeting_id.as_str())
            .await?;

        info!("membership: deleted meeting {meeting_id}");
        self.remove_local_copy(meeting_id);
        Ok(())
    }

    pub async fn rename(
        &self,
        meeting_id: &MeetingId,
        new_title: String,
    ) -> Result<(), ClientError> {
        if meeting_id.is_placeholder() {
            return Err(ClientError::MeetingNotWritable(meeting_id.clone()));
        }
        self.store
            .update_document(
                MEETINGS_COLLECTION,
                meeting_id.as_str(),
                json!({ FIELD_TITLE: new_title }),
            )
            .await?;

        let meetings = {
            let mut guard = lock(&self.state);
            if let Some(meeting) = guard.remote.iter_mut().find(|m| &m.id == meeting_id) {
                meeting.title = new_title;
            }
            guard.merged()
        };
        let _ = self.events.send(ClientEvent::MeetingsUpdated(meetings));
        Ok(())
    }

    pub async fn set_meeting_location(
        &self,
        meeting_id: &MeetingId,
        location: MeetingLocation,
    ) -> Result<(), ClientError> {
        if meeting_id.is_placeholder() {
            return Err(ClientError::MeetingNotWritable(meeting_id.clone()));
        }
        let body = serde_json::to_value(&location).map_err(StoreError::from)?;
        self.store
            .update_document(
                MEETINGS_COLLECTION,
                meeting_id.as_str(),
                json!({ FIELD_MEETING_LOCATION: body }),
            )
            .await?;

        let meetings = {
            let mut guard = lock(&self.state);
            if let Some(meeting) = guard.remote.iter_mut().find(|m| &m.id == meeting_id) {
                meeting.meeting_location = Some(location);
            }
            guard.merged()
        };
        let _ = self.events.send(ClientEvent::MeetingsUpdated(meetings));
        Ok(())
    }

    /// Publish the caller's position into the active meeting. The
    /// participants array is replaced whole; the store has no
    /// update-in-place for array elements.
    pub async fn update_my_location(
        &self,
        lat: f64,
        lng: f64,
        address: Option<String>,
    ) -> Result<(), ClientError> {
        let (meeting_id, user_id, participants) = {
            let guard = lock(&self.state);
            let Some(active) = guard.active.clone() else {
                return Err(ClientError::NoActiveMeeting);
            };
            let user_id = guard
                .current_user
                .clone()
                .unwrap_or_else(|| UserId::new(ids::SELF_ALIAS));
            let Some(meeting) = guard.find(&active) else {
                return Err(ClientError::UnknownMeeting(active));
            };

            let mut participants = meeting.participants.clone();
            let current = user_id.as_str();
            for participant in &mut participants {
                if ids::is_self(participant.id.as_str(), Some(current)) {
                    participant.lat = Some(lat);
                    participant.lng = Some(lng);
                    participant.address = address.clone();
                }
            }
            (active, user_id, participants)
        };

        if meeting_id.is_placeholder() {
            // Guest meetings only exist locally; keep the copy fresh.
            let meetings = {
                let mut guard = lock(&self.state);
                if let Some(meeting) = guard.local.iter_mut().find(|m| m.id == meeting_id) {
                    meeting.participants = participants;
                }
                guard.merged()
            };
            let _ = self.events.send(ClientEvent::MeetingsUpdated(meetings));
            return Ok(());
        }

        let body = serde_json::to_value(&participants).map_err(StoreError::from)?;
        self.store
            .update_document(
                MEETINGS_COLLECTION,
                meeting_id.as_str(),
                json!({ FIELD_PARTICIPANTS: body }),
            )
            .await?;

        let meetings = {
            let mut guard = lock(&self.state);
            if let Some(meeting) = guard.remote.iter_mut().find(|m| m.id == meeting_id) {
                meeting.participants = participants;
            }
            guard.merged()
        };
        debug!("membership: published location for {user_id} in {meeting_id}");
        let _ = self.events.send(ClientEvent::MeetingsUpdated(meetings));
        Ok(())
    }

    fn mark_departure(&self, meeting_id: &MeetingId) {
        let mut guard = lock(&self.state);
        guard.prune_departures();
        guard.departures.insert(meeting_id.clone(), Instant::now());
    }

    /// Adopt a meeting we just created/joined ahead of the next
    /// snapshot: supersede placeholders, make it active.
    fn adopt(&self, meeting: Meeting) {
        let (meetings, active_changed) = {
            let mut guard = lock(&self.state);
            guard.local.clear();
            match guard.remote.iter_mut().find(|m| m.id == meeting.id) {
                Some(existing) => *existing = meeting.clone(),
                None => guard.remote.push(meeting.clone()),
            }
            let changed = guard.active.as_ref() != Some(&meeting.id);
            guard.active = Some(meeting.id.clone());
            (guard.merged(), changed)
        };
        let _ = self.events.send(ClientEvent::MeetingsUpdated(meetings));
        if active_changed {
            let _ = self
                .events
                .send(ClientEvent::ActiveMeetingChanged(Some(meeting.id)));
        }
    }

    fn discard_local(&self, meeting_id: &MeetingId) {
        let (meetings, active_changed, active) = {
            let mut guard = lock(&self.state);
            guard.local.retain(|m| &m.id != meeting_id);
            let mut changed = false;
            if guard.active.as_ref() == Some(meeting_id) {
                guard.active = guard.remote.first().map(|m| m.id.clone());
                changed = true;
            }
            (guard.merged(), changed, guard.active.clone())
        };
        let _ = self.events.send(ClientEvent::MeetingsUpdated(meetings));
        if active_changed {
            let _ = self.events.send(ClientEvent::ActiveMeetingChanged(active));
        }
    }

    /// Drop our copy of a meeting after a confirmed leave/delete and
    /// move the active pointer off it, silently.
    fn remove_local_copy(&self, meeting_id: &MeetingId) {
        let (meetings, active_changed, active) = {
            let mut guard = lock(&self.state);
            guard.remote.retain(|m| &m.id != meeting_id);
            guard.local.retain(|m| &m.id != meeting_id);
            let mut changed = false;
            if guard.active.as_ref() == Some(meeting_id) {
                guard.active = guard.remote.first().map(|m| m.id.clone());
                changed = true;
            }
            (guard.merged(), changed, guard.active.clone())
        };
        let _ = self.events.send(ClientEvent::MeetingsUpdated(meetings));
        if active_changed {
            let _ = self.events.send(ClientEvent::ActiveMeetingChanged(active));
        }
    }
}

fn participant_from_profile(id: UserId, profile: &UserProfile, role: Role) -> Participant {
    Participant {
        id,
        nickname: Some(if profile.nickname.is_empty() {
            "Unknown".to_string()
        } else {
            profile.nickname.clone()
        }),
        avatar: Some(profile.avatar_or_initial()),
        role,
        lat: None,
        lng: None,
        address: None,
        status: None,
        joined_at: Some(Utc::now()),
    }
}
