//! Friend roster derivation.
//!
//! Pure projection of the active meeting's participant list: self is
//! excluded, blocked participants keep their identity but lose their
//! location and are shown as blocked. Recomputed whenever the active
//! meeting, current user, or block list changes.

use std::collections::BTreeSet;

use shared::{
    domain::{Friend, Meeting, Participant, ParticipantStatus, UserId},
    ids,
};

pub fn derive_friends(
    meeting: Option<&Meeting>,
    current_user: Option<&UserId>,
    blocked: &BTreeSet<String>,
) -> Vec<Friend> {
    let Some(meeting) = meeting else {
        return Vec::new();
    };
    let current = current_user.map(UserId::as_str);

    meeting
        .participants
        .iter()
        .filter(|p| !ids::is_self(p.id.as_str(), current))
        .map(|p| project_participant(p, blocked))
        .collect()
}

pub fn is_id_blocked(id: &str, blocked: &BTreeSet<String>) -> bool {
    let normalized = ids::normalize_id(id);
    blocked.contains(&normalized) || blocked.iter().any(|b| ids::id_forms_match(b, &normalized))
}

fn project_participant(participant: &Participant, blocked: &BTreeSet<String>) -> Friend {
    let is_blocked = is_id_blocked(participant.id.as_str(), blocked);

    let nickname = participant
        .nickname
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());
    let avatar = participant
        .avatar
        .clone()
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| {
            nickname
                .chars()
                .next()
                .map(|c| c.to_uppercase().to_string())
                .unwrap_or_else(|| "?".to_string())
        });

    if is_blocked {
        // Blocking hides the location, not the person.
        return Friend {
            id: participant.id.clone(),
            nickname,
            avatar,
            role: participant.role,
            lat: None,
            lng: None,
            address: None,
            status: ParticipantStatus::Blocked,
            is_blocked: true,
        };
    }

    Friend {
        id: participant.id.clone(),
        nickname,
        avatar,
        role: participant.role,
        lat: participant.lat,
        lng: participant.lng,
        address: participant.address.clone(),
        status: participant.status.unwrap_or(ParticipantStatus::Online),
        is_blocked: false,
    }
}
