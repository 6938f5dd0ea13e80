//! Identity normalization and id generation.
//!
//! Every identity comparison in the workspace goes through
//! [`normalize_id`] / [`is_self`] so that the guest-flow `"me"` alias
//! and real backend uids compare consistently.

use rand::Rng;
use uuid::Uuid;

use crate::domain::MeetingId;

/// Literal self-referent used by guest flows before a real uid exists.
pub const SELF_ALIAS: &str = "me";

/// Prefix marking a locally-fabricated meeting id that was never
/// persisted remotely.
pub const LOCAL_MEETING_PREFIX: &str = "local-";

pub const GROUP_CODE_LEN: usize = 6;

const GROUP_CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn normalize_id(raw: &str) -> String {
    raw.trim().to_string()
}

/// The single self-equality predicate: a normalized id is "self" if it
/// matches the current user's id or the literal alias.
pub fn is_self(id: &str, current_user_id: Option<&str>) -> bool {
    let normalized = normalize_id(id);
    if normalized == SELF_ALIAS {
        return true;
    }
    match current_user_id {
        Some(current) => normalize_id(current) == normalized,
        None => false,
    }
}

/// Loose match for block-list entries that may have been stored with
/// inconsistent casing over time.
pub fn id_forms_match(a: &str, b: &str) -> bool {
    normalize_id(a).eq_ignore_ascii_case(&normalize_id(b))
}

pub fn local_meeting_id() -> MeetingId {
    MeetingId::new(format!("{LOCAL_MEETING_PREFIX}{}", Uuid::new_v4().simple()))
}

impl MeetingId {
    pub fn is_placeholder(&self) -> bool {
        self.as_str().starts_with(LOCAL_MEETING_PREFIX)
    }
}

/// Correlation token carried by an optimistic message through the
/// store and back.
pub fn client_msg_id() -> String {
    format!("client-{}", Uuid::new_v4())
}

pub fn generate_group_code() -> String {
    let mut rng = rand::thread_rng();
    (0..GROUP_CODE_LEN)
        .map(|_| GROUP_CODE_CHARS[rng.gen_range(0..GROUP_CODE_CHARS.len())] as char)
        .collect()
}

/// Join codes are compared case-insensitively; stored form is upper.
pub fn normalize_group_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}
