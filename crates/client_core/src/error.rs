use shared::{domain::MeetingId, error::StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid group code: {0}")]
    InvalidJoinCode(String),
    #[error("not signed in")]
    NotSignedIn,
    #[error("no active meeting")]
    NoActiveMeeting,
    #[error("meeting {0} exists only locally and cannot be written")]
    MeetingNotWritable(MeetingId),
    #[error("unknown meeting: {0}")]
    UnknownMeeting(MeetingId),
    #[error(transparent)]
    Store(#[from] StoreError),
}
