use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid interval [{start}, {end}): start must be before end")]
    InvalidInterval { start: Ms, end: Ms },
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    #[error("version mismatch on {id}: expected {expected}, found {actual}")]
    VersionMismatch { id: Ulid, expected: u64, actual: u64 },
    /// Optimistic retries exhausted; safe for the caller to retry later.
    #[error("booking {0} is being modified concurrently, retry later")]
    Contended(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("duplicate id: {0}")]
    DuplicateId(Ulid),
    #[error("room is inactive: {0}")]
    RoomInactive(Ulid),
    #[error("booking already cancelled: {0}")]
    AlreadyCancelled(Ulid),
    #[error("booking {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("timed out waiting for room lock: {0}")]
    LockTimeout(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::Conflict(_) => "conflict",
            EngineError::VersionMismatch { .. } => "version_mismatch",
            EngineError::Contended(_) => "contended",
            EngineError::NotFound(_) => "not_found",
            EngineError::DuplicateId(_) => "duplicate_id",
            EngineError::RoomInactive(_) => "room_inactive",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LockTimeout(_) => "lock_timeout",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage_error",
        }
    }

    /// Transient failures the caller may retry unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Contended(_) | EngineError::LockTimeout(_) | EngineError::WalError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_blocking_booking() {
        let id = Ulid::new();
        let msg = EngineError::Conflict(id).to_string();
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn transient_classification() {
        assert!(EngineError::Contended(Ulid::new()).is_transient());
        assert!(EngineError::LockTimeout(Ulid::new()).is_transient());
        assert!(!EngineError::Conflict(Ulid::new()).is_transient());
        assert!(!EngineError::InvalidInterval { start: 2, end: 1 }.is_transient());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::Conflict(Ulid::new()).code(), "conflict");
        assert_eq!(EngineError::RoomInactive(Ulid::new()).code(), "room_inactive");
        assert_eq!(EngineError::WalError("x".into()).code(), "storage_error");
    }
}
