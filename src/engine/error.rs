use ulid::Ulid;

use crate::repository::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Resource or booking absent (or resource deactivated).
    NotFound(Ulid),
    /// Window overlaps this active booking.
    Conflict(Ulid),
    /// `end <= start`.
    InvalidWindow,
    /// Cancel attempted by someone other than the owner.
    Unauthorized,
    /// Retryable storage failure.
    TransientStoreFailure(String),
    LimitExceeded(&'static str),
}

impl BookingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BookingError::TransientStoreFailure(_))
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::NotFound(id) => write!(f, "not found: {id}"),
            BookingError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            BookingError::InvalidWindow => write!(f, "invalid window: end must be after start"),
            BookingError::Unauthorized => write!(f, "not the owner of this booking"),
            BookingError::TransientStoreFailure(e) => write!(f, "storage unavailable: {e}"),
            BookingError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BookingError::NotFound(id),
            StoreError::Conflict(id) => BookingError::Conflict(id),
            StoreError::Io(msg) => BookingError::TransientStoreFailure(msg),
        }
    }
}
