//! What the booking core needs from durable storage.
//!
//! The store is the single source of truth. `insert` must be a
//! conflict-detecting write: it re-evaluates overlap against the active
//! bookings of the resource inside the same transaction that persists the
//! new booking. `update_status` is a compare-and-set on the current status.

use async_trait::async_trait;
use ulid::Ulid;

use crate::lifecycle::Transition;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(Ulid),
    /// Overlaps the given active booking.
    Conflict(Ulid),
    /// Retryable I/O failure.
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            StoreError::Io(e) => write!(f, "store I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result of applying a transition through a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub booking: Booking,
    /// False when the guard turned the transition into a no-op.
    pub applied: bool,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_resource(&self, resource: Resource) -> Result<Resource, StoreError>;

    async fn deactivate_resource(&self, id: Ulid) -> Result<Resource, StoreError>;

    async fn get_resource(&self, id: Ulid) -> Result<Resource, StoreError>;

    async fn list_resources(&self) -> Result<Vec<Resource>, StoreError>;

    async fn get_booking(&self, id: Ulid) -> Result<Booking, StoreError>;

    /// Pending or confirmed bookings on the resource overlapping `window`.
    async fn find_active_bookings(
        &self,
        resource_id: Ulid,
        window: Span,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn insert(&self, booking: Booking) -> Result<Booking, StoreError>;

    async fn update_status(
        &self,
        booking_id: Ulid,
        transition: Transition,
        at: Ms,
    ) -> Result<StatusChange, StoreError>;

    /// Mark a reminder as delivered. Returns false if one was already recorded.
    async fn record_reminder(&self, booking_id: Ulid, at: Ms) -> Result<bool, StoreError>;

    async fn find_pending_created_before(&self, cutoff: Ms) -> Result<Vec<Booking>, StoreError>;

    /// Confirmed bookings without a recorded reminder starting inside `window`.
    async fn find_confirmed_starting_within(
        &self,
        window: Span,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn bookings_for_user(&self, user_id: Ulid) -> Result<Vec<Booking>, StoreError>;

    /// All bookings ordered by id (creation order).
    async fn list_bookings(&self, skip: usize, limit: usize) -> Result<Vec<Booking>, StoreError>;

    async fn stats(&self) -> Result<BookingStats, StoreError>;

    /// Periodic housekeeping (log compaction and the like).
    async fn maintain(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
