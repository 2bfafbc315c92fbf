//! Legal status transitions of a booking.
//!
//! ```text
//! pending ──auto-confirm──▶ confirmed
//!    │                          │
//!    ├──owner cancel──┐         │
//!    └──expire────────┴──▶ cancelled ◀──owner cancel──┘
//! ```
//!
//! The table here is pure. Stores apply a transition as a compare-and-set:
//! the status is read and written under the same resource lock, so when
//! auto-confirm and expiry race only the first one to observe `pending`
//! changes anything.

use crate::model::BookingStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Scheduler one-shot fired after the confirmation delay.
    AutoConfirm,
    /// Owner withdrew the booking.
    OwnerCancel,
    /// Expiry sweep found the booking pending for too long.
    Expire,
}

impl Transition {
    /// Statuses this transition may fire from.
    pub fn sources(self) -> &'static [BookingStatus] {
        match self {
            Transition::AutoConfirm | Transition::Expire => &[BookingStatus::Pending],
            Transition::OwnerCancel => &[BookingStatus::Pending, BookingStatus::Confirmed],
        }
    }

    pub fn target(self) -> BookingStatus {
        match self {
            Transition::AutoConfirm => BookingStatus::Confirmed,
            Transition::OwnerCancel | Transition::Expire => BookingStatus::Cancelled,
        }
    }

    /// New status when firing from `current`, `None` for a guarded no-op.
    pub fn apply(self, current: BookingStatus) -> Option<BookingStatus> {
        self.sources().contains(&current).then(|| self.target())
    }

    pub fn label(self) -> &'static str {
        match self {
            Transition::AutoConfirm => "auto_confirm",
            Transition::OwnerCancel => "owner_cancel",
            Transition::Expire => "expire",
        }
    }
}
