use std::time::Duration;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::lifecycle::Transition;
use crate::limits::*;
use crate::model::*;
use crate::notify::{DeliveryError, NoticeKind};
use crate::observability::{BOOKING_CONFLICTS_TOTAL, BOOKINGS_CREATED_TOTAL, NOTIFICATIONS_TOTAL};
use crate::repository::StatusChange;
use crate::scheduler::Task;

use super::conflict::{find_conflict, now_ms, validate_window};
use super::{BookingError, Engine};

fn duration_ms(d: Duration) -> Ms {
    d.as_millis() as Ms
}

impl Engine {
    pub async fn create_resource(
        &self,
        name: impl Into<String>,
        capacity: u32,
    ) -> Result<Resource, BookingError> {
        let name = name.into();
        if name.len() > MAX_NAME_LEN {
            return Err(BookingError::LimitExceeded("resource name too long"));
        }
        if capacity == 0 {
            return Err(BookingError::LimitExceeded("capacity must be at least 1"));
        }
        if self.repo.list_resources().await?.len() >= MAX_RESOURCES {
            return Err(BookingError::LimitExceeded("too many resources"));
        }

        let resource = self
            .repo
            .create_resource(Resource {
                id: Ulid::new(),
                name,
                capacity,
                active: true,
                created_at: now_ms(),
            })
            .await?;
        info!(resource = %resource.id, name = %resource.name, "resource created");
        Ok(resource)
    }

    /// Stop accepting bookings on a resource. Existing bookings keep their
    /// status.
    pub async fn deactivate_resource(&self, id: Ulid) -> Result<Resource, BookingError> {
        let resource = self.repo.deactivate_resource(id).await?;
        self.cache.invalidate(id).await;
        info!(resource = %id, "resource deactivated");
        Ok(resource)
    }

    pub async fn create_booking(
        &self,
        user_id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        notes: Option<String>,
    ) -> Result<Booking, BookingError> {
        self.create_booking_at(now_ms(), user_id, resource_id, start, end, notes)
            .await
    }

    pub(crate) async fn create_booking_at(
        &self,
        now: Ms,
        user_id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        notes: Option<String>,
    ) -> Result<Booking, BookingError> {
        let span = validate_window(start, end)?;
        if span.duration_ms() > MAX_SPAN_DURATION_MS {
            return Err(BookingError::LimitExceeded("booking too long"));
        }
        if notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(BookingError::LimitExceeded("notes too long"));
        }
        self.active_resource(resource_id).await?;

        // Fast rejection. The insert below re-checks under the store's
        // resource lock, which is what actually enforces the invariant.
        let existing = self.repo.find_active_bookings(resource_id, span).await?;
        if let Some(conflict) = find_conflict(&existing, &span, None) {
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(BookingError::Conflict(conflict));
        }

        let booking = Booking {
            id: Ulid::new(),
            resource_id,
            user_id,
            span,
            status: BookingStatus::Pending,
            notes,
            created_at: now,
            updated_at: now,
            reminded_at: None,
        };
        let booking = match self.repo.insert(booking).await {
            Ok(b) => b,
            Err(e) => {
                let e = BookingError::from(e);
                if matches!(e, BookingError::Conflict(_)) {
                    metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
                }
                return Err(e);
            }
        };

        self.cache.invalidate(resource_id).await;
        self.scheduler.schedule_once(
            Task::AutoConfirm(booking.id),
            self.lifecycle.auto_confirm_delay,
        );
        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            booking = %booking.id,
            resource = %resource_id,
            user = %user_id,
            start = span.start,
            end = span.end,
            "booking created"
        );
        Ok(booking)
    }

    /// Owner-initiated cancel. Cancelling an already cancelled booking
    /// succeeds without a change.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        requesting_user: Ulid,
    ) -> Result<Booking, BookingError> {
        let booking = self.repo.get_booking(booking_id).await?;
        if booking.user_id != requesting_user {
            warn!(booking = %booking_id, user = %requesting_user, "cancel by non-owner refused");
            return Err(BookingError::Unauthorized);
        }
        let change = self
            .apply_transition(booking_id, Transition::OwnerCancel, now_ms())
            .await?;
        Ok(change.booking)
    }

    /// Confirm a booking that is still pending. Queues the confirmation
    /// notice when the transition applies.
    pub async fn auto_confirm(&self, booking_id: Ulid, now: Ms) -> Result<StatusChange, BookingError> {
        let change = self
            .apply_transition(booking_id, Transition::AutoConfirm, now)
            .await?;
        if change.applied {
            self.scheduler
                .schedule_once(Task::SendConfirmation(booking_id), Duration::ZERO);
        }
        Ok(change)
    }

    /// Cancel every booking left pending longer than the expiry window.
    /// Returns how many were expired. Keeps going past individual failures
    /// and reports the first one afterwards.
    pub async fn expire_stale_bookings(&self, now: Ms) -> Result<usize, BookingError> {
        let cutoff = now - duration_ms(self.lifecycle.pending_expiry);
        let stale = self.repo.find_pending_created_before(cutoff).await?;

        let mut expired = 0;
        let mut first_error = None;
        for booking in stale {
            match self.apply_transition(booking.id, Transition::Expire, now).await {
                Ok(change) if change.applied => expired += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(booking = %booking.id, "expiry failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if expired > 0 {
            info!(expired, "expired stale pending bookings");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(expired),
        }
    }

    /// Queue a reminder for every confirmed booking starting during the UTC
    /// day after `now` that hasn't had one yet.
    pub async fn queue_reminders(&self, now: Ms) -> Result<usize, BookingError> {
        let tomorrow = Span::next_day(now);
        let due = self.repo.find_confirmed_starting_within(tomorrow).await?;
        for booking in &due {
            self.scheduler
                .schedule_once(Task::SendReminder(booking.id), Duration::ZERO);
        }
        debug!(queued = due.len(), "reminders queued");
        Ok(due.len())
    }

    /// Deliver one reminder and mark it sent. A failed delivery leaves the
    /// booking untouched so the next sweep tries again.
    pub async fn send_reminder(&self, booking_id: Ulid, now: Ms) -> Result<(), BookingError> {
        let booking = self.repo.get_booking(booking_id).await?;
        if booking.status != BookingStatus::Confirmed || booking.reminded_at.is_some() {
            debug!(booking = %booking_id, status = %booking.status, "reminder skipped");
            return Ok(());
        }
        let result = self.dispatcher.send_reminder(&booking).await;
        if record_delivery(NoticeKind::Reminder, result) {
            self.repo.record_reminder(booking_id, now).await?;
        }
        Ok(())
    }

    pub async fn send_confirmation(&self, booking_id: Ulid) -> Result<(), BookingError> {
        let booking = self.repo.get_booking(booking_id).await?;
        if booking.status != BookingStatus::Confirmed {
            debug!(booking = %booking_id, status = %booking.status, "confirmation skipped");
            return Ok(());
        }
        let result = self.dispatcher.send_confirmation(&booking).await;
        record_delivery(NoticeKind::Confirmation, result);
        Ok(())
    }
}

/// Log and count a delivery outcome. Returns whether it went out.
fn record_delivery(kind: NoticeKind, result: Result<(), DeliveryError>) -> bool {
    match result {
        Ok(()) => {
            metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind.label(), "status" => "sent")
                .increment(1);
            true
        }
        Err(e) => {
            warn!(kind = kind.label(), "{e}");
            metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind.label(), "status" => "failed")
                .increment(1);
            false
        }
    }
}
