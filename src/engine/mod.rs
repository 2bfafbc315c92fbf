mod conflict;
mod error;
mod mutations;
mod queries;
mod tasks;

pub use conflict::find_conflict;
pub use error::BookingError;

use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::cache::CalendarCache;
use crate::config::LifecycleConfig;
use crate::lifecycle::Transition;
use crate::model::*;
use crate::notify::NotificationDispatcher;
use crate::observability::TRANSITIONS_TOTAL;
use crate::repository::{Repository, StatusChange};
use crate::scheduler::Scheduler;

/// Booking core: conflict checking, the status lifecycle and calendar
/// reads. Holds no locks of its own; every write serializes in the
/// repository.
pub struct Engine {
    pub(super) repo: Arc<dyn Repository>,
    pub(super) cache: CalendarCache,
    pub(super) dispatcher: Arc<dyn NotificationDispatcher>,
    pub(super) scheduler: Scheduler,
    pub(super) lifecycle: LifecycleConfig,
}

impl Engine {
    pub fn new(
        repo: Arc<dyn Repository>,
        cache: CalendarCache,
        dispatcher: Arc<dyn NotificationDispatcher>,
        scheduler: Scheduler,
        lifecycle: LifecycleConfig,
    ) -> Self {
        Self {
            repo,
            cache,
            dispatcher,
            scheduler,
            lifecycle,
        }
    }

    /// The resource, if it exists and still accepts bookings.
    async fn active_resource(&self, id: Ulid) -> Result<Resource, BookingError> {
        let resource = self.repo.get_resource(id).await?;
        if !resource.active {
            return Err(BookingError::NotFound(id));
        }
        Ok(resource)
    }

    /// Run a transition through the repository's compare-and-set. A guard
    /// miss is not an error; check `applied`.
    async fn apply_transition(
        &self,
        booking_id: Ulid,
        transition: Transition,
        at: Ms,
    ) -> Result<StatusChange, BookingError> {
        let change = self.repo.update_status(booking_id, transition, at).await?;
        let outcome = if change.applied { "applied" } else { "noop" };
        metrics::counter!(
            TRANSITIONS_TOTAL,
            "transition" => transition.label(),
            "outcome" => outcome
        )
        .increment(1);

        if change.applied {
            self.cache.invalidate(change.booking.resource_id).await;
            info!(
                booking = %booking_id,
                transition = transition.label(),
                status = %change.booking.status,
                "booking status changed"
            );
        } else {
            debug!(
                booking = %booking_id,
                transition = transition.label(),
                status = %change.booking.status,
                "transition skipped"
            );
        }
        Ok(change)
    }
}
