use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_window;
use super::{BookingError, Engine};

impl Engine {
    /// Occupancy of a resource over `[start, end)`, served from the
    /// calendar cache when possible.
    pub async fn get_calendar(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<OccupancyView, BookingError> {
        let range = validate_window(start, end)?;
        if range.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(BookingError::LimitExceeded("query window too wide"));
        }
        // Deactivated resources keep a readable calendar.
        self.repo.get_resource(resource_id).await?;
        Ok(self.cache.get_occupancy(resource_id, range).await?)
    }

    pub async fn check_availability(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<bool, BookingError> {
        self.is_available(resource_id, start, end, None).await
    }

    /// A booking as seen by `user_id`. Bookings of other users are reported
    /// as missing.
    pub async fn get_booking(&self, booking_id: Ulid, user_id: Ulid) -> Result<Booking, BookingError> {
        let booking = self.repo.get_booking(booking_id).await?;
        if booking.user_id != user_id {
            return Err(BookingError::NotFound(booking_id));
        }
        Ok(booking)
    }

    pub async fn user_bookings(&self, user_id: Ulid) -> Result<Vec<Booking>, BookingError> {
        Ok(self.repo.bookings_for_user(user_id).await?)
    }

    pub async fn list_bookings(&self, skip: usize, limit: usize) -> Result<Vec<Booking>, BookingError> {
        Ok(self
            .repo
            .list_bookings(skip, limit.min(MAX_PAGE_SIZE))
            .await?)
    }

    pub async fn stats(&self) -> Result<BookingStats, BookingError> {
        Ok(self.repo.stats().await?)
    }

    /// Resources currently accepting bookings.
    pub async fn list_resources(&self) -> Result<Vec<Resource>, BookingError> {
        let mut resources = self.repo.list_resources().await?;
        resources.retain(|r| r.active);
        Ok(resources)
    }
}
