use ulid::Ulid;

use crate::model::*;

use super::{Engine, BookingError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Check window ordering and bounds, producing the half-open span.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, BookingError> {
    use crate::limits::*;
    if end <= start {
        return Err(BookingError::InvalidWindow);
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(BookingError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

/// First active booking overlapping `span`, ignoring `exclude`.
///
/// Pure: callers supply the bookings. Both the availability check and the
/// store's conflict-detecting insert run this same predicate.
pub fn find_conflict<'a>(
    bookings: impl IntoIterator<Item = &'a Booking>,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    bookings
        .into_iter()
        .filter(|b| b.is_active() && Some(b.id) != exclude)
        .find(|b| b.span.overlaps(span))
        .map(|b| b.id)
}

impl Engine {
    /// Whether `[start, end)` is free on the resource, ignoring
    /// `exclude_booking` (for re-validating an existing booking's own window).
    ///
    /// Reads the repository directly; the calendar cache is never consulted.
    pub async fn is_available(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_booking: Option<Ulid>,
    ) -> Result<bool, BookingError> {
        let span = validate_window(start, end)?;
        self.active_resource(resource_id).await?;
        let bookings = self.repo.find_active_bookings(resource_id, span).await?;
        Ok(find_conflict(&bookings, &span, exclude_booking).is_none())
    }
}
