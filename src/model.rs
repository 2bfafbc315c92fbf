use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Intersection with `other`, or `None` when they don't overlap.
    pub fn clip(&self, other: &Span) -> Option<Span> {
        self.overlaps(other)
            .then(|| Span::new(self.start.max(other.start), self.end.min(other.end)))
    }

    /// The UTC calendar day following the one containing `now`.
    pub fn next_day(now: Ms) -> Span {
        let start = (now.div_euclid(DAY_MS) + 1) * DAY_MS;
        Span::new(start, start + DAY_MS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings block their window on the resource.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    /// Informational only: every resource is single-occupancy per instant.
    pub capacity: u32,
    pub active: bool,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Set once a reminder has been delivered.
    pub reminded_at: Option<Ms>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// All bookings of one resource, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    pub bookings: Vec<Booking>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.is_active())
    }
}

/// The event types, flat with no nesting. This is the WAL record format
/// and what the notify hub broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
        capacity: u32,
        created_at: Ms,
    },
    ResourceDeactivated {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        resource_id: Ulid,
        user_id: Ulid,
        span: Span,
        notes: Option<String>,
        created_at: Ms,
    },
    BookingStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
    ReminderRecorded {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ResourceCreated { id, .. } | Event::ResourceDeactivated { id } => *id,
            Event::BookingCreated { resource_id, .. }
            | Event::BookingStatusChanged { resource_id, .. }
            | Event::ReminderRecorded { resource_id, .. } => *resource_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyEntry {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub user_id: Ulid,
}

/// Active bookings of a resource within a queried range, clipped to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyView {
    pub resource_id: Ulid,
    pub period: Span,
    pub bookings: Vec<OccupancyEntry>,
}

impl OccupancyView {
    pub fn from_bookings<'a>(
        resource_id: Ulid,
        period: Span,
        bookings: impl IntoIterator<Item = &'a Booking>,
    ) -> Self {
        let mut entries: Vec<OccupancyEntry> = bookings
            .into_iter()
            .filter(|b| b.is_active())
            .filter_map(|b| {
                b.span.clip(&period).map(|clipped| OccupancyEntry {
                    id: b.id,
                    start: clipped.start,
                    end: clipped.end,
                    status: b.status,
                    user_id: b.user_id,
                })
            })
            .collect();
        entries.sort_by_key(|e| e.start);
        Self {
            resource_id,
            period,
            bookings: entries,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingStats {
    pub total: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub cancelled: usize,
}

impl BookingStats {
    pub fn record(&mut self, status: BookingStatus) {
        self.total += 1;
        match status {
            BookingStatus::Pending => self.pending += 1,
            BookingStatus::Confirmed => self.confirmed += 1,
            BookingStatus::Cancelled => self.cancelled += 1,
        }
    }
}
