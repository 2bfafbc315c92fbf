use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::info;
use ulid::Ulid;

use crate::model::{Booking, Event};

const CHANNEL_CAPACITY: usize = 256;

// ── Change feed ──────────────────────────────────────────────────

/// Broadcast hub of committed events, one channel per resource.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes on a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a committed event. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        if let Some(sender) = self.channels.get(&event.resource_id()) {
            let _ = sender.send(event.clone());
        }
    }
}

// ── Outbound notifications ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Confirmation,
    Reminder,
}

impl NoticeKind {
    pub fn label(self) -> &'static str {
        match self {
            NoticeKind::Confirmation => "confirmation",
            NoticeKind::Reminder => "reminder",
        }
    }
}

/// A notification could not be delivered. Reported, never escalated into
/// the booking lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError {
    pub booking_id: Ulid,
    pub reason: String,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery failed for booking {}: {}", self.booking_id, self.reason)
    }
}

impl std::error::Error for DeliveryError {}

/// Sends messages about bookings to their owners. The outcome is only
/// ever logged.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send_confirmation(&self, booking: &Booking) -> Result<(), DeliveryError>;

    async fn send_reminder(&self, booking: &Booking) -> Result<(), DeliveryError>;
}

/// Dispatcher that writes each notice to the log. Used when no mail
/// transport is wired in.
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn send_confirmation(&self, booking: &Booking) -> Result<(), DeliveryError> {
        info!(
            booking = %booking.id,
            user = %booking.user_id,
            resource = %booking.resource_id,
            start = booking.span.start,
            end = booking.span.end,
            "booking confirmed"
        );
        Ok(())
    }

    async fn send_reminder(&self, booking: &Booking) -> Result<(), DeliveryError> {
        info!(
            booking = %booking.id,
            user = %booking.user_id,
            resource = %booking.resource_id,
            start = booking.span.start,
            "upcoming booking reminder"
        );
        Ok(())
    }
}
