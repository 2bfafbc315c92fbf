//! Durable `Repository`: per-resource in-memory state behind async
//! `RwLock`s, made durable by the write-ahead log.
//!
//! Every mutation takes the write lock of the affected resource, validates
//! against the current state, appends the event to the WAL and only then
//! applies it. The lock is the store's transaction: a second insert on the
//! same resource can't interleave between the overlap check and the append.

mod writer;

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::engine::find_conflict;
use crate::lifecycle::Transition;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::repository::{Repository, StatusChange, StoreError};
use crate::wal::Wal;

use writer::{WalCommand, wal_writer_loop};

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

pub struct WalStore {
    resources: DashMap<Ulid, SharedResourceState>,
    /// Reverse lookup: booking id → resource id.
    booking_index: DashMap<Ulid, Ulid>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
    compact_threshold: u64,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot it writes can't miss a concurrent append.
    snapshot_gate: RwLock<()>,
}

/// Apply an event to a resource's state (caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ResourceDeactivated { .. } => rs.resource.active = false,
        Event::BookingCreated {
            id,
            resource_id,
            user_id,
            span,
            notes,
            created_at,
        } => {
            rs.insert_booking(Booking {
                id: *id,
                resource_id: *resource_id,
                user_id: *user_id,
                span: *span,
                status: BookingStatus::Pending,
                notes: notes.clone(),
                created_at: *created_at,
                updated_at: *created_at,
                reminded_at: None,
            });
            index.insert(*id, *resource_id);
        }
        Event::BookingStatusChanged { id, status, at, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = *status;
                b.updated_at = *at;
            }
        }
        Event::ReminderRecorded { id, at, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.reminded_at = Some(*at);
            }
        }
        // Creation is handled at the DashMap level.
        Event::ResourceCreated { .. } => {}
    }
}

fn io_err(e: io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

impl WalStore {
    /// Replay the WAL at `path` and start its writer task. Must be called
    /// from within a tokio runtime.
    pub fn open(path: &Path, notify: Arc<NotifyHub>, compact_threshold: u64) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            resources: DashMap::new(),
            booking_index: DashMap::new(),
            wal_tx,
            notify,
            compact_threshold,
            snapshot_gate: RwLock::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never block here: this may run inside an async context.
        for event in &events {
            match event {
                Event::ResourceCreated {
                    id,
                    name,
                    capacity,
                    created_at,
                } => {
                    let rs = ResourceState::new(Resource {
                        id: *id,
                        name: name.clone(),
                        capacity: *capacity,
                        active: true,
                        created_at: *created_at,
                    });
                    store.resources.insert(*id, Arc::new(RwLock::new(rs)));
                }
                other => {
                    if let Some(rs) = store.state(&other.resource_id())
                        && let Ok(mut guard) = rs.try_write()
                    {
                        apply_to_resource(&mut guard, other, &store.booking_index);
                    }
                }
            }
        }

        info!(
            path = %path.display(),
            events = events.len(),
            resources = store.resources.len(),
            bookings = store.booking_index.len(),
            "store replayed"
        );
        Ok(store)
    }

    fn state(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of all resource handles. Never await while iterating the
    /// DashMap itself: its shard guards are not held across suspension.
    fn all_states(&self) -> Vec<SharedResourceState> {
        self.resources.iter().map(|e| e.value().clone()).collect()
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(io_err)
    }

    /// WAL-append + apply + notify.
    async fn commit(&self, rs: &mut ResourceState, event: &Event) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.booking_index);
        self.notify.send(event);
        Ok(())
    }

    async fn resource_write(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, StoreError> {
        let rs = self.state(&id).ok_or(StoreError::NotFound(id))?;
        Ok(rs.write_owned().await)
    }

    /// Lookup booking → resource and acquire that resource's write lock.
    async fn booking_write(
        &self,
        booking_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, StoreError> {
        let resource_id = self
            .booking_index
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(booking_id))?;
        self.resource_write(resource_id).await
    }

    /// Every booking matching `keep`, across all resources, in id order.
    async fn scan(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let mut found = Vec::new();
        for rs in self.all_states() {
            let guard = rs.read().await;
            found.extend(guard.bookings.iter().filter(|b| keep(b)).cloned());
        }
        found.sort_by_key(|b| b.id);
        found
    }

    pub async fn appends_since_compact(&self) -> Result<u64, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.snapshot_gate.write().await;

        let mut states = self.all_states();
        let mut snapshots = Vec::with_capacity(states.len());
        for rs in states.drain(..) {
            snapshots.push(rs.read().await.clone());
        }
        snapshots.sort_by_key(|rs| rs.resource.id);

        let mut events = Vec::new();
        for rs in &snapshots {
            let r = &rs.resource;
            events.push(Event::ResourceCreated {
                id: r.id,
                name: r.name.clone(),
                capacity: r.capacity,
                created_at: r.created_at,
            });
            if !r.active {
                events.push(Event::ResourceDeactivated { id: r.id });
            }
            for b in &rs.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    resource_id: b.resource_id,
                    user_id: b.user_id,
                    span: b.span,
                    notes: b.notes.clone(),
                    created_at: b.created_at,
                });
                if b.status != BookingStatus::Pending {
                    events.push(Event::BookingStatusChanged {
                        id: b.id,
                        resource_id: b.resource_id,
                        status: b.status,
                        at: b.updated_at,
                    });
                }
                if let Some(at) = b.reminded_at {
                    events.push(Event::ReminderRecorded {
                        id: b.id,
                        resource_id: b.resource_id,
                        at,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Rewrite {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(io_err)?;
        info!(events = count, "WAL compacted");
        Ok(())
    }
}

#[async_trait]
impl Repository for WalStore {
    async fn create_resource(&self, resource: Resource) -> Result<Resource, StoreError> {
        let _gate = self.snapshot_gate.read().await;
        if self.resources.contains_key(&resource.id) {
            return Err(StoreError::Conflict(resource.id));
        }
        let event = Event::ResourceCreated {
            id: resource.id,
            name: resource.name.clone(),
            capacity: resource.capacity,
            created_at: resource.created_at,
        };
        self.wal_append(&event).await?;
        let created = Resource {
            active: true,
            ..resource
        };
        self.resources.insert(
            created.id,
            Arc::new(RwLock::new(ResourceState::new(created.clone()))),
        );
        self.notify.send(&event);
        Ok(created)
    }

    async fn deactivate_resource(&self, id: Ulid) -> Result<Resource, StoreError> {
        let _gate = self.snapshot_gate.read().await;
        let mut guard = self.resource_write(id).await?;
        if guard.resource.active {
            self.commit(&mut guard, &Event::ResourceDeactivated { id })
                .await?;
        }
        Ok(guard.resource.clone())
    }

    async fn get_resource(&self, id: Ulid) -> Result<Resource, StoreError> {
        let rs = self.state(&id).ok_or(StoreError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.resource.clone())
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, StoreError> {
        let mut out = Vec::new();
        for rs in self.all_states() {
            out.push(rs.read().await.resource.clone());
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn get_booking(&self, id: Ulid) -> Result<Booking, StoreError> {
        let resource_id = self
            .booking_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        let rs = self
            .state(&resource_id)
            .ok_or(StoreError::NotFound(resource_id))?;
        let guard = rs.read().await;
        guard.booking(id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn find_active_bookings(
        &self,
        resource_id: Ulid,
        window: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        let rs = self
            .state(&resource_id)
            .ok_or(StoreError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.active_overlapping(&window).cloned().collect())
    }

    async fn insert(&self, booking: Booking) -> Result<Booking, StoreError> {
        let _gate = self.snapshot_gate.read().await;
        let mut guard = self.resource_write(booking.resource_id).await?;
        if !guard.resource.active {
            return Err(StoreError::NotFound(booking.resource_id));
        }
        if let Some(existing) = find_conflict(guard.active_overlapping(&booking.span), &booking.span, None)
        {
            return Err(StoreError::Conflict(existing));
        }

        let event = Event::BookingCreated {
            id: booking.id,
            resource_id: booking.resource_id,
            user_id: booking.user_id,
            span: booking.span,
            notes: booking.notes,
            created_at: booking.created_at,
        };
        self.commit(&mut guard, &event).await?;
        guard
            .booking(booking.id)
            .cloned()
            .ok_or(StoreError::NotFound(booking.id))
    }

    async fn update_status(
        &self,
        booking_id: Ulid,
        transition: Transition,
        at: Ms,
    ) -> Result<StatusChange, StoreError> {
        let _gate = self.snapshot_gate.read().await;
        let mut guard = self.booking_write(booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(StoreError::NotFound(booking_id))?;

        let Some(status) = transition.apply(current.status) else {
            return Ok(StatusChange {
                booking: current,
                applied: false,
            });
        };

        let event = Event::BookingStatusChanged {
            id: booking_id,
            resource_id: current.resource_id,
            status,
            at,
        };
        self.commit(&mut guard, &event).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(StoreError::NotFound(booking_id))?;
        Ok(StatusChange {
            booking,
            applied: true,
        })
    }

    async fn record_reminder(&self, booking_id: Ulid, at: Ms) -> Result<bool, StoreError> {
        let _gate = self.snapshot_gate.read().await;
        let mut guard = self.booking_write(booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .ok_or(StoreError::NotFound(booking_id))?;
        if booking.reminded_at.is_some() {
            return Ok(false);
        }
        let event = Event::ReminderRecorded {
            id: booking_id,
            resource_id: booking.resource_id,
            at,
        };
        self.commit(&mut guard, &event).await?;
        Ok(true)
    }

    async fn find_pending_created_before(&self, cutoff: Ms) -> Result<Vec<Booking>, StoreError> {
        Ok(self
            .scan(|b| b.status == BookingStatus::Pending && b.created_at < cutoff)
            .await)
    }

    async fn find_confirmed_starting_within(
        &self,
        window: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self
            .scan(|b| {
                b.status == BookingStatus::Confirmed
                    && b.reminded_at.is_none()
                    && window.contains_instant(b.span.start)
            })
            .await)
    }

    async fn bookings_for_user(&self, user_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        Ok(self.scan(|b| b.user_id == user_id).await)
    }

    async fn list_bookings(&self, skip: usize, limit: usize) -> Result<Vec<Booking>, StoreError> {
        let all = self.scan(|_| true).await;
        Ok(all.into_iter().skip(skip).take(limit).collect())
    }

    async fn stats(&self) -> Result<BookingStats, StoreError> {
        let mut stats = BookingStats::default();
        for rs in self.all_states() {
            let guard = rs.read().await;
            for b in &guard.bookings {
                stats.record(b.status);
            }
        }
        Ok(stats)
    }

    async fn maintain(&self) -> Result<(), StoreError> {
        if self.appends_since_compact().await? >= self.compact_threshold {
            self.compact().await?;
        }
        Ok(())
    }
}
