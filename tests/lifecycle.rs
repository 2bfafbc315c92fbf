//! End-to-end booking lifecycle: engine, scheduler worker and durable store
//! wired together the way `main` does, on a paused clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::TryRecvError;
use ulid::Ulid;

use reserva::cache::{CalendarCache, MemoryBackend};
use reserva::config::{LifecycleConfig, SchedulerConfig, SweepConfig};
use reserva::engine::Engine;
use reserva::model::*;
use reserva::notify::{DeliveryError, NotificationDispatcher, NotifyHub};
use reserva::repository::Repository;
use reserva::scheduler::Scheduler;
use reserva::store::WalStore;

#[derive(Default)]
struct Outbox {
    confirmations: Mutex<Vec<Ulid>>,
    reminders: Mutex<Vec<Ulid>>,
}

impl Outbox {
    fn confirmations(&self) -> Vec<Ulid> {
        self.confirmations.lock().unwrap().clone()
    }

    fn reminders(&self) -> Vec<Ulid> {
        self.reminders.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationDispatcher for Outbox {
    async fn send_confirmation(&self, booking: &Booking) -> Result<(), DeliveryError> {
        self.confirmations.lock().unwrap().push(booking.id);
        Ok(())
    }

    async fn send_reminder(&self, booking: &Booking) -> Result<(), DeliveryError> {
        self.reminders.lock().unwrap().push(booking.id);
        Ok(())
    }
}

struct App {
    engine: Arc<Engine>,
    scheduler: Scheduler,
    outbox: Arc<Outbox>,
    notify: Arc<NotifyHub>,
}

fn start(sweeps: Option<SweepConfig>) -> App {
    let dir = std::env::temp_dir().join(format!("reserva_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let notify = Arc::new(NotifyHub::new());
    let store: Arc<dyn Repository> =
        Arc::new(WalStore::open(&dir.join("reserva.wal"), notify.clone(), 1000).unwrap());
    let cache = CalendarCache::new(store.clone(), Arc::new(MemoryBackend::new()), Duration::from_secs(300));
    let outbox = Arc::new(Outbox::default());
    let (scheduler, worker) = Scheduler::new(SchedulerConfig::default());
    let engine = Arc::new(Engine::new(
        store,
        cache,
        outbox.clone(),
        scheduler.clone(),
        LifecycleConfig::default(),
    ));
    worker.spawn(engine.clone());
    if let Some(sweeps) = sweeps {
        scheduler.schedule_sweeps(&sweeps);
    }
    App {
        engine,
        scheduler,
        outbox,
        notify,
    }
}

fn wall_clock_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// 10:00–11:00 UTC on the day after today.
fn tomorrow_morning() -> (Ms, Ms) {
    let day = Span::next_day(wall_clock_ms());
    (day.start + 10 * HOUR_MS, day.start + 11 * HOUR_MS)
}

#[tokio::test(start_paused = true)]
async fn pending_booking_is_confirmed_after_a_minute() {
    let app = start(None);
    let rid = app.engine.create_resource("Room", 1).await.unwrap().id;
    let mut feed = app.notify.subscribe(rid);
    let user = Ulid::new();
    let (start, end) = tomorrow_morning();

    let b = app.engine.create_booking(user, rid, start, end, None).await.unwrap();
    assert_eq!(b.status, BookingStatus::Pending);

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(app.engine.get_booking(b.id, user).await.unwrap().status, BookingStatus::Pending);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(app.engine.get_booking(b.id, user).await.unwrap().status, BookingStatus::Confirmed);
    assert_eq!(app.outbox.confirmations(), vec![b.id]);

    // The calendar shows the confirmation too.
    let view = app.engine.get_calendar(rid, start, end).await.unwrap();
    assert_eq!(view.bookings[0].status, BookingStatus::Confirmed);

    assert!(matches!(feed.recv().await.unwrap(), Event::BookingCreated { id, .. } if id == b.id));
    assert!(matches!(
        feed.recv().await.unwrap(),
        Event::BookingStatusChanged { status: BookingStatus::Confirmed, .. }
    ));
    assert!(matches!(feed.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn cancelled_booking_is_not_confirmed_later() {
    let app = start(None);
    let rid = app.engine.create_resource("Room", 1).await.unwrap().id;
    let user = Ulid::new();
    let (start, end) = tomorrow_morning();

    let b = app.engine.create_booking(user, rid, start, end, None).await.unwrap();
    app.engine.cancel_booking(b.id, user).await.unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(app.engine.get_booking(b.id, user).await.unwrap().status, BookingStatus::Cancelled);
    assert!(app.outbox.confirmations().is_empty());
    assert!(app.engine.check_availability(rid, start, end).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn reminder_sweep_notifies_once() {
    let app = start(Some(SweepConfig {
        expiry_period: Duration::from_secs(300),
        reminder_period: Duration::from_secs(120),
        maintenance_period: Duration::from_secs(60),
    }));
    let rid = app.engine.create_resource("Room", 1).await.unwrap().id;
    let (start, end) = tomorrow_morning();
    let b = app
        .engine
        .create_booking(Ulid::new(), rid, start, end, None)
        .await
        .unwrap();

    // Confirmed at 60s; the sweep at 120s picks it up.
    tokio::time::sleep(Duration::from_secs(130)).await;
    assert_eq!(app.outbox.reminders(), vec![b.id]);

    // Later sweeps leave it alone.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(app.outbox.reminders(), vec![b.id]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_deferred_work() {
    let app = start(None);
    let rid = app.engine.create_resource("Room", 1).await.unwrap().id;
    let user = Ulid::new();
    let (start, end) = tomorrow_morning();
    let b = app.engine.create_booking(user, rid, start, end, None).await.unwrap();

    app.scheduler.shutdown();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(app.engine.get_booking(b.id, user).await.unwrap().status, BookingStatus::Pending);
}
