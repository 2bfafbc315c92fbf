use async_trait::async_trait;
use tracing::debug;

use crate::scheduler::{Task, TaskError, TaskRunner};

use super::conflict::now_ms;
use super::{BookingError, Engine};

#[async_trait]
impl TaskRunner for Engine {
    async fn run(&self, task: Task) -> Result<(), TaskError> {
        let now = now_ms();
        let result = match task {
            Task::AutoConfirm(id) => self.auto_confirm(id, now).await.map(drop),
            Task::SendConfirmation(id) => self.send_confirmation(id).await,
            Task::SendReminder(id) => self.send_reminder(id, now).await,
            Task::ExpirySweep => self.expire_stale_bookings(now).await.map(drop),
            Task::ReminderSweep => self.queue_reminders(now).await.map(drop),
            Task::Maintenance => self.repo.maintain().await.map_err(BookingError::from),
        };

        match result {
            Ok(()) => Ok(()),
            Err(BookingError::NotFound(id)) => {
                debug!(task = task.label(), %id, "target gone, nothing to do");
                Ok(())
            }
            Err(e) if e.is_transient() => Err(TaskError::Transient(e.to_string())),
            Err(e) => Err(TaskError::Permanent(e.to_string())),
        }
    }
}
