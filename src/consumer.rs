//! Poll-driven consumption.
//!
//! [`consume`] is the scheduler: it wakes on a fixed interval and runs a task.
//! [`Handler`] is the seam where application code performs the downstream
//! effect of a message; see [`crate::service::Outbox::process_pending`].

use std::{future::Future, time::Duration};

use futures_util::future::BoxFuture;
use sqlx::SqliteConnection;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{error::Error, message::Message};

/// Runs `task` once per `interval` until `shutdown` is cancelled.
///
/// The first run happens after one full interval. The task is awaited before
/// the next tick is considered, so runs never overlap; ticks that elapse while
/// a run is still going are skipped. A failing run is logged and the loop
/// carries on. Cancellation is observed between runs.
///
/// # Errors
/// Returns [`Error::Precondition`] if `interval` is zero.
pub async fn consume<F, Fut>(
    mut task: F,
    interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = eyre::Result<()>>,
{
    if interval.is_zero() {
        return Err(Error::precondition("poll interval must be positive"));
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("Consumer stopped");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        if let Err(e) = task().await {
            tracing::warn!("Consumer task failed: {e:#}");
        }
    }
}

/// Performs the downstream effect of one outbox message.
///
/// `conn` belongs to the transaction that will also retire the message, so
/// anything written through it commits or rolls back together with the
/// retirement. Returning an error rolls both back and leaves the message
/// pending for the next poll.
pub trait Handler<T>: Send + Sync {
    fn handle<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        message: &'a T,
    ) -> BoxFuture<'a, eyre::Result<()>>;
}

/// A handler that only logs the messages it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl<T> Handler<T> for LogHandler
where
    T: AsRef<Message> + Sync,
{
    fn handle<'a>(
        &'a self,
        _conn: &'a mut SqliteConnection,
        message: &'a T,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(async move {
            let message = message.as_ref();
            tracing::info!(
                message_id = %message.message_id,
                try_times = message.try_times,
                "Delivered message"
            );
            Ok(())
        })
    }
}

/// Outcome of one [`crate::service::Outbox::process_pending`] run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// Messages whose effect and retirement committed
    pub delivered: usize,
    /// Messages left pending because delivery or commit failed
    pub failed: usize,
    /// Rows that could not be decoded
    pub undecodable: usize,
    /// Messages retired between the poll and their delivery
    pub skipped: usize,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.delivered == 0 && self.failed == 0 && self.undecodable == 0 && self.skipped == 0
    }
}
