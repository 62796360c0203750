//! Periodic order fetching.
//!
//! Orders are coordinator-issued instructions delivered through the
//! communications daemon. The supervisor's only obligation is to keep one
//! fetch task alive for its whole lifetime; interpreting orders is the
//! communications daemon's job.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::{interruptible_sleep, CancelFlag};
use crate::probe::ChannelProbe;

const ORDERS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::orders");

/// Interval between fetch attempts.
pub const FETCH_INTERVAL: Duration = Duration::from_secs(15);

/// Fetches pending orders from the communications channel.
pub trait OrderFetcher: Send + Sync {
    fn fetch(&self) -> Result<(), OrderError>;
}

/// Fetcher that asks the communications daemon over its local channel.
///
/// A channel that does not answer simply means no orders are retrievable
/// right now; the next interval retries.
pub struct ChannelOrderFetcher {
    channel: Box<dyn ChannelProbe>,
}

impl ChannelOrderFetcher {
    #[must_use]
    pub fn new(channel: Box<dyn ChannelProbe>) -> Self {
        Self { channel }
    }
}

impl OrderFetcher for ChannelOrderFetcher {
    fn fetch(&self) -> Result<(), OrderError> {
        if self.channel.probe() {
            Ok(())
        } else {
            Err(OrderError::Unreachable {
                channel: self.channel.describe(),
            })
        }
    }
}

/// Supervised handle to the background fetch task.
///
/// The supervisor holds this for its whole lifetime and cancels it during
/// shutdown; the task never floats unreferenced.
pub struct OrdersTask {
    cancel: CancelFlag,
    handle: Option<thread::JoinHandle<()>>,
}

impl OrdersTask {
    /// Spawns the fetch loop. Failed attempts are logged, never fatal.
    pub fn spawn(
        fetcher: Arc<dyn OrderFetcher>,
        interval: Duration,
    ) -> Result<Self, OrderError> {
        let cancel = CancelFlag::new();
        let task_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name("orders".to_owned())
            .spawn(move || run_fetch_loop(&*fetcher, interval, &task_cancel))
            .map_err(|source| OrderError::Spawn { source })?;
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Cancels the loop and waits for the thread to finish.
    pub fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: ORDERS_TARGET, "orders task panicked");
            }
        }
    }
}

impl Drop for OrdersTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn run_fetch_loop(fetcher: &dyn OrderFetcher, interval: Duration, cancel: &CancelFlag) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match fetcher.fetch() {
            Ok(()) => debug!(target: ORDERS_TARGET, "fetched pending orders"),
            Err(error) => debug!(target: ORDERS_TARGET, error = %error, "order fetch failed"),
        }
        if !interruptible_sleep(interval, cancel) {
            return;
        }
    }
}

/// Errors raised by the order-fetching task.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The communications channel did not answer.
    #[error("orders channel '{channel}' is unreachable")]
    Unreachable { channel: String },
    /// Spawning the background thread failed.
    #[error("failed to spawn the orders task: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
}
