//! Per-operation execution context handed to every suspending call.

use crate::log_collector::LogCollector;
use crate::orchestrator::broadcaster::{ProgressBroadcaster, ProgressEvent};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a suspended wait was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Cancelled,
    TimedOut,
}

/// Cancellation token, deadline and event sink of one operation.
#[derive(Clone)]
pub struct OperationContext {
    id: String,
    cancel_rx: watch::Receiver<bool>,
    broadcaster: ProgressBroadcaster,
    deadline: Option<Instant>,
    log_collector: Option<LogCollector>,
}

impl OperationContext {
    pub fn new(
        id: impl Into<String>,
        cancel_rx: watch::Receiver<bool>,
        broadcaster: ProgressBroadcaster,
    ) -> Self {
        OperationContext {
            id: id.into(),
            cancel_rx,
            broadcaster,
            deadline: None,
            log_collector: None,
        }
    }

    /// Bound the whole operation to `timeout` from now.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    pub fn with_log_collector(mut self, collector: Option<LogCollector>) -> Self {
        self.log_collector = collector;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.broadcaster
    }

    /// A fresh receiver for select loops.
    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Fail fast if cancellation or the deadline already hit.
    pub fn checkpoint(&self) -> Result<(), Interruption> {
        if self.is_cancelled() {
            return Err(Interruption::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interruption::TimedOut),
            _ => Ok(()),
        }
    }

    /// Drive `fut` unless cancellation or the deadline comes first.
    pub async fn interruptible<F: Future>(&self, fut: F) -> Result<F::Output, Interruption> {
        self.checkpoint()?;

        let mut cancel_rx = self.cancel_rx.clone();
        let mut cancel_open = true;
        let deadline = self.deadline;
        tokio::pin!(fut);

        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = sleep_until_opt(deadline) => return Err(Interruption::TimedOut),
                changed = cancel_rx.changed(), if cancel_open => {
                    match changed {
                        Ok(()) if *cancel_rx.borrow() => return Err(Interruption::Cancelled),
                        Ok(()) => {}
                        // Sender gone: nobody can cancel any more
                        Err(_) => cancel_open = false,
                    }
                }
            }
        }
    }

    /// Wall-clock wait that wakes early on cancellation or deadline.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interruption> {
        if duration.is_zero() {
            return self.checkpoint();
        }
        self.interruptible(tokio::time::sleep(duration)).await
    }

    pub fn publish(&self, event: ProgressEvent) {
        self.broadcaster.publish(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.publish(ProgressEvent::status(&self.id, message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(ProgressEvent::error(&self.id, message));
    }

    /// Persist one raw output line to the operation's log file, if logging to disk.
    pub fn log_output(&self, line: &str) {
        if let Some(ref collector) = self.log_collector {
            collector.log_operation(&self.id, line);
        }
    }

    pub fn log_collector(&self) -> Option<&LogCollector> {
        self.log_collector.as_ref()
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
