use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info};

use crate::error::MonitorError;
use crate::monitor::Monitor;
use crate::scrapers::ListingSource;
use crate::sink::Sink;

/// How a runner stopped after a shutdown request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub cycles: u64,
}

/// Repeats monitoring cycles on a fixed interval until shutdown
pub struct Runner<'a, S, K> {
    monitor: Monitor<'a, S, K>,
    interval: Duration,
}

impl<'a, S: ListingSource, K: Sink> Runner<'a, S, K> {
    pub fn new(monitor: Monitor<'a, S, K>, interval: Duration) -> Self {
        Self { monitor, interval }
    }

    pub fn monitor(&self) -> &Monitor<'a, S, K> {
        &self.monitor
    }

    /// Run cycles until `shutdown` turns true.
    ///
    /// Shutdown is only observed between cycles: a running cycle always
    /// completes. A fatal cycle error is returned to the caller.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<RunSummary, MonitorError> {
        let mut summary = RunSummary::default();
        info!(interval_secs = self.interval.as_secs(), "Continuous monitoring started");

        while !*shutdown.borrow() {
            let started = Instant::now();
            let stats = self.monitor.run_cycle().await?;
            summary.cycles += 1;
            info!(
                cycle = summary.cycles,
                elapsed_secs = started.elapsed().as_secs(),
                sent = stats.sent_to_api,
                errors = stats.errors,
                "Cycle finished"
            );

            if *shutdown.borrow() {
                break;
            }

            let next = chrono::Local::now()
                + chrono::Duration::from_std(self.interval).unwrap_or_else(|_| chrono::Duration::zero());
            info!("Next cycle at {}", next.format("%H:%M:%S"));

            if wait_or_shutdown(self.interval, &mut shutdown).await {
                break;
            }
        }

        info!(cycles = summary.cycles, "Monitoring stopped");
        Ok(summary)
    }
}

/// Sleep for `duration` unless shutdown is requested first. Returns true on shutdown.
pub(crate) async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }

    let pause = sleep(duration);
    tokio::pin!(pause);

    loop {
        tokio::select! {
            _ = &mut pause => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return true,
                Ok(()) => continue,
                // sender gone: no shutdown can arrive any more
                Err(_) => {
                    (&mut pause).await;
                    return false;
                }
            },
        }
    }
}

/// Keep a monitoring session alive, rebuilding it from scratch after any failure.
///
/// `start` builds a fresh session (browser, sink, seen-set from disk) and runs
/// it. A clean stop is returned as is; an error or a panic is logged as
/// critical and the session is started again after `backoff`.
pub async fn supervise<F, Fut>(
    backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut start: F,
) -> RunSummary
where
    F: FnMut(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = anyhow::Result<RunSummary>>,
{
    let mut total = RunSummary::default();
    let mut restarts: u32 = 0;

    loop {
        let session = AssertUnwindSafe(async { start(shutdown.clone()).await }).catch_unwind();
        let failure = match session.await {
            Ok(Ok(summary)) => {
                total.cycles += summary.cycles;
                return total;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => format!("panic: {}", panic_message(panic.as_ref())),
        };
        error!(
            error = %failure,
            restarts,
            "CRITICAL: monitoring session failed, restarting in {}s",
            backoff.as_secs()
        );

        if wait_or_shutdown(backoff, &mut shutdown).await {
            info!("Shutdown requested, not restarting");
            return total;
        }
        restarts += 1;
        info!(restarts, "Restarting monitoring session");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
