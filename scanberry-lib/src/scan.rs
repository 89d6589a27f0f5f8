//! The scan worker.
//!
//! A scan runs as its own task alongside three timers (paper deadline, motor
//! wake, motor sleep). All four rendezvous on a barrier so the timers start
//! counting at the same instant the device is told to scan. A supervisor task
//! waits for the worker and turns its result into a state transition; any
//! worker failure, including a panic, powers the scanner down. A shutdown in
//! the middle of a scan wins: the timers stand down and the outcome is dropped.

use crate::control::{Inner, ScannerEvent, ScannerState};
use crate::driver::{AbortHandle, PageImage};
use crate::error::ScanError;
use crate::gpio::{Rail, Rails};
use crate::params::{SspRequest, XscRequest};
use crate::transport::Connector;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Barrier, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

/// Parties on the start barrier: the worker plus three timers.
const PARTIES: usize = 4;

#[derive(Debug)]
pub(crate) enum ScanOutcome {
    Page(PageImage),
    /// The device finished without producing a page
    NoPaper,
    /// The sheet was still in the feeder long after the paper deadline
    Jammed,
}

/// Start the worker and its supervisor. Returns immediately.
pub(crate) fn spawn<R: Rails, C: Connector>(inner: Arc<Inner<R, C>>, long: bool) {
    let runtime = inner.runtime.clone();
    let worker = runtime.spawn(run(Arc::clone(&inner), long));
    runtime.spawn(async move {
        let result = match worker.await {
            Ok(result) => result,
            Err(join_error) => Err(ScanError::WorkerPanicked(join_error.to_string())),
        };
        match result {
            Ok(outcome) => {
                info!(?outcome, "Scan finished");
                inner.finish_scan(outcome);
            }
            Err(e) if !inner.state().is_scanning() => {
                info!(error = %e, state = %inner.state(), "Scan ended after the scanner left it");
            }
            Err(e) => {
                error!(error = %e, "Scan worker failed, powering down");
                inner.emit(ScannerEvent::Fault(e.to_string()));
                inner.power_off();
            }
        }
    });
}

/// Tells a timer to stand down: the worker is done, or the scanner was shut down.
#[derive(Clone)]
struct StandDown {
    stop: watch::Receiver<bool>,
    state: watch::Receiver<ScannerState>,
}

impl StandDown {
    async fn wait(mut self) {
        // A dropped sender also counts
        tokio::select! {
            _ = self.stop.wait_for(|stop| *stop) => {}
            _ = self.state.wait_for(|state| !state.is_scanning()) => {}
        }
    }
}

/// Sleep for `after`, then run `then`, unless told to stand down first.
async fn after_unless_cancelled<F: Future<Output = ()>>(
    after: Duration,
    stand_down: StandDown,
    then: F,
) -> bool {
    tokio::select! {
        _ = sleep(after) => {
            then.await;
            true
        }
        _ = stand_down.wait() => false,
    }
}

struct Timers {
    handles: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl Timers {
    fn start<R: Rails, C: Connector>(
        inner: &Arc<Inner<R, C>>,
        barrier: &Arc<Barrier>,
        started: Instant,
        duration: Duration,
        abort: AbortHandle,
        jammed: &Arc<AtomicBool>,
    ) -> Self {
        let timing = inner.config.timing;
        let (stop, stop_rx) = watch::channel(false);
        let stand_down = StandDown {
            stop: stop_rx,
            state: inner.subscribe_state(),
        };
        let mut handles = Vec::with_capacity(PARTIES - 1);

        // Paper deadline, then the jam watchdog
        {
            let inner = Arc::clone(inner);
            let barrier = Arc::clone(barrier);
            let jammed = Arc::clone(jammed);
            let stand_down = stand_down.clone();
            handles.push(inner.runtime.clone().spawn(async move {
                barrier.wait().await;
                let deadline = after_unless_cancelled(duration, stand_down.clone(), async {
                    inner.set_rail(Rail::Paper, false);
                    info!(elapsed = ?started.elapsed(), "Paper deadline reached");
                    if inner.advance_scan(ScannerState::ScanReceiving) {
                        inner.emit(ScannerEvent::ScanReceiving);
                    }
                })
                .await;
                if !deadline {
                    return;
                }
                after_unless_cancelled(timing.jam_grace, stand_down, async {
                    warn!(
                        elapsed = ?started.elapsed(),
                        "Sheet still feeding, assuming a paper jam"
                    );
                    jammed.store(true, Ordering::Relaxed);
                    abort.request();
                })
                .await;
            }));
        }

        // Motor driver wake-up
        {
            let inner = Arc::clone(inner);
            let barrier = Arc::clone(barrier);
            let stand_down = stand_down.clone();
            handles.push(inner.runtime.clone().spawn(async move {
                barrier.wait().await;
                after_unless_cancelled(timing.motor_wake, stand_down, async {
                    if inner.set_scan_rail(Rail::MotorWake, true) {
                        info!(elapsed = ?started.elapsed(), "Waking motor driver");
                    }
                })
                .await;
            }));
        }

        // Motor driver back to sleep shortly after the paper deadline
        {
            let inner = Arc::clone(inner);
            let barrier = Arc::clone(barrier);
            handles.push(inner.runtime.clone().spawn(async move {
                barrier.wait().await;
                after_unless_cancelled(duration + timing.motor_sleep_margin, stand_down, async {
                    info!(elapsed = ?started.elapsed(), "Motor driver to sleep");
                    inner.set_rail(Rail::MotorWake, false);
                })
                .await;
            }));
        }

        Self { handles, stop }
    }

    async fn finish(self) -> Result<(), ScanError> {
        let _ = self.stop.send(true);
        for handle in self.handles {
            handle
                .await
                .map_err(|e| ScanError::WorkerPanicked(e.to_string()))?;
        }
        Ok(())
    }
}

async fn run<R: Rails, C: Connector>(
    inner: Arc<Inner<R, C>>,
    long: bool,
) -> Result<ScanOutcome, ScanError> {
    let timing = inner.config.timing;
    let settings = inner.config.scan;
    let duration = timing.scan_duration(long);
    inner.emit(ScannerEvent::ScanStarting);

    let mut device = inner.hw.device.lock().await;

    // Motor driver sleeps until the feed is under way
    inner.set_rail(Rail::MotorWake, false);
    if !inner.set_scan_rail(Rail::Paper, true) {
        info!(state = %inner.state(), "Scanner shut down before the feed, not scanning");
        device.take();
        return Ok(ScanOutcome::NoPaper);
    }
    let driver = device.as_mut().ok_or(ScanError::DeviceNotFound)?;
    let started = Instant::now();
    info!(long, ?duration, "Paper inserted");
    sleep(timing.paper_settle).await;

    let barrier = Arc::new(Barrier::new(PARTIES));
    let jammed = Arc::new(AtomicBool::new(false));
    let abort = driver.abort_handle();
    let timers = Timers::start(&inner, &barrier, started, duration, abort, &jammed);
    barrier.wait().await;

    let result = async {
        driver.set_parameters(&SspRequest::new(settings.dpi).long(long)).await?;
        if inner.advance_scan(ScannerState::ScanRunning) {
            inner.emit(ScannerEvent::ScanRunning(duration));
        }
        let session = driver.scan(&XscRequest::new(settings.dpi, settings.area)).await?;
        session.last_page().await
    }
    .await;

    inner.set_rail(Rail::Paper, false);
    let timers = timers.finish().await;
    if !inner.set_scan_rail(Rail::MotorWake, true) {
        // Shut down mid-scan; the handle could not be closed then
        device.take();
    }
    drop(device);
    info!(elapsed = ?started.elapsed(), "Scan worker done");

    let page = result?;
    timers?;
    Ok(match page {
        Some(page) => ScanOutcome::Page(page),
        None if jammed.load(Ordering::Relaxed) => ScanOutcome::Jammed,
        None => ScanOutcome::NoPaper,
    })
}
