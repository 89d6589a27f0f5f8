//! Power and timing state machine.
//!
//! The scanner is switched on, woken and fed purely through GPIO: a power
//! rail, a front-panel button, a fake paper-presence sensor and the feed motor
//! driver's wake line. Boot and wake-up take fixed, observed amounts of time,
//! so readiness is inferred from timers rather than reported by the device.
//!
//! ```text
//!  PowerDown --startup--> StartingUp --(startup elapsed)--> Ready
//!  PowerSaving --startup--> StartingUp --(startup_resume elapsed)--> Ready
//!  Ready --(powersaving_timeout idle)--> PowerSaving
//!  Ready --scan--> ScanStarting -> ScanRunning -> ScanReceiving -> Ready | Paperjam
//!  Paperjam --reset--> PowerDown --(restart_delay)--> StartingUp
//!  any --shutdown--> PowerDown
//! ```
//!
//! Every public operation returns immediately; progress is reported on the
//! event channel handed out by [`ScannerControl::new`].

use crate::config::ScannerConfig;
use crate::driver::{AbortHandle, PageImage, ProtocolDriver};
use crate::error::ScanError;
use crate::gpio::{Rail, Rails};
use crate::scan::{self, ScanOutcome};
use crate::timer::{Countdown, Waiter};
use crate::transport::Connector;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use strum_macros::Display;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ScannerState {
    PowerDown,
    PowerSaving,
    StartingUp,
    ScanStarting,
    ScanRunning,
    ScanReceiving,
    Ready,
    Paperjam,
}

impl ScannerState {
    pub fn is_scanning(&self) -> bool {
        matches!(
            self,
            ScannerState::ScanStarting | ScannerState::ScanRunning | ScannerState::ScanReceiving
        )
    }
}

/// Notifications emitted by the state machine.
#[derive(Debug, Clone)]
pub enum ScannerEvent {
    StateChanged(ScannerState),
    /// Ready to accept paper
    Ready,
    /// Powered down or dozed off
    Shutdown,
    ScanStarting,
    /// Paper is being pulled; the paper rail drops after this long
    ScanRunning(Duration),
    ScanReceiving,
    ScanSuccess(PageImage),
    PaperJam,
    NoPaper,
    /// The scan worker failed; the scanner has been powered down
    Fault(String),
}

/// Rails and device handle, owned by the state machine.
pub(crate) struct Hardware<R, C: Connector> {
    rails: Mutex<R>,
    connector: C,
    pub(crate) device: tokio::sync::Mutex<Option<ProtocolDriver<C::Transport>>>,
    abort: Mutex<Option<AbortHandle>>,
}

pub(crate) struct Inner<R, C: Connector> {
    pub(crate) config: ScannerConfig,
    pub(crate) runtime: Handle,
    state: watch::Sender<ScannerState>,
    events: mpsc::UnboundedSender<ScannerEvent>,
    pub(crate) hw: Hardware<R, C>,
    waiter: Waiter,
    button: Waiter,
    sleep_timer: Countdown,
}

/// Handle to the scanner state machine. Cheap to clone.
pub struct ScannerControl<R, C: Connector> {
    inner: Arc<Inner<R, C>>,
}

impl<R, C: Connector> Clone for ScannerControl<R, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Rails, C: Connector> ScannerControl<R, C> {
    /// Drive all rails low and return the control plus its event stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        rails: R,
        connector: C,
        config: ScannerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ScannerEvent>) {
        let runtime = Handle::current();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ScannerState::PowerDown);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<R, C>>| {
            let weak = weak.clone();
            let sleep_timer = Countdown::with_runtime("sleep-timer", runtime.clone(), move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_power_saving();
                }
            });
            Inner {
                config,
                runtime: runtime.clone(),
                state,
                events,
                hw: Hardware {
                    rails: Mutex::new(rails),
                    connector,
                    device: tokio::sync::Mutex::new(None),
                    abort: Mutex::new(None),
                },
                waiter: Waiter::with_runtime("waiter", runtime.clone()),
                button: Waiter::with_runtime("button", runtime.clone()),
                sleep_timer,
            }
        });
        inner.rails().all_off();

        (Self { inner }, events_rx)
    }

    /// Power up the scanner if it is not, or wake it from power saving.
    ///
    /// A jammed scanner is reset instead; an already ready scanner just
    /// reports [`ScannerEvent::Ready`] again.
    pub fn startup(&self) {
        let inner = &self.inner;
        match inner.state() {
            ScannerState::PowerDown => {
                info!(".startup() -> power_on");
                inner.power_on();
            }
            ScannerState::PowerSaving => {
                info!(".startup() -> resume_from_powersaving");
                inner.resume_from_powersaving();
            }
            ScannerState::Paperjam => {
                info!(".startup() -> reset");
                inner.reset();
            }
            ScannerState::Ready => {
                info!(".startup() -> already ready");
                inner.emit(ScannerEvent::Ready);
            }
            state => info!(%state, ".startup() -> noop"),
        }
    }

    /// True iff the scanner is exactly in [`ScannerState::Ready`].
    pub fn can_scan(&self) -> bool {
        self.inner.state() == ScannerState::Ready
    }

    /// Feed and scan one sheet. Refused unless the scanner is ready.
    pub fn scan(&self, long: bool) -> Result<(), ScanError> {
        info!(long, ".scan()");
        let inner = &self.inner;
        let mut accepted = false;
        inner.state.send_if_modified(|state| {
            if *state == ScannerState::Ready {
                *state = ScannerState::ScanStarting;
                accepted = true;
            }
            accepted
        });
        if !accepted {
            let state = inner.state();
            warn!(%state, "Scan requested while not ready");
            return Err(ScanError::NotReady(state));
        }
        info!(state = %ScannerState::ScanStarting, "State changed");
        inner.emit(ScannerEvent::StateChanged(ScannerState::ScanStarting));
        inner.sleep_timer.stop();
        scan::spawn(Arc::clone(inner), long);
        Ok(())
    }

    /// Drop the paper rail so the feeder stops pulling. Device state is untouched.
    pub fn scan_stop(&self) {
        info!(".scan_stop()");
        self.inner.set_rail(Rail::Paper, false);
    }

    /// Ask the device to cancel the running scan without ejecting.
    pub fn abort_scan(&self) {
        info!(".abort_scan()");
        let abort = self.inner.hw.abort.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = abort.as_ref() {
            handle.request();
        }
    }

    /// Hard power-cycle: power off, then power on after the restart delay.
    pub fn reset(&self) {
        info!(".reset()");
        self.inner.reset();
    }

    pub fn shutdown(&self) {
        info!(".shutdown()");
        self.inner.power_off();
    }

    /// Stop all timers and wait for their tasks. Any scan must have finished.
    pub async fn end(&self) {
        info!(".end()");
        let inner = &self.inner;
        inner.waiter.shutdown().await;
        inner.button.shutdown().await;
        inner.sleep_timer.shutdown().await;
    }

    pub fn state(&self) -> ScannerState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ScannerState> {
        self.inner.subscribe_state()
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.inner.config
    }
}

impl<R: Rails, C: Connector> Inner<R, C> {
    pub(crate) fn state(&self) -> ScannerState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ScannerState) {
        info!(%state, "State changed");
        self.state.send_replace(state);
        self.emit(ScannerEvent::StateChanged(state));
    }

    pub(crate) fn emit(&self, event: ScannerEvent) {
        // Nobody listening is not an error
        let _ = self.events.send(event);
    }

    fn rails(&self) -> MutexGuard<'_, R> {
        self.hw.rails.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_rail(&self, rail: Rail, on: bool) {
        self.rails().set(rail, on);
    }

    /// Drive a rail for the scan in progress. Does nothing, and returns false,
    /// once the scanner has left the scanning states.
    pub(crate) fn set_scan_rail(&self, rail: Rail, on: bool) -> bool {
        // Rails before state, the same order as power_off
        let mut rails = self.rails();
        if !self.state().is_scanning() {
            return false;
        }
        rails.set(rail, on);
        true
    }

    /// Move to `next` only if a scan is still in progress.
    pub(crate) fn advance_scan(&self, next: ScannerState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if state.is_scanning() {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            info!(state = %next, "State changed");
            self.emit(ScannerEvent::StateChanged(next));
        }
        moved
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ScannerState> {
        self.state.subscribe()
    }

    fn on_power_saving(&self) {
        if self.state() != ScannerState::Ready {
            return;
        }
        info!("._on_power_saving()");
        self.set_state(ScannerState::PowerSaving);
        self.emit(ScannerEvent::Shutdown);
    }

    fn power_on(self: &Arc<Self>) {
        info!("._power_on()");
        let timing = self.config.timing;
        self.sleep_timer.stop();
        {
            let mut rails = self.rails();
            rails.set(Rail::Power, true);
            rails.set(Rail::MotorWake, true);
        }
        self.set_state(ScannerState::StartingUp);

        let inner = Arc::clone(self);
        if let Err(e) = self.waiter.delay(timing.startup, async move { inner.powered().await }) {
            error!(error = %e, "Could not schedule power-on completion");
        }
        let inner = Arc::clone(self);
        if let Err(e) = self
            .button
            .delay(timing.button_delay, async move { inner.push_button().await })
        {
            error!(error = %e, "Could not schedule button press");
        }
    }

    fn resume_from_powersaving(self: &Arc<Self>) {
        info!("._resume_from_powersaving()");
        let timing = self.config.timing;
        self.sleep_timer.stop();
        self.set_state(ScannerState::StartingUp);

        let inner = Arc::clone(self);
        if let Err(e) = self
            .button
            .delay(Duration::ZERO, async move { inner.push_button().await })
        {
            error!(error = %e, "Could not schedule button press");
        }
        let inner = Arc::clone(self);
        if let Err(e) = self
            .waiter
            .delay(timing.startup_resume, async move { inner.powered().await })
        {
            error!(error = %e, "Could not schedule wake-up completion");
        }
    }

    async fn push_button(&self) {
        info!("._push_button()");
        self.set_rail(Rail::Button, true);
        tokio::time::sleep(self.config.timing.button_hold).await;
        self.set_rail(Rail::Button, false);
    }

    async fn powered(self: Arc<Self>) {
        if self.state() != ScannerState::StartingUp {
            warn!(state = %self.state(), "Power-on completed in unexpected state, ignoring");
            return;
        }
        info!("._powered_on()");

        {
            let mut device = self.hw.device.lock().await;
            if device.is_none() {
                match self.hw.connector.connect() {
                    Ok(transport) => {
                        let driver = ProtocolDriver::new(transport);
                        let mut abort = self.hw.abort.lock().unwrap_or_else(|p| p.into_inner());
                        *abort = Some(driver.abort_handle());
                        *device = Some(driver);
                    }
                    Err(e) => {
                        drop(device);
                        error!(error = %e, "Failed to open scanner device");
                        self.emit(ScannerEvent::Fault(e.to_string()));
                        self.power_off();
                        return;
                    }
                }
            }
        }

        self.sleep_timer.restart(self.config.timing.powersaving_timeout);
        self.set_state(ScannerState::Ready);
        self.emit(ScannerEvent::Ready);
    }

    pub(crate) fn power_off(&self) {
        info!("._power_off()");
        self.sleep_timer.stop();
        self.waiter.stop();
        self.button.stop();
        let previous = {
            let mut rails = self.rails();
            rails.all_off();
            self.state.send_replace(ScannerState::PowerDown)
        };
        self.close_device();
        if previous != ScannerState::PowerDown {
            info!(state = %ScannerState::PowerDown, "State changed");
            self.emit(ScannerEvent::StateChanged(ScannerState::PowerDown));
            self.emit(ScannerEvent::Shutdown);
        }
    }

    fn close_device(&self) {
        self.hw.abort.lock().unwrap_or_else(|p| p.into_inner()).take();
        match self.hw.device.try_lock() {
            Ok(mut device) => {
                device.take();
            }
            // Held by a scan worker, which closes it on exit when powered down
            Err(_) => warn!("Device busy, closing once the scan releases it"),
        }
    }

    fn reset(self: &Arc<Self>) {
        self.power_off();
        let inner = Arc::clone(self);
        let delay = self.config.timing.restart_delay;
        if let Err(e) = self.waiter.delay(delay, async move { inner.power_on() }) {
            error!(error = %e, "Could not schedule restart");
        }
    }

    pub(crate) fn finish_scan(&self, outcome: ScanOutcome) {
        let next = match outcome {
            ScanOutcome::Jammed => ScannerState::Paperjam,
            _ => ScannerState::Ready,
        };
        if !self.advance_scan(next) {
            info!(
                state = %self.state(),
                ?outcome,
                "Scanner left the scan meanwhile, dropping outcome"
            );
            return;
        }
        match outcome {
            ScanOutcome::Page(page) => {
                self.sleep_timer.restart(self.config.timing.powersaving_timeout);
                self.emit(ScannerEvent::ScanSuccess(page));
            }
            ScanOutcome::NoPaper => {
                self.sleep_timer.restart(self.config.timing.powersaving_timeout);
                self.emit(ScannerEvent::NoPaper);
            }
            ScanOutcome::Jammed => self.emit(ScannerEvent::PaperJam),
        }
    }
}
