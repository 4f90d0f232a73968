//! Notification scheduler
//!
//! One task per (characteristic, peer) subscription. Each wake pushes a
//! freshly produced value to the peer. Wakes come from a fixed cadence or
//! from an out-of-band wake signal; a wake signal pushes immediately and
//! leaves the cadence untouched. The "still subscribed" query is polled
//! at every wake, so a silent unsubscribe is noticed within one interval,
//! and an explicit stop is raced against every wait.

use std::fmt;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use uuid::Uuid;

use crate::ble::transport::{BleAddress, Notifier};
use crate::ble::BleError;
use crate::gatt::characteristic::ValueFn;
use crate::gatt::GattError;

/// Fan-out wake signal. Raising it wakes every scheduler subscribed to it.
#[derive(Debug, Clone)]
pub struct WakeSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl WakeSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn raise(&self) {
        self.tx
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// A receiver that observes raises made after this call.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Stopped,
}

/// Why a scheduler stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The transport reported the peer no longer subscribed or connected.
    Unsubscribed,
    /// The subscription was stopped through its handle.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Unsubscribed => f.write_str("peer unsubscribed"),
            StopReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Summary of a finished subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerReport {
    pub characteristic: Uuid,
    pub peer: BleAddress,
    /// Notifications delivered.
    pub ticks: u64,
    /// Wakes whose value could not be produced.
    pub failed_ticks: u64,
    pub reason: StopReason,
}

/// Handle to a running notification scheduler.
pub struct SubscriptionHandle {
    characteristic: Uuid,
    peer: BleAddress,
    stop: Arc<Notify>,
    state: watch::Receiver<SchedulerState>,
    task: JoinHandle<Result<SchedulerReport, GattError>>,
}

impl SubscriptionHandle {
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    pub fn peer(&self) -> &BleAddress {
        &self.peer
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Ask the scheduler to stop. Takes effect at its next suspension point.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    /// Wait until the scheduler has reached `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut state = self.state.clone();
        loop {
            if *state.borrow_and_update() == SchedulerState::Stopped {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for the scheduler task to finish and return its outcome.
    pub async fn join(self) -> Result<SchedulerReport, GattError> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(GattError::SchedulerAborted(e.to_string())),
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("characteristic", &self.characteristic)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// What ended a wait between ticks.
enum Wake {
    Stop,
    Tick,
    Signal,
    SignalClosed,
}

pub(crate) fn spawn(
    characteristic: Uuid,
    notifier: Arc<dyn Notifier>,
    value: Arc<ValueFn>,
    interval: Duration,
    wake: Option<watch::Receiver<u64>>,
) -> SubscriptionHandle {
    let peer = notifier.peer_address().clone();
    let stop = Arc::new(Notify::new());
    let (state_tx, state) = watch::channel(SchedulerState::Running);

    let task = tokio::spawn(run(
        characteristic,
        notifier,
        value,
        interval,
        wake,
        Arc::clone(&stop),
        state_tx,
    ));

    SubscriptionHandle {
        characteristic,
        peer,
        stop,
        state,
        task,
    }
}

async fn run(
    characteristic: Uuid,
    notifier: Arc<dyn Notifier>,
    value: Arc<ValueFn>,
    interval: Duration,
    mut wake: Option<watch::Receiver<u64>>,
    stop: Arc<Notify>,
    state: watch::Sender<SchedulerState>,
) -> Result<SchedulerReport, GattError> {
    let peer = notifier.peer_address().clone();
    log::info!("Notifications started for {} on {}", peer, characteristic);

    // The first tick of a tokio interval completes immediately, which gives
    // the initial push on subscribe.
    let mut ticker = time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut ticks = 0u64;
    let mut failed_ticks = 0u64;

    let outcome = loop {
        let woke = tokio::select! {
            biased;
            _ = stop.notified() => Wake::Stop,
            _ = ticker.tick() => Wake::Tick,
            open = next_signal(&mut wake) => if open { Wake::Signal } else { Wake::SignalClosed },
        };

        match woke {
            Wake::Stop => break Ok(StopReason::Cancelled),
            Wake::SignalClosed => {
                wake = None;
                continue;
            }
            Wake::Tick | Wake::Signal => {}
        }

        if !notifier.is_subscribed() {
            break Ok(StopReason::Unsubscribed);
        }

        let bytes = match value() {
            Ok(bytes) => bytes,
            Err(e) => {
                failed_ticks += 1;
                log::warn!(
                    "Skipping notification for {} on {}: {}",
                    peer,
                    characteristic,
                    e
                );
                continue;
            }
        };

        let pushed = tokio::select! {
            biased;
            _ = stop.notified() => None,
            result = notifier.notify(&bytes) => Some(result),
        };
        match pushed {
            None => break Ok(StopReason::Cancelled),
            Some(Ok(())) => ticks += 1,
            // The peer left between the subscribed check and the push.
            Some(Err(BleError::NotSubscribed | BleError::Disconnected))
                if !notifier.is_subscribed() =>
            {
                break Ok(StopReason::Unsubscribed)
            }
            Some(Err(e)) => break Err(GattError::SinkWriteFailed(e)),
        }
    };

    state.send_replace(SchedulerState::Stopped);

    match outcome {
        Ok(reason) => {
            log::info!(
                "Notifications stopped for {} on {} after {} ticks: {}",
                peer,
                characteristic,
                ticks,
                reason
            );
            Ok(SchedulerReport {
                characteristic,
                peer,
                ticks,
                failed_ticks,
                reason,
            })
        }
        Err(e) => {
            log::warn!(
                "Notifications for {} on {} failed after {} ticks: {}",
                peer,
                characteristic,
                ticks,
                e
            );
            Err(e)
        }
    }
}

/// Resolves `true` on the next raise, `false` once the signal is gone.
/// Never resolves when there is no signal.
async fn next_signal(wake: &mut Option<watch::Receiver<u64>>) -> bool {
    match wake {
        Some(rx) => rx.changed().await.is_ok(),
        None => future::pending().await,
    }
}
