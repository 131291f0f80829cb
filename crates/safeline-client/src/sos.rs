//! SOS alert state machine.
//!
//! ```text
//! Idle -> CountingDown(n) -> ... -> CountingDown(1) -> Capturing -> Submitting -> Completed
//!              |                                          |             |
//!              +------------------> Cancelled <-----------+             +--> Failed
//!                                                         +----------------> Failed
//! ```
//!
//! The countdown runs on a timer task owned by the machine. Cancel, dispose
//! and drop all stop it. The position fix runs on its own task: a fix that
//! arrives after a cancel is dropped by the `Capturing -> Submitting`
//! transition, which only succeeds while the machine is still capturing.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use safeline_shared::constants::ANONYMOUS_DISPLAY_NAME;
use safeline_shared::{SafelineError, SosAlert};
use safeline_store::DocumentStore;

use crate::geolocation::{capture_position, Geolocator, PositionOptions};

#[derive(Debug, Clone, PartialEq)]
pub enum SosState {
    Idle,
    CountingDown(u8),
    Capturing,
    Submitting,
    Completed(SosAlert),
    Cancelled,
    Failed(SafelineError),
}

impl SosState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Cancelled | Self::Failed(_))
    }

    fn is_cancellable(&self) -> bool {
        matches!(self, Self::CountingDown(_) | Self::Capturing)
    }
}

/// Everything the capture and write steps need, shared with the tasks.
struct Capture {
    store: Arc<dyn DocumentStore>,
    geolocator: Arc<dyn Geolocator>,
    options: PositionOptions,
    display_name: String,
}

type Timer = Mutex<Option<JoinHandle<()>>>;

pub struct SosAlertMachine {
    state: Arc<watch::Sender<SosState>>,
    timer: Arc<Timer>,
    capture: Arc<Capture>,
    countdown_secs: u8,
}

impl SosAlertMachine {
    /// `display_name` is written on the alert; without one the alert is
    /// anonymous.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        geolocator: Arc<dyn Geolocator>,
        options: PositionOptions,
        countdown_secs: u8,
        display_name: Option<&str>,
    ) -> Self {
        let display_name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(ANONYMOUS_DISPLAY_NAME)
            .to_string();
        let (state, _) = watch::channel(SosState::Idle);
        Self {
            state: Arc::new(state),
            timer: Arc::new(Mutex::new(None)),
            capture: Arc::new(Capture {
                store,
                geolocator,
                options,
                display_name,
            }),
            countdown_secs,
        }
    }

    pub fn state(&self) -> SosState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SosState> {
        self.state.subscribe()
    }

    /// Begin the countdown. Only valid from `Idle`.
    pub fn start(&self) -> bool {
        let secs = self.countdown_secs;
        let started = self.state.send_if_modified(|state| {
            if *state != SosState::Idle {
                return false;
            }
            *state = if secs == 0 {
                SosState::Capturing
            } else {
                SosState::CountingDown(secs)
            };
            true
        });
        if !started {
            return false;
        }

        info!(countdown_secs = secs, "SOS started");
        if secs == 0 {
            spawn_capture(Arc::clone(&self.state), Arc::clone(&self.capture));
            return true;
        }

        let first_tick = Instant::now() + Duration::from_secs(1);
        let handle = tokio::spawn(count_down(
            Arc::clone(&self.state),
            Arc::clone(&self.capture),
            first_tick,
        ));
        if let Some(previous) = lock_timer(&self.timer).replace(handle) {
            previous.abort();
        }
        true
    }

    /// Cancel during the countdown or while waiting for the position fix.
    /// Returns `false` (and changes nothing) in any other state.
    pub fn cancel(&self) -> bool {
        cancel(&self.state, &self.timer)
    }

    /// A handle that cancels this machine without owning it.
    pub fn canceller(&self) -> SosCanceller {
        SosCanceller {
            state: Arc::downgrade(&self.state),
            timer: Arc::downgrade(&self.timer),
        }
    }

    /// Tear down: stop the timer and cancel anything still cancellable.
    /// A write already in flight is left to finish.
    pub fn dispose(&self) {
        self.cancel();
    }

    /// Wait for `Completed`, `Cancelled` or `Failed`.
    pub async fn wait_terminal(&self) -> SosState {
        let mut rx = self.state.subscribe();
        let result = rx
            .wait_for(SosState::is_terminal)
            .await
            .map(|state| state.clone());
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }
}

impl Drop for SosAlertMachine {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Cancels an [`SosAlertMachine`] from outside its owner. Does nothing once
/// the machine is gone.
#[derive(Clone)]
pub struct SosCanceller {
    state: Weak<watch::Sender<SosState>>,
    timer: Weak<Timer>,
}

impl SosCanceller {
    pub fn cancel(&self) -> bool {
        match (self.state.upgrade(), self.timer.upgrade()) {
            (Some(state), Some(timer)) => cancel(&state, &timer),
            _ => false,
        }
    }
}

fn lock_timer(timer: &Timer) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    match timer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn cancel(state: &watch::Sender<SosState>, timer: &Timer) -> bool {
    let cancelled = state.send_if_modified(|state| {
        if !state.is_cancellable() {
            return false;
        }
        *state = SosState::Cancelled;
        true
    });
    if let Some(handle) = lock_timer(timer).take() {
        handle.abort();
        debug!("SOS timer stopped");
    }
    if cancelled {
        info!("SOS cancelled");
    }
    cancelled
}

async fn count_down(
    state: Arc<watch::Sender<SosState>>,
    capture: Arc<Capture>,
    first_tick: Instant,
) {
    let mut ticks = interval_at(first_tick, Duration::from_secs(1));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        let mut reached_zero = false;
        let ticked = state.send_if_modified(|s| match *s {
            SosState::CountingDown(n) if n > 1 => {
                *s = SosState::CountingDown(n - 1);
                true
            }
            SosState::CountingDown(_) => {
                *s = SosState::Capturing;
                reached_zero = true;
                true
            }
            _ => false,
        });
        if !ticked {
            return;
        }
        if reached_zero {
            spawn_capture(state, capture);
            return;
        }
        debug!(state = ?*state.borrow(), "SOS tick");
    }
}

fn spawn_capture(state: Arc<watch::Sender<SosState>>, capture: Arc<Capture>) {
    debug!("SOS capturing position");
    tokio::spawn(async move {
        let fix = capture_position(capture.geolocator.as_ref(), &capture.options).await;

        let position = match fix {
            Ok(position) => position,
            Err(e) => {
                let failed = state.send_if_modified(|s| {
                    if *s != SosState::Capturing {
                        return false;
                    }
                    *s = SosState::Failed(e.clone().into());
                    true
                });
                if failed {
                    warn!(error = %e, "SOS position fix failed");
                }
                return;
            }
        };

        // Check before effect: a cancel may have landed while the fix was
        // outstanding.
        let submitting = state.send_if_modified(|s| {
            if *s != SosState::Capturing {
                return false;
            }
            *s = SosState::Submitting;
            true
        });
        if !submitting {
            debug!("Discarded position fix after cancel");
            return;
        }

        let alert = SosAlert {
            id: String::new(),
            display_name: capture.display_name.clone(),
            latitude: position.latitude,
            longitude: position.longitude,
            timestamp: Utc::now(),
        };
        let next = match capture.store.add_record(&alert).await {
            Ok(stored) => {
                info!(id = %stored.id, "SOS alert written");
                SosState::Completed(stored)
            }
            Err(e) => {
                warn!(error = %e, "SOS alert write failed");
                SosState::Failed(e.into())
            }
        };
        state.send_replace(next);
    });
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::{oneshot, Notify};
    use tokio::time::sleep_until;

    use safeline_shared::{GeolocationError, Position, Record};
    use safeline_store::{Query, SqliteDocumentStore};

    use super::*;
    use crate::geolocation::StaticGeolocator;

    const HERE: Position = Position {
        latitude: 51.5,
        longitude: -0.12,
    };

    /// Geolocator whose fix is released by the test.
    struct HeldFix {
        fix: Mutex<Option<oneshot::Receiver<Position>>>,
        dispatched: Arc<Notify>,
    }

    impl HeldFix {
        fn new() -> (Self, oneshot::Sender<Position>, Arc<Notify>) {
            let (tx, rx) = oneshot::channel();
            let dispatched = Arc::new(Notify::new());
            let geo = Self {
                fix: Mutex::new(Some(rx)),
                dispatched: Arc::clone(&dispatched),
            };
            (geo, tx, dispatched)
        }
    }

    #[async_trait]
    impl Geolocator for HeldFix {
        async fn current_position(
            &self,
            _options: &PositionOptions,
        ) -> Result<Position, GeolocationError> {
            let rx = self.fix.lock().unwrap().take();
            self.dispatched.notify_one();
            match rx {
                Some(rx) => rx
                    .await
                    .map_err(|_| GeolocationError::Unavailable("dropped".into())),
                None => std::future::pending().await,
            }
        }
    }

    fn options() -> PositionOptions {
        PositionOptions {
            high_accuracy: true,
            timeout: Duration::from_secs(20),
            max_cache_age: Duration::from_secs(1),
        }
    }

    fn store() -> Arc<dyn DocumentStore> {
        Arc::new(SqliteDocumentStore::in_memory().unwrap())
    }

    fn machine(store: &Arc<dyn DocumentStore>, geo: impl Geolocator + 'static) -> SosAlertMachine {
        SosAlertMachine::new(Arc::clone(store), Arc::new(geo), options(), 5, None)
    }

    async fn alerts(store: &Arc<dyn DocumentStore>) -> Vec<SosAlert> {
        store
            .query_records(&Query::collection(SosAlert::COLLECTION))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_ticks_each_second() {
        let store = store();
        let (geo, _tx, _dispatched) = HeldFix::new();
        let sos = machine(&store, geo);

        let origin = Instant::now();
        assert!(sos.start());
        assert!(!sos.start());
        assert_eq!(sos.state(), SosState::CountingDown(5));

        for t in (1..=5u8).rev() {
            let at = origin + Duration::from_millis(500 + u64::from(5 - t) * 1000);
            sleep_until(at).await;
            assert_eq!(sos.state(), SosState::CountingDown(t), "at {:?}", at - origin);
        }

        sleep_until(origin + Duration::from_millis(5500)).await;
        assert_eq!(sos.state(), SosState::Capturing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_with_anonymous_alert() {
        let store = store();
        let sos = machine(&store, StaticGeolocator::new(Some(HERE)));
        sos.start();

        let SosState::Completed(alert) = sos.wait_terminal().await else {
            panic!("expected completion, got {:?}", sos.state());
        };
        assert_eq!(alert.display_name, "Anonymous");
        assert_eq!(alert.latitude, 51.5);
        assert_eq!(alerts(&store).await, vec![alert]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_name_is_used() {
        let store = store();
        let sos = SosAlertMachine::new(
            Arc::clone(&store),
            Arc::new(StaticGeolocator::new(Some(HERE))),
            options(),
            1,
            Some("Jane"),
        );
        sos.start();
        let SosState::Completed(alert) = sos.wait_terminal().await else {
            panic!("expected completion");
        };
        assert_eq!(alert.display_name, "Jane");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_countdown_writes_nothing() {
        let store = store();
        let (geo, tx, _dispatched) = HeldFix::new();
        let sos = machine(&store, geo);
        let origin = Instant::now();
        sos.start();

        sleep_until(origin + Duration::from_millis(2500)).await;
        assert_eq!(sos.state(), SosState::CountingDown(3));
        assert!(sos.cancel());
        assert!(!sos.cancel());

        let _ = tx.send(HERE);
        sleep_until(origin + Duration::from_secs(30)).await;
        assert_eq!(sos.state(), SosState::Cancelled);
        assert!(alerts(&store).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fix_after_cancel_is_discarded() {
        let store = store();
        let (geo, tx, dispatched) = HeldFix::new();
        let sos = machine(&store, geo);
        sos.start();

        dispatched.notified().await;
        assert_eq!(sos.state(), SosState::Capturing);
        assert!(sos.cancel());

        // The fix resolves successfully after the cancel.
        tx.send(HERE).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(sos.state(), SosState::Cancelled);
        assert!(alerts(&store).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_geolocation_failure_fails_without_write() {
        let store = store();
        let sos = machine(&store, StaticGeolocator::default());
        sos.start();
        assert!(matches!(
            sos.wait_terminal().await,
            SosState::Failed(SafelineError::Geolocation(GeolocationError::Unavailable(_)))
        ));
        assert!(alerts(&store).await.is_empty());
        assert!(!sos.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_geolocation_timeout_fails() {
        let store = store();
        let (geo, _tx, _dispatched) = HeldFix::new();
        let sos = machine(&store, geo);
        let origin = Instant::now();
        sos.start();

        assert_eq!(
            sos.wait_terminal().await,
            SosState::Failed(GeolocationError::Timeout(20).into())
        );
        assert!(origin.elapsed() >= Duration::from_secs(25));
        assert!(alerts(&store).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceller_stops_countdown() {
        let store = store();
        let (geo, _tx, _dispatched) = HeldFix::new();
        let sos = machine(&store, geo);
        let canceller = sos.canceller();
        let origin = Instant::now();
        sos.start();

        sleep_until(origin + Duration::from_millis(1500)).await;
        assert!(canceller.cancel());
        assert!(!canceller.cancel());

        sleep_until(origin + Duration::from_secs(10)).await;
        assert_eq!(sos.state(), SosState::Cancelled);
        assert!(alerts(&store).await.is_empty());

        drop(sos);
        assert!(!canceller.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_timer() {
        let store = store();
        let (geo, _tx, _dispatched) = HeldFix::new();
        let sos = machine(&store, geo);
        let mut rx = sos.subscribe();
        let origin = Instant::now();
        sos.start();

        sleep_until(origin + Duration::from_millis(1500)).await;
        drop(sos);
        assert_eq!(*rx.borrow_and_update(), SosState::Cancelled);

        sleep_until(origin + Duration::from_secs(10)).await;
        assert!(!rx.has_changed().unwrap_or(false));
        assert_eq!(*rx.borrow(), SosState::Cancelled);
    }
}
