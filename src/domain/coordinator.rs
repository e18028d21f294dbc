use crate::domain::models::{CachedState, DeviceEvent, DeviceState, StateOrigin};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Anything that can fetch a fresh device state
pub trait StateSource: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn read_state(&self) -> impl Future<Output = Result<DeviceState, Self::Error>> + Send;
}

/// A refresh could not reach the device. The previously cached state is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("update failed: {0}")]
pub struct UpdateFailed(pub String);

/// Keeps the last known device state and refreshes it periodically, unless
/// polling has been switched off.
pub struct PollingCoordinator<S: StateSource> {
    source: Arc<S>,
    interval: Duration,
    cached: Mutex<Option<CachedState>>,
    polling_enabled: AtomicBool,
    refresh_requested: Notify,
    refresh_lock: tokio::sync::Mutex<()>,
    events: Option<mpsc::UnboundedSender<DeviceEvent>>,
}

impl<S: StateSource> PollingCoordinator<S> {
    pub fn new(source: Arc<S>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            cached: Mutex::new(None),
            polling_enabled: AtomicBool::new(true),
            refresh_requested: Notify::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
            events: None,
        }
    }

    /// Publish every state change and failure on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn cached(&self) -> MutexGuard<'_, Option<CachedState>> {
        self.cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last published state, if any
    pub fn data(&self) -> Option<CachedState> {
        *self.cached()
    }

    pub fn state(&self) -> Option<DeviceState> {
        self.data().map(|cached| cached.state)
    }

    pub fn polling_enabled(&self) -> bool {
        self.polling_enabled.load(Ordering::SeqCst)
    }

    pub fn set_polling_enabled(&self, enabled: bool) {
        let previous = self.polling_enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!("Polling {}", if enabled { "enabled" } else { "disabled" });
            self.publish(DeviceEvent::PollingChanged(enabled));
        }
    }

    fn publish(&self, event: DeviceEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn store(&self, cached: CachedState) -> CachedState {
        *self.cached() = Some(cached);
        self.publish(DeviceEvent::StateUpdated(cached));
        cached
    }

    /// Refresh now.
    ///
    /// With polling off the cached state is re-published untouched and the
    /// device is not contacted.
    pub async fn refresh(&self) -> Result<CachedState, UpdateFailed> {
        let _refresh_guard = self.refresh_lock.lock().await;

        if !self.polling_enabled() {
            debug!("Polling disabled, re-publishing cached state");
            let cached = self.data().unwrap_or(CachedState {
                state: DeviceState::default(),
                origin: StateOrigin::Tentative,
            });
            return Ok(self.store(cached));
        }

        match self.source.read_state().await {
            Ok(state) => Ok(self.store(CachedState {
                state,
                origin: StateOrigin::Confirmed,
            })),
            Err(e) => {
                warn!("State refresh failed: {}", e);
                let failure = UpdateFailed(e.to_string());
                self.publish(DeviceEvent::UpdateFailed(failure.0.clone()));
                Err(failure)
            }
        }
    }

    /// Initial refresh during setup. A device that cannot be read here is
    /// not ready.
    pub async fn first_refresh(&self) -> Result<CachedState, UpdateFailed> {
        self.refresh().await.inspect_err(|e| {
            error!("Initial refresh failed: {}", e);
        })
    }

    /// Ask the running poll loop to refresh without waiting for the timer
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Optimistically update the cached state after a local command.
    ///
    /// The result is marked tentative and is replaced wholesale by the next
    /// successful read. Does nothing before the first refresh.
    pub fn apply_tentative(&self, update: impl FnOnce(&mut DeviceState)) -> Option<CachedState> {
        let mut state = self.state()?;
        update(&mut state);
        Some(self.store(CachedState {
            state,
            origin: StateOrigin::Tentative,
        }))
    }

    /// Poll on the configured interval and on request until `shutdown`
    /// resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Polling every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => debug!("Poll timer fired"),
                _ = self.refresh_requested.notified() => debug!("Refresh requested"),
            }
            // Failures are published and retried on the next tick
            let _ = self.refresh().await;
        }

        info!("Polling stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Error)]
    #[error("radio down")]
    struct RadioDown;

    #[derive(Default)]
    struct ScriptedSource {
        calls: AtomicUsize,
        results: Mutex<VecDeque<Result<DeviceState, ()>>>,
    }

    impl ScriptedSource {
        fn push_ok(&self, enabled: bool, mode_value: u16) {
            self.results.lock().unwrap().push_back(Ok(DeviceState {
                enabled,
                mode_value,
            }));
        }

        fn push_err(&self) {
            self.results.lock().unwrap().push_back(Err(()));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl StateSource for ScriptedSource {
        type Error = RadioDown;

        async fn read_state(&self) -> Result<DeviceState, RadioDown> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.results.lock().unwrap().pop_front() {
                Some(Ok(state)) => Ok(state),
                _ => Err(RadioDown),
            }
        }
    }

    fn coordinator() -> (Arc<ScriptedSource>, PollingCoordinator<ScriptedSource>) {
        let source = Arc::new(ScriptedSource::default());
        let coordinator = PollingCoordinator::new(source.clone(), DEFAULT_POLL_INTERVAL);
        (source, coordinator)
    }

    #[tokio::test]
    async fn test_refresh_replaces_state() {
        let (source, coordinator) = coordinator();
        assert_eq!(coordinator.data(), None);

        source.push_ok(true, 0x0003);
        let cached = coordinator.refresh().await.unwrap();

        assert_eq!(cached.origin, StateOrigin::Confirmed);
        assert_eq!(
            coordinator.state(),
            Some(DeviceState {
                enabled: true,
                mode_value: 0x0003
            })
        );
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_state() {
        let (source, coordinator) = coordinator();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let coordinator = coordinator.with_events(tx);

        source.push_ok(true, 0x0005);
        source.push_err();
        let before = coordinator.refresh().await.unwrap();

        let err = coordinator.refresh().await.unwrap_err();
        assert_eq!(err, UpdateFailed("radio down".to_string()));
        assert_eq!(coordinator.data(), Some(before));

        assert_eq!(rx.recv().await, Some(DeviceEvent::StateUpdated(before)));
        assert_eq!(
            rx.recv().await,
            Some(DeviceEvent::UpdateFailed("radio down".to_string()))
        );
    }

    #[tokio::test]
    async fn test_first_refresh_propagates_failure() {
        let (source, coordinator) = coordinator();
        source.push_err();

        assert!(coordinator.first_refresh().await.is_err());
        assert_eq!(coordinator.data(), None);
    }

    #[tokio::test]
    async fn test_polling_gate_skips_source() {
        let (source, coordinator) = coordinator();
        source.push_ok(true, 0x0008);
        let confirmed = coordinator.refresh().await.unwrap();

        coordinator.set_polling_enabled(false);
        for _ in 0..5 {
            assert_eq!(coordinator.refresh().await.unwrap(), confirmed);
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_polling_gate_before_first_read() {
        let (source, coordinator) = coordinator();
        coordinator.set_polling_enabled(false);

        let cached = coordinator.refresh().await.unwrap();
        assert_eq!(cached.state, DeviceState::default());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_tentative_state_is_superseded() {
        let (source, coordinator) = coordinator();
        assert_eq!(coordinator.apply_tentative(|s| s.enabled = true), None);

        source.push_ok(false, 0x0002);
        coordinator.refresh().await.unwrap();

        let tentative = coordinator
            .apply_tentative(|s| {
                s.enabled = true;
                s.mode_value = 0x0007;
            })
            .unwrap();
        assert_eq!(tentative.origin, StateOrigin::Tentative);
        assert_eq!(coordinator.data(), Some(tentative));

        // The device reports something else entirely; nothing of the
        // tentative value survives
        source.push_ok(false, 0x0004);
        let confirmed = coordinator.refresh().await.unwrap();
        assert_eq!(confirmed.origin, StateOrigin::Confirmed);
        assert_eq!(
            confirmed.state,
            DeviceState {
                enabled: false,
                mode_value: 0x0004
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_on_timer_and_request() {
        let (source, coordinator) = coordinator();
        for _ in 0..3 {
            source.push_ok(true, 0x0006);
        }
        let coordinator = Arc::new(coordinator);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let runner = coordinator.clone();
        let handle = tokio::spawn(async move {
            runner
                .run(async {
                    let _ = stop_rx.await;
                })
                .await;
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls(), 0);

        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        assert_eq!(source.calls(), 1);

        coordinator.request_refresh();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 2);

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_respects_gate() {
        let (source, coordinator) = coordinator();
        coordinator.set_polling_enabled(false);
        let coordinator = Arc::new(coordinator);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let runner = coordinator.clone();
        let handle = tokio::spawn(async move {
            runner
                .run(async {
                    let _ = stop_rx.await;
                })
                .await;
        });

        tokio::time::sleep(DEFAULT_POLL_INTERVAL * 4 + Duration::from_secs(1)).await;
        assert_eq!(source.calls(), 0);
        assert!(coordinator.data().is_some());

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
