//! Certificate Refresh Manager
//!
//! Keeps the short-lived client certificate valid. The manager arms a single
//! timer for the stored certificate's refresh time (pulled forward by a safety
//! margin), re-checks freshness when it fires, asks the issuer for a new
//! certificate when needed, persists it and arms the next cycle. Failures are
//! retried with a doubling delay.
//!
//! The host app and the tunnel process each own a manager over the same
//! store. Nothing locks across processes; the margin only makes it unlikely
//! that both refresh at once.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = CertificateRefreshManager::new(store, issuer, RefreshConfig::default());
//!
//! // Refresh now if the stored certificate is missing or stale
//! manager.check_refresh_certificate_now(features, false).await?;
//!
//! // Keep it fresh from here on
//! manager.start();
//!
//! // On shutdown
//! manager.stop();
//! ```

use crate::backoff::Backoff;
use crate::certificate::{CertificateWithFeatures, ConnectionFeatures};
use crate::clock::{Clock, SystemClock};
use crate::config::RefreshConfig;
use crate::issuance::{IssuanceClient, IssuanceError};
use crate::scheduler::RefreshScheduler;
use crate::store::{CertificateStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, info, warn};

/// Refresh manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    /// No timer armed (before `start`, after `stop`, or after giving up)
    Idle,
    /// Timer armed, waiting for the fire time
    Scheduled,
    /// A certificate request is in flight
    Refreshing,
}

/// Refresh errors
///
/// Only the explicit check surfaces these; the timer path logs and retries.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("No client keys stored; nothing to refresh")]
    NoKeysAvailable,

    #[error("Certificate refresh already in progress")]
    InProgress,

    #[error("Issuance failed: {0}")]
    Issuance(#[from] IssuanceError),

    #[error("Storing certificate failed: {0}")]
    Store(#[from] StoreError),
}

/// Marker for the refresh currently in flight
#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: u64,
    started: DateTime<Utc>,
}

struct Inner<S, C> {
    store: S,
    client: C,
    clock: Arc<dyn Clock>,
    config: RefreshConfig,
    scheduler: RefreshScheduler,
    backoff: Mutex<Backoff>,
    in_flight: Mutex<Option<InFlight>>,
    next_flight_id: AtomicU64,
}

/// Certificate lifecycle manager
///
/// Cheap to clone; clones share one timer and one backoff. Timer tasks hold
/// only a weak reference, so dropping every handle stops the cycle.
pub struct CertificateRefreshManager<S, C> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for CertificateRefreshManager<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: CertificateStore, C: IssuanceClient> CertificateRefreshManager<S, C> {
    /// Create a manager on the system clock
    pub fn new(store: S, client: C, config: RefreshConfig) -> Self {
        Self::with_clock(store, client, config, Arc::new(SystemClock))
    }

    /// Create a manager reading wall time from `clock`
    pub fn with_clock(store: S, client: C, config: RefreshConfig, clock: Arc<dyn Clock>) -> Self {
        let scheduler = RefreshScheduler::new(clock.clone(), config.max_tick());
        let backoff = Backoff::new(config.backoff_seed());

        Self {
            inner: Arc::new(Inner {
                store,
                client,
                clock,
                config,
                scheduler,
                backoff: Mutex::new(backoff),
                in_flight: Mutex::new(None),
                next_flight_id: AtomicU64::new(0),
            }),
        }
    }

    /// The underlying store
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Begin keeping the certificate fresh
    pub fn start(&self) {
        info!("Starting certificate refresh manager");
        self.plan_next_refresh();
    }

    /// Cancel the pending timer
    ///
    /// A request already in flight still completes and will arm the next
    /// cycle when it does.
    pub fn stop(&self) {
        info!("Stopping certificate refresh manager");
        self.inner.scheduler.cancel();
    }

    /// Current state
    pub fn state(&self) -> RefreshState {
        if lock(&self.inner.in_flight).is_some() {
            RefreshState::Refreshing
        } else if self.inner.scheduler.is_pending() {
            RefreshState::Scheduled
        } else {
            RefreshState::Idle
        }
    }

    /// When the pending timer fires
    pub fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
        self.inner.scheduler.next_fire_at()
    }

    /// Most recent retry delay handed out by the backoff
    pub fn last_retry_interval(&self) -> std::time::Duration {
        lock(&self.inner.backoff).last_retry_interval()
    }

    /// Arm the timer from the stored certificate
    ///
    /// Fires at the certificate's refresh time minus the safety margin,
    /// or right away if there is no certificate or that time has passed.
    /// Replaces any pending timer.
    pub fn plan_next_refresh(&self) {
        let now = self.inner.clock.now();
        let target = match self.inner.store.stored_certificate() {
            None => {
                info!("No current certificate. Refresh will start now.");
                now
            }
            Some(certificate) => {
                let deadline = certificate.refresh_deadline(self.margin());
                info!(
                    "Current cert is valid until: {}; refresh time: {}. Will be refreshed after: {}.",
                    certificate.valid_until, certificate.refresh_time, deadline
                );
                deadline.max(now)
            }
        };
        self.arm(target);
    }

    /// Refresh if needed, reporting the outcome to the caller
    ///
    /// Refreshes when there is no certificate, when `features` differ from
    /// the ones the stored certificate was issued for, when its refresh time
    /// has passed, or when `force` is set (e.g. a new API session, where the
    /// old certificate's key binding is gone). Does not touch the backoff.
    pub async fn check_refresh_certificate_now(
        &self,
        features: Option<ConnectionFeatures>,
        force: bool,
    ) -> Result<(), RefreshError> {
        if !force && !self.certificate_needs_refresh(features.as_ref()) {
            return Ok(());
        }
        self.refresh_certificate(features).await
    }

    /// Network became reachable; make sure the certificate is usable before
    /// traffic starts flowing
    pub async fn on_network_reachable(&self) {
        info!("Network became reachable. Will check for certificate now.");
        let features = self.inner.store.stored_features();
        match self.check_refresh_certificate_now(features, false).await {
            Ok(()) => debug!("Certificate check after network change completed"),
            Err(e) => warn!("Certificate check after network change failed: {}", e),
        }
    }

    fn margin(&self) -> Duration {
        to_chrono(self.inner.config.refresh_earlier_by())
    }

    /// Arm the timer for `target`; the fire runs `on_timer_fired`
    fn arm(&self, target: DateTime<Utc>) {
        let weak: Weak<Inner<S, C>> = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule_at(target, async move {
            if let Some(inner) = weak.upgrade() {
                let manager = CertificateRefreshManager { inner };
                manager.on_timer_fired().await;
            }
        });
    }

    /// Timer path: re-check, refresh, then re-arm or retry
    async fn on_timer_fired(&self) {
        let now = self.inner.clock.now();

        if let Some(certificate) = self.inner.store.stored_certificate() {
            if !certificate.needs_refresh_at(now, self.margin()) {
                // Woke early, or the other process already refreshed
                debug!(
                    "Timer fired before refresh time {}; re-planning",
                    certificate.refresh_deadline(self.margin())
                );
                self.plan_next_refresh();
                return;
            }
        }

        info!("Starting certificate refresh.");
        let features = self.inner.store.stored_features();
        match self.refresh_certificate(features).await {
            Ok(()) => {}
            Err(RefreshError::NoKeysAvailable) => {
                error!("Can't load current keys. Nothing to refresh. Giving up.");
            }
            Err(RefreshError::InProgress) => {
                // Whoever holds the refresh re-arms when it finishes; poll in
                // case it fails without doing so
                let recheck = after(now, self.inner.config.backoff_seed());
                debug!("Certificate refresh is in progress. Checking again at {}.", recheck);
                self.arm(recheck);
            }
            Err(e) => {
                let delay = lock(&self.inner.backoff).next_delay();
                let retry_at = after(self.inner.clock.now(), delay);
                warn!(
                    "Failed to refresh certificate: {}. Retrying in {:?} (at {}).",
                    e, delay, retry_at
                );
                self.arm(retry_at);
            }
        }
    }

    /// Request, persist, and re-arm
    async fn refresh_certificate(
        &self,
        features: Option<ConnectionFeatures>,
    ) -> Result<(), RefreshError> {
        let (keys, _flight) = {
            let now = self.inner.clock.now();
            let mut in_flight = lock(&self.inner.in_flight);

            if let Some(current) = *in_flight {
                if now - current.started < to_chrono(self.inner.config.refresh_timeout()) {
                    debug!("Certificate refresh is in progress (since {}). Skipping.", current.started);
                    return Err(RefreshError::InProgress);
                }
                warn!("Certificate refresh took too long. Resetting and refreshing again.");
            }

            let keys = self.inner.store.stored_keys().ok_or(RefreshError::NoKeysAvailable)?;

            let id = self.inner.next_flight_id.fetch_add(1, Ordering::Relaxed);
            *in_flight = Some(InFlight { id, started: now });
            (keys, FlightGuard { slot: &self.inner.in_flight, id })
        };

        let certificate = self
            .inner
            .client
            .refresh(keys.public.clone(), features.clone())
            .await?;

        info!(
            "Certificate refreshed, valid until {}, refresh at {}. Saving.",
            certificate.valid_until, certificate.refresh_time
        );
        self.inner.store.store_certificate(CertificateWithFeatures {
            certificate,
            features,
        })?;

        self.plan_next_refresh();
        Ok(())
    }

    fn certificate_needs_refresh(&self, features: Option<&ConnectionFeatures>) -> bool {
        let Some(certificate) = self.inner.store.stored_certificate() else {
            info!("Could not find stored certificate, refreshing.");
            return true;
        };

        if let Some(features) = features {
            match self.inner.store.stored_features() {
                None => {
                    info!("Could not find stored certificate features, refreshing.");
                    return true;
                }
                Some(stored) if &stored != features => {
                    info!("Features have been updated, refreshing.");
                    return true;
                }
                Some(_) => {}
            }
        }

        let now = self.inner.clock.now();
        if certificate.needs_refresh_at(now, self.margin()) {
            info!("Certificate might expire soon or has already expired, refreshing.");
            return true;
        }

        info!(
            "Certificate seems up to date! Will need to refresh in {}s",
            (certificate.refresh_time - now).num_seconds()
        );
        false
    }
}

/// Clears the in-flight marker when the refresh ends, however it ends
struct FlightGuard<'a> {
    slot: &'a Mutex<Option<InFlight>>,
    id: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        // A stuck refresh may have been superseded; leave the newer marker
        if slot.as_ref().map(|f| f.id) == Some(self.id) {
            *slot = None;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or(Duration::MAX)
}

fn after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{Certificate, NetShieldLevel};
    use crate::clock::test_clock::TestClock;
    use crate::keys::{KeyPair, PublicKey};
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::time::Duration as StdDuration;
    use tokio::time::sleep;

    /// Scripted issuer recording every call
    struct MockIssuer {
        clock: Arc<TestClock>,
        responses: Mutex<VecDeque<Result<Certificate, IssuanceError>>>,
        latency: StdDuration,
        calls: Mutex<Vec<(DateTime<Utc>, PublicKey, Option<ConnectionFeatures>)>>,
    }

    impl MockIssuer {
        fn new(clock: Arc<TestClock>) -> Self {
            Self {
                clock,
                responses: Mutex::new(VecDeque::new()),
                latency: StdDuration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_latency(mut self, latency: StdDuration) -> Self {
            self.latency = latency;
            self
        }

        fn respond(&self, response: Result<Certificate, IssuanceError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn fail(&self) {
            self.respond(Err(IssuanceError::Transport("connection reset".into())));
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn call_times(&self) -> Vec<DateTime<Utc>> {
            self.calls.lock().unwrap().iter().map(|c| c.0).collect()
        }
    }

    impl IssuanceClient for MockIssuer {
        fn refresh(
            &self,
            public_key: PublicKey,
            features: Option<ConnectionFeatures>,
        ) -> impl Future<Output = Result<Certificate, IssuanceError>> + Send {
            self.calls
                .lock()
                .unwrap()
                .push((self.clock.now(), public_key, features));
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(IssuanceError::Transport("no scripted response".into())));
            let latency = self.latency;
            async move {
                if !latency.is_zero() {
                    sleep(latency).await;
                }
                response
            }
        }
    }

    type TestManager = CertificateRefreshManager<Arc<MemoryStore>, Arc<MockIssuer>>;

    struct Fixture {
        clock: Arc<TestClock>,
        store: Arc<MemoryStore>,
        issuer: Arc<MockIssuer>,
        keys: KeyPair,
        manager: TestManager,
    }

    fn fixture() -> Fixture {
        fixture_with(RefreshConfig::default(), StdDuration::ZERO)
    }

    fn fixture_with(config: RefreshConfig, latency: StdDuration) -> Fixture {
        let clock = Arc::new(TestClock::new());
        let keys = KeyPair::generate();
        let store = Arc::new(MemoryStore::with_keys(keys.clone()));
        let issuer = Arc::new(MockIssuer::new(clock.clone()).with_latency(latency));
        let manager = CertificateRefreshManager::with_clock(
            store.clone(),
            issuer.clone(),
            config,
            clock.clone(),
        );
        Fixture { clock, store, issuer, keys, manager }
    }

    fn secs(s: i64) -> Duration {
        Duration::seconds(s)
    }

    /// Certificate whose refresh time is `refresh_in` from now
    fn cert_refreshing_in(clock: &TestClock, refresh_in: Duration) -> Certificate {
        let refresh = clock.now() + refresh_in;
        Certificate::new(
            format!("cert-{}", refresh.timestamp()),
            refresh + Duration::hours(1),
            refresh,
        )
    }

    fn put(store: &MemoryStore, certificate: Certificate) {
        store
            .store_certificate(CertificateWithFeatures { certificate, features: None })
            .unwrap();
    }

    async fn settle() {
        sleep(StdDuration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state_is_idle() {
        let f = fixture();
        assert_eq!(f.manager.state(), RefreshState::Idle);
        assert_eq!(f.manager.next_refresh_at(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_applies_margin() {
        let f = fixture();
        put(&f.store, cert_refreshing_in(&f.clock, Duration::hours(1)));

        f.manager.plan_next_refresh();

        assert_eq!(f.manager.next_refresh_at(), Some(f.clock.now() + secs(3540)));
        assert_eq!(f.manager.state(), RefreshState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_without_certificate_fires_now() {
        let f = fixture();

        f.manager.plan_next_refresh();

        assert_eq!(f.manager.next_refresh_at(), Some(f.clock.now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_clamps_past_refresh_time_to_now() {
        let f = fixture();
        put(&f.store, cert_refreshing_in(&f.clock, secs(-600)));

        f.manager.plan_next_refresh();

        assert_eq!(f.manager.next_refresh_at(), Some(f.clock.now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_with_earliest_timestamps_fires_now() {
        let f = fixture();
        put(
            &f.store,
            Certificate::new("ancient", DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MIN_UTC),
        );

        f.manager.plan_next_refresh();

        assert_eq!(f.manager.next_refresh_at(), Some(f.clock.now()));
        assert_eq!(f.manager.state(), RefreshState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replanning_leaves_one_timer() {
        let f = fixture();
        f.issuer.respond(Ok(cert_refreshing_in(&f.clock, Duration::days(1))));

        put(&f.store, cert_refreshing_in(&f.clock, secs(100)));
        f.manager.plan_next_refresh();
        put(&f.store, cert_refreshing_in(&f.clock, secs(200)));
        f.manager.plan_next_refresh();
        assert_eq!(f.manager.next_refresh_at(), Some(f.clock.now() + secs(140)));

        sleep(StdDuration::from_secs(1000)).await;

        assert_eq!(f.issuer.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stores_verbatim_and_rearms() {
        let f = fixture();
        let issued = cert_refreshing_in(&f.clock, Duration::hours(6));
        f.issuer.respond(Ok(issued.clone()));

        f.manager.start();
        settle().await;

        assert_eq!(f.store.stored_certificate(), Some(issued.clone()));
        assert_eq!(f.manager.next_refresh_at(), Some(issued.refresh_time - secs(60)));
        let calls = f.issuer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, f.keys.public);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_wake_replans_without_request() {
        let f = fixture();
        put(&f.store, cert_refreshing_in(&f.clock, secs(100)));
        f.manager.plan_next_refresh();

        // The other process refreshes; adjusted refresh time becomes 30s
        // past our fire time
        put(&f.store, cert_refreshing_in(&f.clock, secs(130)));
        sleep(StdDuration::from_secs(41)).await;

        assert_eq!(f.issuer.call_count(), 0);
        let replanned = f.manager.next_refresh_at().unwrap();
        assert_eq!((replanned - f.clock.now()).num_seconds(), 29);

        f.issuer.respond(Ok(cert_refreshing_in(&f.clock, Duration::days(1))));
        sleep(StdDuration::from_secs(30)).await;
        assert_eq!(f.issuer.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_back_off_exponentially() {
        let f = fixture();
        f.issuer.fail();
        f.issuer.fail();
        f.issuer.fail();
        f.issuer.respond(Ok(cert_refreshing_in(&f.clock, Duration::days(1))));

        f.manager.start();
        sleep(StdDuration::from_secs(200)).await;

        let times = f.issuer.call_times();
        assert_eq!(times.len(), 4);
        let gaps: Vec<i64> = times.windows(2).map(|w| (w[1] - w[0]).num_seconds()).collect();
        assert_eq!(gaps, vec![20, 40, 80]);
        assert!(f.store.stored_certificate().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_not_reset_by_success() {
        let f = fixture();
        f.issuer.fail();
        f.issuer.respond(Ok(cert_refreshing_in(&f.clock, secs(100))));
        f.issuer.fail();

        f.manager.start();
        // fail at 0, succeed at 20, next cycle at 40, fail again
        sleep(StdDuration::from_secs(61)).await;

        assert_eq!(f.issuer.call_count(), 3);
        assert_eq!(f.manager.last_retry_interval(), StdDuration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_keys_gives_up_without_retry() {
        let f = fixture();
        f.store.delete_keys().unwrap();

        f.manager.start();
        sleep(StdDuration::from_secs(3600)).await;

        assert_eq!(f.issuer.call_count(), 0);
        assert_eq!(f.manager.state(), RefreshState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_is_retried() {
        struct ReadOnlyStore(MemoryStore);

        impl CertificateStore for ReadOnlyStore {
            fn stored_certificate(&self) -> Option<Certificate> {
                self.0.stored_certificate()
            }
            fn stored_features(&self) -> Option<ConnectionFeatures> {
                self.0.stored_features()
            }
            fn stored_keys(&self) -> Option<KeyPair> {
                self.0.stored_keys()
            }
            fn store_certificate(&self, _: CertificateWithFeatures) -> Result<(), StoreError> {
                Err(StoreError::Io {
                    path: "certificate.json".into(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                })
            }
            fn store_keys(&self, keys: &KeyPair) -> Result<(), StoreError> {
                self.0.store_keys(keys)
            }
            fn delete_certificate(&self) -> Result<(), StoreError> {
                self.0.delete_certificate()
            }
            fn delete_keys(&self) -> Result<(), StoreError> {
                self.0.delete_keys()
            }
        }

        let clock = Arc::new(TestClock::new());
        let issuer = Arc::new(MockIssuer::new(clock.clone()));
        issuer.respond(Ok(cert_refreshing_in(&clock, Duration::hours(1))));
        let manager = CertificateRefreshManager::with_clock(
            ReadOnlyStore(MemoryStore::with_keys(KeyPair::generate())),
            issuer.clone(),
            RefreshConfig::default(),
            clock.clone(),
        );

        let started = clock.now();
        manager.start();
        settle().await;

        assert_eq!(issuer.call_count(), 1);
        assert_eq!(manager.next_refresh_at(), Some(started + secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_refreshes_on_feature_change() {
        let f = fixture();
        put(&f.store, cert_refreshing_in(&f.clock, Duration::hours(1)));
        let features = ConnectionFeatures {
            netshield: NetShieldLevel::Level1,
            ..ConnectionFeatures::default()
        };
        f.issuer.respond(Ok(cert_refreshing_in(&f.clock, Duration::hours(2))));

        f.manager
            .check_refresh_certificate_now(Some(features.clone()), false)
            .await
            .unwrap();

        assert_eq!(f.issuer.call_count(), 1);
        assert_eq!(f.store.stored_features(), Some(features.clone()));

        // Same features, fresh certificate: nothing to do
        f.manager
            .check_refresh_certificate_now(Some(features), false)
            .await
            .unwrap();
        assert_eq!(f.issuer.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_force_refreshes_fresh_certificate() {
        let f = fixture();
        put(&f.store, cert_refreshing_in(&f.clock, Duration::hours(1)));
        f.issuer.respond(Ok(cert_refreshing_in(&f.clock, Duration::hours(2))));

        f.manager.check_refresh_certificate_now(None, true).await.unwrap();

        assert_eq!(f.issuer.call_count(), 1);
        assert_eq!(f.manager.next_refresh_at(), Some(f.clock.now() + secs(7140)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_surfaces_errors_without_backoff() {
        let f = fixture();
        f.issuer.respond(Err(IssuanceError::SessionExpired));

        let result = f.manager.check_refresh_certificate_now(None, false).await;

        assert!(matches!(
            result,
            Err(RefreshError::Issuance(IssuanceError::SessionExpired))
        ));
        assert_eq!(f.manager.last_retry_interval(), StdDuration::from_secs(10));
        assert_eq!(f.manager.state(), RefreshState::Idle);

        f.store.delete_keys().unwrap();
        let result = f.manager.check_refresh_certificate_now(None, false).await;
        assert!(matches!(result, Err(RefreshError::NoKeysAvailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_is_rejected() {
        let f = fixture_with(RefreshConfig::default(), StdDuration::from_secs(30));
        f.issuer.respond(Ok(cert_refreshing_in(&f.clock, Duration::hours(1))));

        let first = tokio::spawn({
            let manager = f.manager.clone();
            async move { manager.check_refresh_certificate_now(None, false).await }
        });
        settle().await;
        assert_eq!(f.manager.state(), RefreshState::Refreshing);

        let second = f.manager.check_refresh_certificate_now(None, false).await;
        assert!(matches!(second, Err(RefreshError::InProgress)));

        first.await.unwrap().unwrap();
        assert_eq!(f.issuer.call_count(), 1);
        assert_eq!(f.manager.state(), RefreshState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_polls_while_check_in_flight() {
        let f = fixture_with(RefreshConfig::default(), StdDuration::from_secs(30));
        put(&f.store, cert_refreshing_in(&f.clock, secs(-600)));
        f.issuer.fail();

        let check = tokio::spawn({
            let manager = f.manager.clone();
            async move { manager.check_refresh_certificate_now(None, false).await }
        });
        settle().await;

        let fired_at = f.clock.now();
        f.manager.plan_next_refresh();
        settle().await;

        let poll_at = f.manager.next_refresh_at().unwrap();
        assert!(poll_at >= fired_at + secs(10) && poll_at <= fired_at + secs(11));
        assert_eq!(f.manager.last_retry_interval(), StdDuration::from_secs(10));
        assert_eq!(f.issuer.call_count(), 1);

        // The check fails without re-arming; a later poll takes over
        assert!(check.await.unwrap().is_err());
        f.issuer.respond(Ok(cert_refreshing_in(&f.clock, Duration::hours(1))));
        sleep(StdDuration::from_secs(15)).await;

        assert_eq!(f.issuer.call_count(), 2);
        assert_eq!(f.manager.last_retry_interval(), StdDuration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_refresh_is_superseded_after_timeout() {
        let config = RefreshConfig {
            refresh_timeout_secs: 60,
            ..RefreshConfig::default()
        };
        let f = fixture_with(config, StdDuration::from_secs(600));
        f.issuer.respond(Ok(cert_refreshing_in(&f.clock, Duration::hours(1))));
        f.issuer.respond(Ok(cert_refreshing_in(&f.clock, Duration::hours(2))));

        let _stuck = tokio::spawn({
            let manager = f.manager.clone();
            async move { manager.check_refresh_certificate_now(None, false).await }
        });
        sleep(StdDuration::from_secs(61)).await;

        let retry = tokio::spawn({
            let manager = f.manager.clone();
            async move { manager.check_refresh_certificate_now(None, false).await }
        });
        settle().await;

        assert_eq!(f.issuer.call_count(), 2);
        drop(retry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_cancel_in_flight_request() {
        let f = fixture_with(RefreshConfig::default(), StdDuration::from_secs(10));
        let issued = cert_refreshing_in(&f.clock, Duration::hours(1));
        f.issuer.respond(Ok(issued.clone()));

        f.manager.start();
        sleep(StdDuration::from_secs(1)).await;
        assert_eq!(f.manager.state(), RefreshState::Refreshing);

        f.manager.stop();
        sleep(StdDuration::from_secs(20)).await;

        // The request finished, stored its result and armed a new cycle
        assert_eq!(f.store.stored_certificate(), Some(issued));
        assert_eq!(f.manager.state(), RefreshState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_manager_stops_timer() {
        let f = fixture();
        f.manager.plan_next_refresh();

        drop(f.manager);
        sleep(StdDuration::from_secs(60)).await;

        assert_eq!(f.issuer.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_reachable_refreshes_stale_certificate() {
        let f = fixture();
        put(&f.store, cert_refreshing_in(&f.clock, secs(30)));
        f.issuer.respond(Ok(cert_refreshing_in(&f.clock, Duration::hours(1))));

        f.manager.on_network_reachable().await;

        assert_eq!(f.issuer.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wider_margin_process_wins_the_race() {
        // App and tunnel process share the store with different margins
        let clock = Arc::new(TestClock::new());
        let store = Arc::new(MemoryStore::with_keys(KeyPair::generate()));
        let app_issuer = Arc::new(MockIssuer::new(clock.clone()));
        let tunnel_issuer = Arc::new(MockIssuer::new(clock.clone()));
        tunnel_issuer.respond(Ok(cert_refreshing_in(&clock, Duration::hours(2))));

        let app = CertificateRefreshManager::with_clock(
            store.clone(),
            app_issuer.clone(),
            RefreshConfig::default(),
            clock.clone(),
        );
        let tunnel = CertificateRefreshManager::with_clock(
            store.clone(),
            tunnel_issuer.clone(),
            RefreshConfig { refresh_earlier_by_secs: 180, ..RefreshConfig::default() },
            clock.clone(),
        );

        put(&store, cert_refreshing_in(&clock, Duration::hours(1)));
        app.start();
        tunnel.start();
        sleep(StdDuration::from_secs(3600)).await;

        assert_eq!(tunnel_issuer.call_count(), 1);
        assert_eq!(app_issuer.call_count(), 0);
        app.stop();
        tunnel.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_margins_can_both_refresh() {
        // The margin reduces duplicate refreshes, it does not prevent them
        let clock = Arc::new(TestClock::new());
        let store = Arc::new(MemoryStore::with_keys(KeyPair::generate()));
        let first = Arc::new(MockIssuer::new(clock.clone()).with_latency(StdDuration::from_secs(5)));
        let second = Arc::new(MockIssuer::new(clock.clone()).with_latency(StdDuration::from_secs(6)));
        let first_cert = cert_refreshing_in(&clock, Duration::hours(3));
        let second_cert = cert_refreshing_in(&clock, Duration::hours(4));
        first.respond(Ok(first_cert));
        second.respond(Ok(second_cert.clone()));

        let a = CertificateRefreshManager::with_clock(
            store.clone(), first.clone(), RefreshConfig::default(), clock.clone());
        let b = CertificateRefreshManager::with_clock(
            store.clone(), second.clone(), RefreshConfig::default(), clock.clone());

        a.start();
        b.start();
        sleep(StdDuration::from_secs(10)).await;

        assert_eq!(first.call_count() + second.call_count(), 2);
        // Last writer wins
        assert_eq!(store.stored_certificate(), Some(second_cert));
    }
}
