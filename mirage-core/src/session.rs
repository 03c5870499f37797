use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::behavior::{BehaviorEngine, BehaviorError};
use crate::device::{DeviceError, DeviceRegistry};
use crate::driver::{BrowserContext, BrowserDriver, DriverError, PageLink};
use crate::events::{EventBus, EventPayload, EventSink, SessionEvent};
use crate::pool::{ProxyPool, RotationPolicy};

pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that abort the call before a session exists. Driver failures are
/// not in here: those are recovered at the session boundary and reported as
/// a `Failed` record instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Behavior(#[from] BehaviorError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("session '{0}' is already active")]
    DuplicateSession(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Acquiring,
    Navigating,
    Interacting,
    Completing,
    Succeeded,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed)
    }
}

/// Immutable historical record of one finished session, ready for the
/// durable store.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub device: String,
    pub proxy: Option<String>,
    pub target_url: String,
    pub started_at: DateTime<Utc>,
    pub duration_s: f64,
    pub success: bool,
    pub state: SessionState,
    pub events: Vec<SessionEvent>,
}

#[derive(Debug, Clone)]
pub enum SessionTarget {
    Url(String),
    Query(String),
    RandomQuery,
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub session_id: Option<String>,
    pub target: SessionTarget,
    pub proxy_override: Option<String>,
}

impl SessionRequest {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            session_id: None,
            target: SessionTarget::Url(url.into()),
            proxy_override: None,
        }
    }

    pub fn query(query: impl Into<String>) -> Self {
        Self {
            session_id: None,
            target: SessionTarget::Query(query.into()),
            proxy_override: None,
        }
    }

    pub fn random_query() -> Self {
        Self {
            session_id: None,
            target: SessionTarget::RandomQuery,
            proxy_override: None,
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy_override = Some(proxy.into());
        self
    }
}

/// Candidate links considered for a click-through, counted from the top of
/// the page.
const MAX_CLICK_CANDIDATES: usize = 5;

/// Session ids seen by this orchestrator. An id stays in `retired` for the
/// whole run once its session has produced a record, so the durable store
/// never has a finished session overwritten by an id collision.
#[derive(Debug, Default)]
struct SessionLedger {
    active: HashSet<String>,
    retired: HashSet<String>,
}

/// Drives sessions through their lifecycle: acquire device and proxy, open
/// a browsing context, interact per the behavior engine, then release the
/// context and report the outcome back to the pool.
///
/// All collaborators are injected once at construction; the orchestrator
/// owns no global state beyond its session-id ledger.
pub struct Orchestrator {
    driver: Arc<dyn BrowserDriver>,
    pool: Arc<ProxyPool>,
    devices: DeviceRegistry,
    behavior: BehaviorEngine,
    bus: EventBus,
    policy: RotationPolicy,
    navigation_timeout: Duration,
    ledger: Mutex<SessionLedger>,
    seed: Option<u64>,
    rng_sequence: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        pool: Arc<ProxyPool>,
        devices: DeviceRegistry,
        behavior: BehaviorEngine,
        policy: RotationPolicy,
        navigation_timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            driver,
            pool,
            devices,
            behavior,
            bus: EventBus::new(),
            policy,
            navigation_timeout,
            ledger: Mutex::new(SessionLedger::default()),
            seed: None,
            rng_sequence: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Seeds the random source once for the whole run. Each session derives
    /// its generator from the seed plus a sequence number, so a seeded
    /// orchestrator replays the same decisions session for session.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn register_sink(&self, sink: Box<dyn EventSink>) {
        self.bus.register(sink);
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn active_count(&self) -> usize {
        self.ledger.lock().unwrap().active.len()
    }

    /// Cancels every in-flight session at its current suspension point.
    /// Cancellation surfaces as a driver failure inside each session, so the
    /// normal completion path (context release, terminal events, active-set
    /// removal) still runs.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn run_search_session(&self) -> SessionResult<SessionRecord> {
        self.run_session(SessionRequest::random_query()).await
    }

    pub async fn run_session(&self, request: SessionRequest) -> SessionResult<SessionRecord> {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        {
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.retired.contains(&session_id) || !ledger.active.insert(session_id.clone()) {
                return Err(SessionError::DuplicateSession(session_id));
            }
        }

        let outcome = self.drive(&session_id, request).await;

        // Ids of sessions that produced a record are retired for the run;
        // a request rejected before a session existed frees its id again.
        let mut ledger = self.ledger.lock().unwrap();
        ledger.active.remove(&session_id);
        if outcome.is_ok() {
            ledger.retired.insert(session_id);
        }
        outcome
    }

    async fn drive(
        &self,
        session_id: &str,
        request: SessionRequest,
    ) -> SessionResult<SessionRecord> {
        let mut rng = self.session_rng();
        let started_at = Utc::now();
        let started = Instant::now();
        let mut events = Vec::new();

        let target_url = match &request.target {
            SessionTarget::Url(url) => url.clone(),
            SessionTarget::Query(query) => search_url(query),
            SessionTarget::RandomQuery => search_url(&self.behavior.random_query(&mut rng)?),
        };

        let device = self.devices.random(&mut rng)?.clone();
        let proxy = request
            .proxy_override
            .clone()
            .or_else(|| self.pool.select(self.policy));

        let mut shutdown = self.shutdown.subscribe();
        let opened = self
            .race_shutdown(
                &mut shutdown,
                self.driver.open_context(&device, proxy.as_deref()),
            )
            .await;
        let mut context = match opened {
            Ok(context) => context,
            Err(err) => {
                // The proxy was never exercised, so the pool is not scored.
                warn!(session_id, error = %err, "failed to open browsing context");
                self.emit(
                    &mut events,
                    session_id,
                    EventPayload::Error {
                        message: err.to_string(),
                    },
                );
                let duration_s = started.elapsed().as_secs_f64();
                self.emit(
                    &mut events,
                    session_id,
                    EventPayload::SessionEnd {
                        success: false,
                        duration_s,
                    },
                );
                return Ok(SessionRecord {
                    session_id: session_id.to_string(),
                    device: device.name,
                    proxy,
                    target_url,
                    started_at,
                    duration_s,
                    success: false,
                    state: SessionState::Failed,
                    events,
                });
            }
        };

        self.emit(
            &mut events,
            session_id,
            EventPayload::SessionStart {
                device: device.name.clone(),
                target_url: target_url.clone(),
                proxy: proxy.clone(),
            },
        );

        let interaction = self
            .interact(
                context.as_mut(),
                &target_url,
                session_id,
                &mut events,
                &mut rng,
                &mut shutdown,
            )
            .await;
        let success = match interaction {
            Ok(()) => true,
            Err(err) => {
                warn!(session_id, error = %err, "session interaction failed");
                self.emit(
                    &mut events,
                    session_id,
                    EventPayload::Error {
                        message: err.to_string(),
                    },
                );
                false
            }
        };

        // Unconditional release, exactly once, even after an error.
        if let Err(err) = context.close().await {
            warn!(session_id, error = %err, "failed to close browsing context");
        }

        let duration_s = started.elapsed().as_secs_f64();
        self.emit(
            &mut events,
            session_id,
            EventPayload::SessionEnd {
                success,
                duration_s,
            },
        );
        if let Some(proxy_id) = &proxy {
            self.pool.record_outcome(proxy_id, success);
        }

        info!(session_id, success, duration_s, "session completed");
        Ok(SessionRecord {
            session_id: session_id.to_string(),
            device: device.name,
            proxy,
            target_url,
            started_at,
            duration_s,
            success,
            state: if success {
                SessionState::Succeeded
            } else {
                SessionState::Failed
            },
            events,
        })
    }

    async fn interact(
        &self,
        context: &mut dyn BrowserContext,
        target_url: &str,
        session_id: &str,
        events: &mut Vec<SessionEvent>,
        rng: &mut StdRng,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DriverError> {
        self.navigate_bounded(context, target_url, shutdown).await?;

        let dwell = self.behavior.dwell_time(rng);
        self.sleep_bounded(dwell, shutdown).await?;

        if self.behavior.should_scroll(rng) {
            let depth = self.behavior.scroll_depth(rng);
            let script =
                format!("window.scrollTo(0, document.body.scrollHeight * {depth} / 100);");
            context.evaluate(&script).await?;
            self.emit(events, session_id, EventPayload::Scroll { depth_pct: depth });
            let pause = Duration::from_millis(rng.gen_range(500..=1500));
            self.sleep_bounded(pause, shutdown).await?;
        }

        if self.behavior.should_click(rng) {
            let delay = self.behavior.click_delay(rng);
            self.sleep_bounded(delay, shutdown).await?;

            let links = context.query_links().await?;
            if let Some(link) = pick_candidate(&links, rng) {
                let href = link.href.clone();
                self.navigate_bounded(context, &href, shutdown).await?;
                self.emit(events, session_id, EventPayload::Click { url: href });
                let dwell = self.behavior.dwell_time(rng);
                self.sleep_bounded(dwell, shutdown).await?;
            }
        }

        Ok(())
    }

    async fn race_shutdown<T>(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        fut: impl std::future::Future<Output = Result<T, DriverError>>,
    ) -> Result<T, DriverError> {
        if *shutdown.borrow() {
            return Err(DriverError::Cancelled);
        }
        tokio::select! {
            result = fut => result,
            _ = shutdown.changed() => Err(DriverError::Cancelled),
        }
    }

    async fn navigate_bounded(
        &self,
        context: &mut dyn BrowserContext,
        url: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DriverError> {
        if *shutdown.borrow() {
            return Err(DriverError::Cancelled);
        }
        tokio::select! {
            result = tokio::time::timeout(self.navigation_timeout, context.navigate(url)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(DriverError::Timeout(format!("navigation to {url}"))),
                }
            }
            _ = shutdown.changed() => Err(DriverError::Cancelled),
        }
    }

    async fn sleep_bounded(
        &self,
        duration: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DriverError> {
        if *shutdown.borrow() {
            return Err(DriverError::Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = shutdown.changed() => Err(DriverError::Cancelled),
        }
    }

    fn session_rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => {
                let sequence = self.rng_sequence.fetch_add(1, Ordering::Relaxed);
                StdRng::seed_from_u64(seed.wrapping_add(sequence))
            }
            None => StdRng::from_entropy(),
        }
    }

    fn emit(&self, events: &mut Vec<SessionEvent>, session_id: &str, payload: EventPayload) {
        let event = SessionEvent::new(session_id, payload);
        self.bus.emit(&event);
        events.push(event);
    }
}

fn search_url(query: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    format!("https://www.google.com/search?q={encoded}")
}

fn pick_candidate<'a>(links: &'a [PageLink], rng: &mut impl Rng) -> Option<&'a PageLink> {
    let window = &links[..links.len().min(MAX_CLICK_CANDIDATES)];
    if window.is_empty() {
        return None;
    }
    Some(&window[rng.gen_range(0..window.len())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn search_url_encodes_the_query() {
        assert_eq!(
            search_url("rust async runtime"),
            "https://www.google.com/search?q=rust+async+runtime"
        );
    }

    #[test]
    fn candidate_pick_is_limited_to_first_five() {
        let links: Vec<PageLink> = (0..20)
            .map(|idx| PageLink {
                href: format!("https://site-{idx}.example/"),
            })
            .collect();
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        for _ in 0..100 {
            let link = pick_candidate(&links, &mut rng).unwrap();
            let idx: usize = link
                .href
                .trim_start_matches("https://site-")
                .trim_end_matches(".example/")
                .parse()
                .unwrap();
            assert!(idx < MAX_CLICK_CANDIDATES);
        }
    }

    #[test]
    fn candidate_pick_handles_empty_and_short_lists() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        assert!(pick_candidate(&[], &mut rng).is_none());
        let one = vec![PageLink {
            href: "https://only.example/".into(),
        }];
        assert_eq!(pick_candidate(&one, &mut rng).unwrap().href, one[0].href);
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(SessionState::Succeeded.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Interacting.is_terminal());
    }
}
