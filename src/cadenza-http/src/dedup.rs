//! Single-flight coalescing of identical in-flight requests.
//!
//! The first caller for a key becomes the leader and runs the work; callers
//! arriving while the entry is registered join it and receive a clone of the
//! leader's outcome. Registration goes through the map's entry API, so two
//! callers can never both lead the same live entry. A caller arriving after
//! the leader has deregistered starts a new call.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::canonical::CanonicalKey;
use crate::error::HttpError;

type Outcome<T> = Option<Result<T, HttpError>>;

struct InFlightEntry<T> {
    outcome: watch::Sender<Outcome<T>>,
    created_at: Instant,
    expires_at: Instant,
    joiners: AtomicUsize,
}

impl<T> InFlightEntry<T> {
    fn new(now: Instant, request_timeout: Duration) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            outcome,
            created_at: now,
            expires_at: now + request_timeout,
            joiners: AtomicUsize::new(0),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn finish(&self, outcome: Result<T, HttpError>) {
        self.outcome.send_replace(Some(outcome));
    }
}

enum Role<T> {
    Leader(Arc<InFlightEntry<T>>),
    Joiner(Arc<InFlightEntry<T>>),
}

pub struct RequestDeduplicator<T> {
    in_flight: DashMap<CanonicalKey, Arc<InFlightEntry<T>>>,
}

impl<T> std::fmt::Debug for RequestDeduplicator<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestDeduplicator")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl<T> Default for RequestDeduplicator<T> {
    fn default() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `leader` unless an identical call is already in flight, in which
    /// case waits for that call's outcome instead.
    ///
    /// A joiner whose `cancel` fires returns [`HttpError::Cancelled`] without
    /// disturbing the leader. A leader whose `cancel` fires drops its work and
    /// every joiner receives the cancellation. A joiner still waiting when the
    /// entry's `request_timeout` elapses receives [`HttpError::LeaderExpired`].
    pub async fn execute<F, Fut>(
        &self,
        key: CanonicalKey,
        request_timeout: Duration,
        leader: F,
        cancel: &CancellationToken,
    ) -> Result<T, HttpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HttpError>>,
    {
        if cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }
        match self.register(&key, request_timeout) {
            Role::Leader(entry) => self.lead(key, entry, leader, cancel).await,
            Role::Joiner(entry) => join(key, entry, cancel).await,
        }
    }

    fn register(&self, key: &CanonicalKey, request_timeout: Duration) -> Role<T> {
        let now = Instant::now();
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) if !occupied.get().is_expired(now) => {
                let entry = occupied.get().clone();
                entry.joiners.fetch_add(1, Ordering::AcqRel);
                Role::Joiner(entry)
            }
            Entry::Occupied(mut occupied) => {
                let fresh = Arc::new(InFlightEntry::new(now, request_timeout));
                let stale = occupied.insert(fresh.clone());
                stale.finish(Err(HttpError::LeaderExpired {
                    key: key.to_string(),
                }));
                Role::Leader(fresh)
            }
            Entry::Vacant(vacant) => {
                let fresh = Arc::new(InFlightEntry::new(now, request_timeout));
                vacant.insert(fresh.clone());
                Role::Leader(fresh)
            }
        }
    }

    async fn lead<F, Fut>(
        &self,
        key: CanonicalKey,
        entry: Arc<InFlightEntry<T>>,
        leader: F,
        cancel: &CancellationToken,
    ) -> Result<T, HttpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HttpError>>,
    {
        let mut guard = LeaderGuard {
            in_flight: &self.in_flight,
            key,
            entry,
            completed: false,
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HttpError::Cancelled),
            outcome = leader() => outcome,
        };
        guard.complete(outcome.clone());
        outcome
    }

    /// Removes entries whose leader has outlived the request timeout and
    /// releases their joiners with [`HttpError::LeaderExpired`].
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut swept = Vec::new();
        self.in_flight.retain(|key, entry| {
            if entry.is_expired(now) {
                swept.push((key.clone(), entry.clone()));
                false
            } else {
                true
            }
        });
        for (key, entry) in &swept {
            tracing::warn!(
                key = %key,
                age_ms = now.duration_since(entry.created_at).as_millis() as u64,
                joiners = entry.joiners.load(Ordering::Acquire),
                "sweeping expired in-flight request"
            );
            entry.finish(Err(HttpError::LeaderExpired {
                key: key.to_string(),
            }));
        }
        swept.len()
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `interval` until
    /// `shutdown` fires or the deduplicator is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(dedup) = weak.upgrade() else {
                            break;
                        };
                        dedup.sweep_expired();
                    }
                }
            }
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

async fn join<T>(
    key: CanonicalKey,
    entry: Arc<InFlightEntry<T>>,
    cancel: &CancellationToken,
) -> Result<T, HttpError>
where
    T: Clone + Send + Sync + 'static,
{
    tracing::debug!(key = %key, "joining in-flight request");
    let mut outcome = entry.outcome.subscribe();
    let expires_at = tokio::time::Instant::from_std(entry.expires_at);
    let wait = async {
        match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    };
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HttpError::Cancelled),
        value = wait => value.unwrap_or_else(|| Err(HttpError::LeaderExpired { key: key.to_string() })),
        _ = tokio::time::sleep_until(expires_at) => Err(HttpError::LeaderExpired { key: key.to_string() }),
    };
    entry.joiners.fetch_sub(1, Ordering::AcqRel);
    result
}

/// Deregisters the leader's entry exactly once, even if the leader future is dropped.
struct LeaderGuard<'a, T> {
    in_flight: &'a DashMap<CanonicalKey, Arc<InFlightEntry<T>>>,
    key: CanonicalKey,
    entry: Arc<InFlightEntry<T>>,
    completed: bool,
}

impl<T> LeaderGuard<'_, T> {
    fn complete(&mut self, outcome: Result<T, HttpError>) {
        self.completed = true;
        self.deregister();
        let joiners = self.entry.joiners.load(Ordering::Acquire);
        if joiners > 0 {
            tracing::debug!(key = %self.key, joiners, "sharing outcome with joiners");
        }
        self.entry.finish(outcome);
    }

    fn deregister(&self) {
        // a swept entry may already have been replaced by a newer leader
        self.in_flight
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, &self.entry));
    }
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.deregister();
        self.entry.finish(Err(HttpError::LeaderExpired {
            key: self.key.to_string(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{canonicalize, KeyPolicy};
    use crate::request::HttpRequest;
    use std::sync::atomic::AtomicU32;

    fn key(url: &str) -> CanonicalKey {
        canonicalize(
            &HttpRequest::get(url).expect("request"),
            &KeyPolicy::default(),
        )
    }

    #[tokio::test]
    async fn concurrent_identical_calls_share_one_execution() {
        let dedup = Arc::new(RequestDeduplicator::<String>::new());
        let calls = Arc::new(AtomicU32::new(0));
        let mut tasks = Vec::new();
        for _ in 0..6 {
            let dedup = dedup.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                dedup
                    .execute(
                        key("https://api.example.com/search?q=abba"),
                        Duration::from_secs(5),
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok("result".to_string())
                        },
                        &CancellationToken::new(),
                    )
                    .await
            }));
        }
        for task in futures::future::join_all(tasks).await {
            assert_eq!(task.expect("task").expect("outcome"), "result");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_each_execute() {
        let dedup = RequestDeduplicator::<u32>::new();
        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            dedup
                .execute(
                    key("https://api.example.com/a"),
                    Duration::from_secs(5),
                    || async { Ok(calls.fetch_add(1, Ordering::SeqCst)) },
                    &CancellationToken::new(),
                )
                .await
                .expect("outcome");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn leader_errors_are_shared() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute(
                        key("https://api.example.com/a"),
                        Duration::from_secs(5),
                        || async {
                            tokio::time::sleep(Duration::from_millis(80)).await;
                            Err(HttpError::InvalidRequest {
                                message: "bad".into(),
                            })
                        },
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let joined = dedup
            .execute(
                key("https://api.example.com/a"),
                Duration::from_secs(5),
                || async { Ok(7) },
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(joined, Err(HttpError::InvalidRequest { .. })));
        assert!(leader.await.expect("leader").is_err());
    }

    #[tokio::test]
    async fn joiner_cancellation_leaves_leader_running() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute(
                        key("https://api.example.com/a"),
                        Duration::from_secs(5),
                        || async {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(1)
                        },
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let joined = dedup
            .execute(
                key("https://api.example.com/a"),
                Duration::from_secs(5),
                || async { Ok(2) },
                &cancel,
            )
            .await;
        assert!(matches!(joined, Err(HttpError::Cancelled)));
        assert_eq!(leader.await.expect("leader").expect("outcome"), 1);
    }

    #[tokio::test]
    async fn leader_cancellation_reaches_joiners() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let cancel = CancellationToken::new();
        let leader = {
            let dedup = dedup.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dedup
                    .execute(
                        key("https://api.example.com/a"),
                        Duration::from_secs(5),
                        || async {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            Ok(1)
                        },
                        &cancel,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let joiner = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute(
                        key("https://api.example.com/a"),
                        Duration::from_secs(5),
                        || async { Ok(2) },
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(matches!(
            leader.await.expect("leader"),
            Err(HttpError::Cancelled)
        ));
        assert!(matches!(
            joiner.await.expect("joiner"),
            Err(HttpError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn joiners_of_a_hung_leader_expire() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let _leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute(
                        key("https://api.example.com/slow"),
                        Duration::from_millis(50),
                        || async {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            Ok(1)
                        },
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let joined = dedup
            .execute(
                key("https://api.example.com/slow"),
                Duration::from_millis(50),
                || async { Ok(2) },
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(joined, Err(HttpError::LeaderExpired { .. })));
    }

    #[tokio::test]
    async fn dropped_leader_releases_joiners() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute(
                        key("https://api.example.com/a"),
                        Duration::from_secs(30),
                        || async {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            Ok(1)
                        },
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let joiner = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute(
                        key("https://api.example.com/a"),
                        Duration::from_secs(30),
                        || async { Ok(2) },
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let result = tokio::time::timeout(Duration::from_secs(2), joiner)
            .await
            .expect("joiner released")
            .expect("joiner task");
        assert!(matches!(result, Err(HttpError::LeaderExpired { .. })));
        assert_eq!(dedup.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries_and_next_caller_leads() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let _hung = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute(
                        key("https://api.example.com/a"),
                        Duration::from_millis(10),
                        || async {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            Ok(1)
                        },
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(dedup.in_flight_count(), 1);
        assert_eq!(dedup.sweep_expired(), 1);
        assert_eq!(dedup.in_flight_count(), 0);

        let fresh = dedup
            .execute(
                key("https://api.example.com/a"),
                Duration::from_secs(5),
                || async { Ok(9) },
                &CancellationToken::new(),
            )
            .await
            .expect("fresh leader");
        assert_eq!(fresh, 9);
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let shutdown = CancellationToken::new();
        let handle = dedup.spawn_sweeper(Duration::from_millis(5), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper stopped")
            .expect("sweeper task");
    }
}
