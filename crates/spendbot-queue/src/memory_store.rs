//! In-process store.
//!
//! Used by tests and single-process deployments. All state sits behind one
//! mutex, so multi-key writes are atomic; blocking claims wait on a
//! [`Notify`] instead of polling.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use spendbot_models::{SharedClock, SystemClock};

use crate::error::{QueueError, QueueResult};
use crate::store::{Store, WindowSpec, WindowState, WriteOp};

#[derive(Default)]
struct Inner {
    values: HashMap<String, (String, Option<DateTime<Utc>>)>,
    lists: HashMap<String, VecDeque<String>>,
    sorted: HashMap<String, HashMap<String, i64>>,
    windows: HashMap<String, VecDeque<i64>>,
}

impl Inner {
    fn apply(&mut self, op: &WriteOp, now: DateTime<Utc>) {
        match op {
            WriteOp::SetEx { key, value, ttl } => {
                let expires_at = chrono::Duration::from_std(*ttl).ok().map(|ttl| now + ttl);
                self.values.insert(key.clone(), (value.clone(), expires_at));
            }
            WriteOp::PushBack { list, value } => {
                self.lists.entry(list.clone()).or_default().push_back(value.clone());
            }
            WriteOp::ZAdd { set, member, score } => {
                self.sorted.entry(set.clone()).or_default().insert(member.clone(), *score);
            }
            WriteOp::ZRem { set, member } => {
                if let Some(members) = self.sorted.get_mut(set) {
                    members.remove(member);
                }
            }
            WriteOp::ZRemRangeByScore { set, max } => {
                if let Some(members) = self.sorted.get_mut(set) {
                    members.retain(|_, score| *score > *max);
                }
            }
        }
    }

    fn purge_window(&mut self, key: &str, cutoff: i64) -> &mut VecDeque<i64> {
        let entries = self.windows.entry(key.to_string()).or_default();
        while entries.front().is_some_and(|ts| *ts <= cutoff) {
            entries.pop_front();
        }
        entries
    }
}

/// Thread-safe in-memory implementation of [`Store`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pushed: Notify,
    clock: SharedClock,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Key expiry is evaluated against `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            pushed: Notify::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with `StoreUnavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, Inner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::store_unavailable("memory store offline"));
        }
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn expiry(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl).ok().map(|ttl| self.clock.now() + ttl)
    }

    /// Apply `ops` under an already-held lock, waking blocked claims if any
    /// list grew.
    fn apply_locked(&self, mut inner: MutexGuard<'_, Inner>, ops: &[WriteOp]) {
        let now = self.clock.now();
        for op in ops {
            inner.apply(op, now);
        }
        drop(inner);
        if ops.iter().any(|op| matches!(op, WriteOp::PushBack { .. })) {
            self.pushed.notify_waiters();
        }
    }

    fn live_value(&self, inner: &mut Inner, key: &str) -> Option<String> {
        let now = self.clock.now();
        match inner.values.get(key) {
            Some((_, Some(expires_at))) if *expires_at <= now => {
                inner.values.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

fn window_state(entries: &VecDeque<i64>, admitted: bool) -> WindowState {
    WindowState {
        admitted,
        count: entries.len() as u32,
        oldest_ms: entries.front().copied(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut inner = self.lock()?;
        Ok(self.live_value(&mut inner, key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()> {
        let expires_at = self.expiry(ttl);
        let mut inner = self.lock()?;
        inner.values.insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool> {
        let expires_at = self.expiry(ttl);
        let mut inner = self.lock()?;
        if self.live_value(&mut inner, key).is_some() {
            return Ok(false);
        }
        inner.values.insert(key.to_string(), (value.to_string(), expires_at));
        Ok(true)
    }

    async fn compare_and_swap_with(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
        ops: &[WriteOp],
    ) -> QueueResult<bool> {
        let expires_at = self.expiry(ttl);
        let mut inner = self.lock()?;
        match self.live_value(&mut inner, key) {
            Some(current) if current == expected => {
                inner.values.insert(key.to_string(), (new.to_string(), expires_at));
                self.apply_locked(inner, ops);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply(&self, ops: &[WriteOp]) -> QueueResult<()> {
        let inner = self.lock()?;
        self.apply_locked(inner, ops);
        Ok(())
    }

    async fn del(&self, key: &str) -> QueueResult<()> {
        let mut inner = self.lock()?;
        inner.values.remove(key);
        Ok(())
    }

    async fn push_back(&self, list: &str, value: &str) -> QueueResult<u64> {
        let len = {
            let mut inner = self.lock()?;
            let entries = inner.lists.entry(list.to_string()).or_default();
            entries.push_back(value.to_string());
            entries.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn claim_front(
        &self,
        list: &str,
        claims: &str,
        score: i64,
        timeout: Duration,
    ) -> QueueResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait is not lost.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock()?;
                if let Some(value) = inner.lists.get_mut(list).and_then(|l| l.pop_front()) {
                    inner
                        .sorted
                        .entry(claims.to_string())
                        .or_default()
                        .insert(value.clone(), score);
                    return Ok(Some(value));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn list_len(&self, list: &str) -> QueueResult<u64> {
        let inner = self.lock()?;
        Ok(inner.lists.get(list).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn zrange_by_score(&self, set: &str, max: i64, limit: usize) -> QueueResult<Vec<String>> {
        let inner = self.lock()?;
        let Some(members) = inner.sorted.get(set) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<(&String, i64)> = members
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(m, s)| (m, *s))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(due.into_iter().take(limit).map(|(m, _)| m.clone()).collect())
    }

    async fn zrange_last(&self, set: &str, count: usize) -> QueueResult<Vec<String>> {
        let inner = self.lock()?;
        let Some(members) = inner.sorted.get(set) else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<(&String, i64)> = members.iter().map(|(m, s)| (m, *s)).collect();
        ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        let skip = ordered.len().saturating_sub(count);
        Ok(ordered.into_iter().skip(skip).map(|(m, _)| m.clone()).collect())
    }

    async fn zrem(&self, set: &str, member: &str) -> QueueResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner
            .sorted
            .get_mut(set)
            .map(|members| members.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zrem_range_by_score(&self, set: &str, max: i64) -> QueueResult<u64> {
        let mut inner = self.lock()?;
        let Some(members) = inner.sorted.get_mut(set) else {
            return Ok(0);
        };
        let before = members.len();
        members.retain(|_, score| *score > max);
        Ok((before - members.len()) as u64)
    }

    async fn zmove_to_list(&self, set: &str, member: &str, list: &str) -> QueueResult<bool> {
        let mut inner = self.lock()?;
        let removed = inner
            .sorted
            .get_mut(set)
            .is_some_and(|members| members.remove(member).is_some());
        if removed {
            let op = WriteOp::PushBack {
                list: list.to_string(),
                value: member.to_string(),
            };
            self.apply_locked(inner, std::slice::from_ref(&op));
        }
        Ok(removed)
    }

    async fn zcard(&self, set: &str) -> QueueResult<u64> {
        let inner = self.lock()?;
        Ok(inner.sorted.get(set).map(|m| m.len() as u64).unwrap_or(0))
    }

    async fn window_admit_all(&self, specs: &[WindowSpec], now_ms: i64) -> QueueResult<Vec<WindowState>> {
        let mut inner = self.lock()?;
        let admitted = specs.iter().all(|spec| {
            let entries = inner.purge_window(&spec.key, now_ms - spec.window_ms);
            (entries.len() as u32) < spec.limit
        });
        Ok(specs
            .iter()
            .map(|spec| {
                let entries = inner.purge_window(&spec.key, now_ms - spec.window_ms);
                if admitted {
                    // Timestamps arrive nearly ordered; keep the deque sorted anyway.
                    let pos = entries.partition_point(|ts| *ts <= now_ms);
                    entries.insert(pos, now_ms);
                }
                window_state(entries, admitted)
            })
            .collect())
    }

    async fn window_peek(&self, key: &str, now_ms: i64, window_ms: i64) -> QueueResult<WindowState> {
        let inner = self.lock()?;
        let cutoff = now_ms - window_ms;
        let live: VecDeque<i64> = inner
            .windows
            .get(key)
            .map(|entries| entries.iter().copied().filter(|ts| *ts > cutoff).collect())
            .unwrap_or_default();
        Ok(window_state(&live, false))
    }

    async fn ping(&self) -> QueueResult<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spendbot_models::ManualClock;
    use std::sync::Arc;

    fn store_with_clock() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::at_epoch();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn values_expire_against_injected_clock() {
        let (store, clock) = store_with_clock();
        store.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance_secs(10);
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_nx_ex("k", "w", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_swap_requires_exact_match() {
        let (store, _) = store_with_clock();
        let ttl = Duration::from_secs(60);
        store.set_ex("k", "a", ttl).await.unwrap();

        assert!(!store.compare_and_swap("k", "b", "c", ttl).await.unwrap());
        assert!(store.compare_and_swap("k", "a", "c", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("c"));
        assert!(!store.compare_and_swap("missing", "a", "c", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_swap_applies_ops_only_on_match() {
        let (store, _) = store_with_clock();
        let ttl = Duration::from_secs(60);
        store.set_ex("job", "queued", ttl).await.unwrap();
        let ops = [
            WriteOp::ZAdd {
                set: "retry".into(),
                member: "job".into(),
                score: 5,
            },
            WriteOp::PushBack {
                list: "dlq".into(),
                value: "job".into(),
            },
        ];

        assert!(!store.compare_and_swap_with("job", "running", "done", ttl, &ops).await.unwrap());
        assert_eq!(store.zcard("retry").await.unwrap(), 0);
        assert_eq!(store.list_len("dlq").await.unwrap(), 0);

        assert!(store.compare_and_swap_with("job", "queued", "done", ttl, &ops).await.unwrap());
        assert_eq!(store.get("job").await.unwrap().as_deref(), Some("done"));
        assert_eq!(store.zrange_by_score("retry", 5, 10).await.unwrap(), vec!["job"]);
        assert_eq!(store.list_len("dlq").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn offline_store_applies_nothing() {
        let (store, _) = store_with_clock();
        store.set_available(false);
        let ops = [WriteOp::PushBack {
            list: "q".into(),
            value: "a".into(),
        }];
        assert!(store.apply(&ops).await.unwrap_err().is_unavailable());
        store.set_available(true);
        assert_eq!(store.list_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_times_out_when_empty() {
        let store = MemoryStore::new();
        let started = tokio::time::Instant::now();
        let claimed = store
            .claim_front("q", "claims", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(claimed.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn claim_wakes_on_push_and_records_claim() {
        let store = Arc::new(MemoryStore::new());
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.claim_front("q", "claims", 42, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push_back("q", "job-1").await.unwrap();

        let claimed = waiter.await.unwrap().unwrap();
        assert_eq!(claimed.as_deref(), Some("job-1"));
        assert_eq!(store.list_len("q").await.unwrap(), 0);
        assert_eq!(store.zrange_by_score("claims", 42, 10).await.unwrap(), vec!["job-1"]);
    }

    #[tokio::test]
    async fn sorted_set_ranges_by_score() {
        let store = MemoryStore::new();
        let ops: Vec<WriteOp> = [("late", 300), ("early", 100), ("mid", 200)]
            .into_iter()
            .map(|(member, score)| WriteOp::ZAdd {
                set: "s".into(),
                member: member.into(),
                score,
            })
            .collect();
        store.apply(&ops).await.unwrap();

        assert_eq!(store.zrange_by_score("s", 250, 10).await.unwrap(), vec!["early", "mid"]);
        assert_eq!(store.zrange_last("s", 2).await.unwrap(), vec!["mid", "late"]);
        assert!(store.zrem("s", "mid").await.unwrap());
        assert!(!store.zrem("s", "mid").await.unwrap());
        assert_eq!(store.zrem_range_by_score("s", 100).await.unwrap(), 1);
        assert_eq!(store.zcard("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zmove_to_list_moves_once() {
        let store = MemoryStore::new();
        store
            .apply(&[WriteOp::ZAdd {
                set: "retry".into(),
                member: "job".into(),
                score: 1,
            }])
            .await
            .unwrap();

        assert!(store.zmove_to_list("retry", "job", "q").await.unwrap());
        assert!(!store.zmove_to_list("retry", "job", "q").await.unwrap());
        assert_eq!(store.list_len("q").await.unwrap(), 1);
        assert_eq!(store.zcard("retry").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn window_admission_is_all_or_nothing() {
        let store = MemoryStore::new();
        let specs = [
            WindowSpec {
                key: "user".into(),
                window_ms: 1_000,
                limit: 5,
            },
            WindowSpec {
                key: "global".into(),
                window_ms: 1_000,
                limit: 1,
            },
        ];
        let first = store.window_admit_all(&specs, 100).await.unwrap();
        assert!(first.iter().all(|s| s.admitted));

        let second = store.window_admit_all(&specs, 200).await.unwrap();
        assert!(second.iter().all(|s| !s.admitted));
        assert_eq!(second[0].count, 1);
        assert_eq!(second[1].count, 1);

        let single = store.window_admit("global", 1_100, 1_000, 1).await.unwrap();
        assert!(single.admitted);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_unavailable());
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
