//! Backing store abstraction.
//!
//! The queue and the rate limiters only need a handful of primitives:
//! TTL'd keys with compare-and-swap, a list with an atomic blocking claim,
//! and score-ordered sets. Every state change that touches more than one
//! structure goes through a single atomic call, either
//! [`Store::compare_and_swap_with`] or [`Store::apply`], so a failed write
//! never leaves a job recorded in one place and missing from another.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueResult;

/// Shared store handle.
pub type SharedStore = Arc<dyn Store>;

/// Write applied atomically alongside a job update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    PushBack {
        list: String,
        value: String,
    },
    ZAdd {
        set: String,
        member: String,
        score: i64,
    },
    ZRem {
        set: String,
        member: String,
    },
    /// Drop members scored `<= max`
    ZRemRangeByScore {
        set: String,
        max: i64,
    },
}

impl WriteOp {
    /// Key the operation writes.
    pub fn key(&self) -> &str {
        match self {
            WriteOp::SetEx { key, .. } => key,
            WriteOp::PushBack { list, .. } => list,
            WriteOp::ZAdd { set, .. }
            | WriteOp::ZRem { set, .. }
            | WriteOp::ZRemRangeByScore { set, .. } => set,
        }
    }
}

/// One scope of an all-or-nothing sliding-window admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub key: String,
    pub window_ms: i64,
    pub limit: u32,
}

/// Result of a sliding-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Whether this call was recorded in the window
    pub admitted: bool,
    /// Entries in the window after the call
    pub count: u32,
    /// Oldest entry still inside the window (ms since epoch)
    pub oldest_ms: Option<i64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> QueueResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()>;

    /// Set only when the key is absent. Returns `true` if written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool>;

    /// Replace `expected` with `new` and apply `ops`, all in one step.
    /// Returns `false`, writing nothing, if the current value differs.
    async fn compare_and_swap_with(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
        ops: &[WriteOp],
    ) -> QueueResult<bool>;

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> QueueResult<bool> {
        self.compare_and_swap_with(key, expected, new, ttl, &[]).await
    }

    /// Apply every op or none.
    async fn apply(&self, ops: &[WriteOp]) -> QueueResult<()>;

    async fn del(&self, key: &str) -> QueueResult<()>;

    /// Append to the tail of a list, returning the new length.
    async fn push_back(&self, list: &str, value: &str) -> QueueResult<u64>;

    /// Pop the head of `list` and add it to the `claims` set at `score` in
    /// one step, waiting at most `timeout` for an entry.
    async fn claim_front(
        &self,
        list: &str,
        claims: &str,
        score: i64,
        timeout: Duration,
    ) -> QueueResult<Option<String>>;

    async fn list_len(&self, list: &str) -> QueueResult<u64>;

    /// Members with score `<= max`, lowest first.
    async fn zrange_by_score(&self, set: &str, max: i64, limit: usize) -> QueueResult<Vec<String>>;

    /// The `count` highest-scored members, lowest first.
    async fn zrange_last(&self, set: &str, count: usize) -> QueueResult<Vec<String>>;

    /// Returns `true` if this call removed the member.
    async fn zrem(&self, set: &str, member: &str) -> QueueResult<bool>;

    /// Remove members scored `<= max`, returning how many went.
    async fn zrem_range_by_score(&self, set: &str, max: i64) -> QueueResult<u64>;

    /// Move `member` from `set` to the tail of `list`. Only the caller that
    /// removed it from the set pushes it; returns whether that was this one.
    async fn zmove_to_list(&self, set: &str, member: &str, list: &str) -> QueueResult<bool>;

    async fn zcard(&self, set: &str) -> QueueResult<u64>;

    /// Purge entries `<= now_ms - window_ms` in every scope, then record
    /// `now_ms` in all of them if each has room, otherwise in none.
    async fn window_admit_all(&self, specs: &[WindowSpec], now_ms: i64) -> QueueResult<Vec<WindowState>>;

    /// Single-scope [`Store::window_admit_all`].
    async fn window_admit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> QueueResult<WindowState> {
        let spec = WindowSpec {
            key: key.to_string(),
            window_ms,
            limit,
        };
        let states = self.window_admit_all(std::slice::from_ref(&spec), now_ms).await?;
        Ok(states.into_iter().next().unwrap_or(WindowState {
            admitted: false,
            count: 0,
            oldest_ms: None,
        }))
    }

    /// Same purge as [`Store::window_admit`] without recording anything.
    async fn window_peek(&self, key: &str, now_ms: i64, window_ms: i64) -> QueueResult<WindowState>;

    async fn ping(&self) -> QueueResult<()>;
}
