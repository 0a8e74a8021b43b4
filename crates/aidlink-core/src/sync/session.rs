//! PollSession - 1 回の activate〜deactivate の間だけ生きるポーリング実体
//!
//! # 設計原則
//! - 1 セッションにつき in-flight の fetch は高々 1 つ（tick が重なったら skip、キューしない）
//! - fetch には dispatch 時点で単調増加の sequence 番号を振る
//! - 結果の適用は generation gate の下で行う。deactivate は同じ gate を取って
//!   live generation を外すので、deactivate が返った後に apply が走ることはない
//! - 失敗はログに残して次の tick で再試行（セッションは止めない）

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::synchronizer::{ApplyFn, FailureFn, Fetch, Observation};
use crate::domain::{SessionId, SyncError};
use crate::observability::PollStats;
use crate::ports::Clock;

/// Gate は今 apply してよい generation を持つ
#[derive(Debug, Default)]
pub(crate) struct Gate {
    pub(crate) live: Option<u64>,
    pub(crate) next_generation: u64,
}

/// 1 つの synchronizer の全セッションで共有する状態
pub(crate) struct Shared {
    pub(crate) gate: Mutex<Gate>,
    pub(crate) next_seq: AtomicU64,
    pub(crate) stats: Mutex<PollStats>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            gate: Mutex::new(Gate::default()),
            next_seq: AtomicU64::new(0),
            stats: Mutex::new(PollStats::default()),
        }
    }

    pub(crate) fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stats(&self) -> MutexGuard<'_, PollStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 最後に dispatch した fetch の seq（まだ 1 つも出していなければ 0）
    pub(crate) fn dispatched_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire)
    }
}

/// 動いているセッションが使うもの一式（ticker と各 fetch タスクが持つ）
pub(crate) struct SessionTask<K, S> {
    pub(crate) name: &'static str,
    pub(crate) id: SessionId,
    pub(crate) key: K,
    pub(crate) generation: u64,
    pub(crate) fetch_timeout: Duration,
    pub(crate) in_flight: AtomicBool,
    pub(crate) fetcher: Arc<dyn Fetch<K, S>>,
    pub(crate) apply: ApplyFn<S>,
    pub(crate) on_failure: Option<FailureFn>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) shared: Arc<Shared>,
}

impl<K, S> SessionTask<K, S>
where
    K: Debug + Send + Sync + 'static,
    S: Send + 'static,
{
    /// in-flight がなければ fetch を 1 つ始める。始めたら true
    pub(crate) fn dispatch(self: &Arc<Self>) -> bool {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.shared.stats().skipped_ticks += 1;
            debug!(poll = self.name, session = %self.id, "fetch still in flight; skipping tick");
            return false;
        }

        let seq = self.shared.next_seq.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.stats().fetches_started += 1;

        let task = Arc::clone(self);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(task.fetch_timeout, task.fetcher.fetch(&task.key)).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(task.fetch_timeout)),
            };
            task.in_flight.store(false, Ordering::Release);
            task.complete(seq, result);
        });
        true
    }

    fn complete(&self, seq: u64, result: Result<S, SyncError>) {
        // gate は apply が終わるまで保持する（deactivate との競合を潰す）
        let gate = self.shared.gate();
        if gate.live != Some(self.generation) {
            self.shared.stats().discarded += 1;
            debug!(
                poll = self.name,
                session = %self.id,
                seq,
                generation = self.generation,
                "session abandoned; discarding response"
            );
            return;
        }

        match result {
            Ok(value) => {
                {
                    let mut stats = self.shared.stats();
                    stats.applied += 1;
                    stats.consecutive_failures = 0;
                    stats.last_success_at = Some(self.clock.now());
                }
                (self.apply)(Observation {
                    seq,
                    session: self.id,
                    value,
                });
            }
            Err(err) => {
                let snapshot = {
                    let mut stats = self.shared.stats();
                    stats.failures += 1;
                    stats.consecutive_failures += 1;
                    stats.clone()
                };
                warn!(
                    poll = self.name,
                    session = %self.id,
                    key = ?self.key,
                    seq,
                    consecutive_failures = snapshot.consecutive_failures,
                    error = %err,
                    "poll fetch failed; retrying on next tick"
                );
                if let Some(on_failure) = &self.on_failure {
                    on_failure(&err, &snapshot);
                }
            }
        }
        drop(gate);
    }
}

/// PollSession は 1 回の activate 分。focus で作られ blur で drop される
pub struct PollSession<K, S> {
    pub(crate) task: Arc<SessionTask<K, S>>,
    pub(crate) interval: Duration,
    ticker: JoinHandle<()>,
}

impl<K, S> PollSession<K, S>
where
    K: Debug + Send + Sync + 'static,
    S: Send + 'static,
{
    /// ticker を spawn する。最初の tick は即時
    pub(crate) fn start(task: Arc<SessionTask<K, S>>, interval: Duration) -> Self {
        let ticking = Arc::clone(&task);
        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                ticking.dispatch();
            }
        });
        Self {
            task,
            interval,
            ticker,
        }
    }

    pub fn id(&self) -> SessionId {
        self.task.id
    }

    pub fn key(&self) -> &K {
        &self.task.key
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn generation(&self) -> u64 {
        self.task.generation
    }

    pub fn in_flight(&self) -> bool {
        self.task.in_flight.load(Ordering::Acquire)
    }
}

impl<K, S> Drop for PollSession<K, S> {
    fn drop(&mut self) {
        // スケジュール済みの tick を同期的に止める（in-flight の fetch は gate で無効化済み）
        self.ticker.abort();
    }
}
