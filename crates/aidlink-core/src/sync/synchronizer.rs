//! PollingSynchronizer - 画面がフォーカスされている間だけ正本を取りに行くループ
//!
//! `fetch(key) -> State` と `apply(Observation<State>)` についてジェネリック。
//! state machine 自体は知らない（apply の中で ViewModel が遷移させる）。
//!
//! # 使用例
//! ```ignore
//! let mut sync = PollingSynchronizer::new("listing", fetcher, move |obs| {
//!     machine.lock().unwrap().apply_remote(obs.seq, obs.value);
//! });
//! sync.activate(listing_id, Duration::from_millis(5000))?; // focus
//! sync.deactivate();                                        // blur / unmount
//! ```

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::session::{PollSession, SessionTask, Shared};
use crate::config::ConfigError;
use crate::domain::{SessionId, SyncError};
use crate::observability::PollStats;
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};

/// Observation は dispatch 時に振った seq 付きの取得結果
#[derive(Debug, Clone, PartialEq)]
pub struct Observation<S> {
    pub seq: u64,
    pub session: SessionId,
    pub value: S,
}

/// Fetch は `key` の正本を取ってくる
#[async_trait]
pub trait Fetch<K, S>: Send + Sync {
    async fn fetch(&self, key: &K) -> Result<S, SyncError>;
}

/// future を返すクロージャ用のアダプタ
pub struct FnFetch<F>(pub F);

#[async_trait]
impl<K, S, F, Fut> Fetch<K, S> for FnFetch<F>
where
    K: Clone + Send + Sync + 'static,
    S: Send + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S, SyncError>> + Send + 'static,
{
    async fn fetch(&self, key: &K) -> Result<S, SyncError> {
        (self.0)(key.clone()).await
    }
}

/// 適用する observation ごとに呼ばれる。synchronizer を呼び返してはいけない
pub type ApplyFn<S> = Arc<dyn Fn(Observation<S>) + Send + Sync>;

/// fetch 失敗のたびに、更新後の stats と一緒に呼ばれる
pub type FailureFn = Arc<dyn Fn(&SyncError, &PollStats) + Send + Sync>;

pub struct PollingSynchronizer<K, S> {
    name: &'static str,
    fetcher: Arc<dyn Fetch<K, S>>,
    apply: ApplyFn<S>,
    on_failure: Option<FailureFn>,
    fetch_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    shared: Arc<Shared>,
    session: Option<PollSession<K, S>>,
}

impl<K, S> PollingSynchronizer<K, S>
where
    K: Clone + PartialEq + Debug + Send + Sync + 'static,
    S: Send + 'static,
{
    pub fn new(
        name: &'static str,
        fetcher: Arc<dyn Fetch<K, S>>,
        apply: impl Fn(Observation<S>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            fetcher,
            apply: Arc::new(apply),
            on_failure: None,
            fetch_timeout: None,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            shared: Arc::new(Shared::new()),
            session: None,
        }
    }

    pub fn with_failure_hook(
        mut self,
        hook: impl Fn(&SyncError, &PollStats) + Send + Sync + 'static,
    ) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    /// 1 回の fetch の上限。省略時は poll interval
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn with_clock<C: Clock + Clone + 'static>(mut self, clock: C) -> Self {
        self.ids = Arc::new(UlidGenerator::new(clock.clone()));
        self.clock = Arc::new(clock);
        self
    }

    /// `key` を `interval` ごとにポーリングし始める（最初の 1 回は即時）
    ///
    /// - 同じ `key` で active なら何もしない
    /// - 別の `key` ならセッションを差し替える
    /// - `interval` が 0 ならエラー。今のセッションには触らない
    pub fn activate(&mut self, key: K, interval: Duration) -> Result<(), ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroInterval(format!("{} poll interval", self.name)));
        }
        if let Some(session) = &self.session {
            if *session.key() == key {
                debug!(poll = self.name, session = %session.id(), "already active; ignoring activate");
                return Ok(());
            }
            self.deactivate();
        }

        let generation = {
            let mut gate = self.shared.gate();
            gate.next_generation += 1;
            gate.live = Some(gate.next_generation);
            gate.next_generation
        };

        let task = Arc::new(SessionTask {
            name: self.name,
            id: self.ids.generate_session_id(),
            key,
            generation,
            fetch_timeout: self.fetch_timeout.unwrap_or(interval),
            in_flight: AtomicBool::new(false),
            fetcher: Arc::clone(&self.fetcher),
            apply: Arc::clone(&self.apply),
            on_failure: self.on_failure.clone(),
            clock: Arc::clone(&self.clock),
            shared: Arc::clone(&self.shared),
        });
        info!(
            poll = self.name,
            session = %task.id,
            key = ?task.key,
            generation,
            interval_ms = interval.as_millis() as u64,
            "poll session activated"
        );
        self.session = Some(PollSession::start(task, interval));
        Ok(())
    }

    /// ポーリングを止める。予定済みの tick はここで取り消し、
    /// in-flight の fetch は終わっても捨てられる
    pub fn deactivate(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.shared.gate().live = None;
        info!(poll = self.name, session = %session.id(), "poll session deactivated");
        drop(session);
    }

    /// 今すぐ 1 回 fetch する。in-flight があれば skip。始めたら true
    pub fn refresh(&self) -> bool {
        match &self.session {
            Some(session) => session.task.dispatch(),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&PollSession<K, S>> {
        self.session.as_ref()
    }

    pub fn stats(&self) -> PollStats {
        self.shared.stats().clone()
    }

    /// 直近に dispatch した fetch の seq。これ以下の observation はそれより前に出た fetch の結果
    pub fn dispatched_seq(&self) -> u64 {
        self.shared.dispatched_seq()
    }
}

impl<K, S> Drop for PollingSynchronizer<K, S> {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            self.shared.gate().live = None;
        }
    }
}
