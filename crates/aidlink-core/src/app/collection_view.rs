//! ListingCollectionViewModel - 一覧（browse）画面
//!
//! public user は近くの active な listing、organization / admin は
//! ステータスでフィルタした一覧を見る。フィルタを変えると synchronizer を
//! 新しいキーで activate し直す（前のセッションは破棄される）。

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use super::{Role, ServiceFetch, Viewer, lock};
use crate::config::{ConfigError, SyncConfig};
use crate::domain::{
    Action, CollectionQuery, Countdown, ListingCollection, ListingSummary, OrganizationId,
    RequestOutcome, SyncError, UserId, UserVerification,
};
use crate::observability::PollStats;
use crate::ports::{Clock, ListingService, SystemClock};
use crate::sync::{Fetch, Observation, PollingSynchronizer};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionSnapshot {
    pub query: CollectionQuery,
    pub items: Vec<ListingSummary>,
    /// 認証済みの organization だけが listing を作れる
    pub can_create_listing: bool,
    pub stale: bool,
    pub last_error: Option<String>,
}

struct CollectionState {
    viewer: Viewer,
    query: CollectionQuery,
    collection: ListingCollection,
    verification: Option<UserVerification>,
    stale: bool,
    last_error: Option<String>,
}

impl CollectionState {
    fn snapshot(&self) -> CollectionSnapshot {
        CollectionSnapshot {
            query: self.query.clone(),
            items: self.collection.items().to_vec(),
            can_create_listing: self.viewer.role == Role::Organization
                && self
                    .verification
                    .as_ref()
                    .is_some_and(|v| v.permits(Action::CreateListing)),
            stale: self.stale,
            last_error: self.last_error.clone(),
        }
    }
}

type Snapshots = Arc<watch::Sender<CollectionSnapshot>>;

fn publish(state: &CollectionState, snapshots: &Snapshots) {
    let next = state.snapshot();
    snapshots.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// 画面を開いたときのクエリ
pub fn default_query(viewer: &Viewer) -> CollectionQuery {
    match viewer.role {
        Role::PublicUser => CollectionQuery::Nearby(viewer.user_id.clone()),
        Role::Organization | Role::Admin => CollectionQuery::All,
    }
}

/// 「My Requests」/「My Listings」タブのクエリ。admin には自分の分がない
pub fn own_query(viewer: &Viewer, outcome: Option<RequestOutcome>) -> Option<CollectionQuery> {
    match viewer.role {
        Role::PublicUser => Some(CollectionQuery::Requested(viewer.user_id.clone(), outcome)),
        Role::Organization => Some(CollectionQuery::Owned(OrganizationId::from(
            viewer.user_id.as_str(),
        ))),
        Role::Admin => None,
    }
}

pub struct ListingCollectionViewModel {
    viewer: Viewer,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<CollectionState>>,
    snapshots: Snapshots,
    sync: PollingSynchronizer<CollectionQuery, Vec<ListingSummary>>,
    verification_sync: PollingSynchronizer<UserId, UserVerification>,
}

impl ListingCollectionViewModel {
    pub fn new(service: Arc<dyn ListingService>, viewer: Viewer, config: SyncConfig) -> Self {
        let query = default_query(&viewer);
        let state = Arc::new(Mutex::new(CollectionState {
            viewer: viewer.clone(),
            query: query.clone(),
            collection: ListingCollection::new(),
            verification: None,
            stale: false,
            last_error: None,
        }));
        let initial = lock(&state).snapshot();
        let (tx, _) = watch::channel(initial);
        let snapshots: Snapshots = Arc::new(tx);
        let threshold = config.stale_after_failures;

        let fetch: Arc<dyn Fetch<CollectionQuery, Vec<ListingSummary>>> =
            Arc::new(ServiceFetch(Arc::clone(&service)));
        let sync = PollingSynchronizer::new("collection", fetch, {
            let state = Arc::clone(&state);
            let snapshots = Arc::clone(&snapshots);
            move |obs: Observation<Vec<ListingSummary>>| {
                let mut s = lock(&state);
                if s.collection.apply_remote(obs.seq, obs.value) {
                    s.stale = false;
                    s.last_error = None;
                    publish(&s, &snapshots);
                }
            }
        })
        .with_failure_hook({
            let state = Arc::clone(&state);
            let snapshots = Arc::clone(&snapshots);
            move |err: &SyncError, stats: &PollStats| {
                let mut s = lock(&state);
                s.stale = stats.is_stale(threshold);
                s.last_error = Some(err.to_string());
                publish(&s, &snapshots);
            }
        });

        let verification_fetch: Arc<dyn Fetch<UserId, UserVerification>> =
            Arc::new(ServiceFetch(service));
        let verification_sync = PollingSynchronizer::new("verification", verification_fetch, {
            let state = Arc::clone(&state);
            let snapshots = Arc::clone(&snapshots);
            move |obs: Observation<UserVerification>| {
                let mut s = lock(&state);
                s.verification = Some(obs.value);
                publish(&s, &snapshots);
            }
        });

        Self {
            viewer,
            config,
            clock: Arc::new(SystemClock),
            state,
            snapshots,
            sync,
            verification_sync,
        }
    }

    pub fn with_clock<C: Clock + Clone + 'static>(mut self, clock: C) -> Self {
        self.sync = self.sync.with_clock(clock.clone());
        self.verification_sync = self.verification_sync.with_clock(clock.clone());
        self.clock = Arc::new(clock);
        self
    }

    pub fn activate(&mut self) -> Result<(), ConfigError> {
        self.config.validate()?;
        let query = lock(&self.state).query.clone();
        self.sync.activate(query, self.config.collection_poll_interval)?;
        self.verification_sync
            .activate(self.viewer.user_id.clone(), self.config.verification_poll_interval)
    }

    pub fn deactivate(&mut self) {
        self.sync.deactivate();
        self.verification_sync.deactivate();
    }

    pub fn is_active(&self) -> bool {
        self.sync.is_active()
    }

    /// フィルタを切り替える。保持中のリストは捨て、active なら新しいクエリで
    /// ポーリングし直す（古いクエリの応答は破棄される）
    pub fn set_query(&mut self, query: CollectionQuery) -> Result<(), ConfigError> {
        if lock(&self.state).query == query {
            return Ok(());
        }
        // 古いクエリの応答が reset 後の空リストに入らないよう、先に gate を閉じる
        let was_active = self.sync.is_active();
        self.sync.deactivate();
        {
            let mut s = lock(&self.state);
            info!(from = ?s.query, to = ?query, "collection query changed");
            s.query = query.clone();
            s.collection.reset();
            s.last_error = None;
            s.stale = false;
            publish(&s, &self.snapshots);
        }
        if was_active {
            self.sync.activate(query, self.config.collection_poll_interval)?;
        }
        Ok(())
    }

    pub fn query(&self) -> CollectionQuery {
        lock(&self.state).query.clone()
    }

    pub fn refresh(&self) -> bool {
        self.sync.refresh()
    }

    pub fn snapshot(&self) -> CollectionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CollectionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn stats(&self) -> PollStats {
        self.sync.stats()
    }

    /// 1 行分の「N days N hours N minutes left to request」（clock 基準）
    pub fn countdown(&self, summary: &ListingSummary) -> Countdown {
        summary.request_window().countdown(self.clock.now())
    }
}
