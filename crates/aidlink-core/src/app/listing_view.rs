//! ListingViewModel - listing 詳細画面
//!
//! # 設計原則
//! - listing / request status / verification を別々の synchronizer で回す
//! - state machine は ViewModel が排他的に持ち、apply の中でだけ遷移させる
//! - snapshot は不変値。変わったときだけ watch で流す
//! - 失敗しても snapshot は消さない（stale フラグと last_error を立てるだけ）
//!
//! # 使用例
//! ```ignore
//! let mut vm = ListingViewModel::new(service, listing_id, viewer, config);
//! vm.activate()?;                       // focus
//! let mut rx = vm.subscribe();
//! rx.changed().await?;
//! vm.submit_request().await?;
//! vm.deactivate();                      // blur
//! ```

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Role, ServiceFetch, Viewer, lock};
use crate::config::{ConfigError, SyncConfig};
use crate::domain::{
    AcceptedUser, Action, AdmissionController, ErrorKind, Listing, ListingId, ListingStateMachine,
    ListingTransition, RequestOutcome, RequestStateMachine, RequestTransition, SyncError, UserId,
    UserVerification,
};
use crate::observability::PollStats;
use crate::ports::{Clock, ListingService};
use crate::sync::{Fetch, Observation, PollingSynchronizer};

/// ListingSnapshot は listing 画面が描画する値（apply のたびに作り直す）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListingSnapshot {
    pub listing: Option<Listing>,
    pub request: RequestOutcome,
    pub verification: Option<UserVerification>,
    /// closed = 割り当て処理中。ユーザーにできることはない
    pub allocation_in_progress: bool,
    pub can_request: bool,
    pub can_view_accepted_users: bool,
    /// どれかの concern が `stale_after_failures` 回続けて失敗した
    pub stale: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Concern {
    Listing = 0,
    Request = 1,
    Verification = 2,
}

struct ViewState {
    viewer: Viewer,
    listing: ListingStateMachine,
    request: RequestStateMachine,
    verification: Option<UserVerification>,
    /// 403 で取り消した時点の verification dispatch seq。これ以下の取得結果は古い
    revoked_through: u64,
    stale: [bool; 3],
    errors: [Option<String>; 3],
}

impl ViewState {
    fn new(viewer: Viewer) -> Self {
        Self {
            viewer,
            listing: ListingStateMachine::new(),
            request: RequestStateMachine::new(),
            verification: None,
            revoked_through: 0,
            stale: [false; 3],
            errors: Default::default(),
        }
    }

    fn mark_healthy(&mut self, concern: Concern) {
        self.stale[concern as usize] = false;
        self.errors[concern as usize] = None;
    }

    fn snapshot(&self) -> ListingSnapshot {
        let listing = self.listing.listing().cloned();
        let request = self.request.outcome();
        let can_request = self.viewer.role == Role::PublicUser
            && self.listing.accepts_requests()
            && request == RequestOutcome::Absent
            && self
                .verification
                .as_ref()
                .is_some_and(|v| v.permits(Action::SubmitRequest));
        let can_view_accepted_users = self.listing.accepted_users_unlocked()
            && listing.as_ref().is_some_and(|l| self.viewer.owns(l));

        ListingSnapshot {
            allocation_in_progress: self.listing.allocation_in_progress(),
            can_request,
            can_view_accepted_users,
            stale: self.stale.iter().any(|s| *s),
            last_error: self.errors.iter().flatten().next().cloned(),
            listing,
            request,
            verification: self.verification.clone(),
        }
    }
}

type Snapshots = Arc<watch::Sender<ListingSnapshot>>;

fn publish(state: &ViewState, snapshots: &Snapshots) {
    let next = state.snapshot();
    snapshots.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

fn failure_hook(
    concern: Concern,
    threshold: u32,
    state: &Arc<Mutex<ViewState>>,
    snapshots: &Snapshots,
) -> impl Fn(&SyncError, &PollStats) + Send + Sync + 'static {
    let state = Arc::clone(state);
    let snapshots = Arc::clone(snapshots);
    move |err: &SyncError, stats: &PollStats| {
        if err.kind() == ErrorKind::Malformed {
            warn!(?concern, error = %err, "malformed payload; keeping last known good snapshot");
        }
        let mut s = lock(&state);
        s.stale[concern as usize] = stats.is_stale(threshold);
        s.errors[concern as usize] = Some(err.to_string());
        publish(&s, &snapshots);
    }
}

pub struct ListingViewModel {
    listing_id: ListingId,
    viewer: Viewer,
    config: SyncConfig,
    service: Arc<dyn ListingService>,
    state: Arc<Mutex<ViewState>>,
    snapshots: Snapshots,
    listing_sync: PollingSynchronizer<ListingId, Listing>,
    request_sync: PollingSynchronizer<(ListingId, UserId), RequestOutcome>,
    verification_sync: PollingSynchronizer<UserId, UserVerification>,
}

impl ListingViewModel {
    pub fn new(
        service: Arc<dyn ListingService>,
        listing_id: ListingId,
        viewer: Viewer,
        config: SyncConfig,
    ) -> Self {
        let state = Arc::new(Mutex::new(ViewState::new(viewer.clone())));
        let (tx, _) = watch::channel(ListingSnapshot::default());
        let snapshots: Snapshots = Arc::new(tx);
        let threshold = config.stale_after_failures;

        let listing_fetch: Arc<dyn Fetch<ListingId, Listing>> =
            Arc::new(ServiceFetch(Arc::clone(&service)));
        let listing_sync = PollingSynchronizer::new("listing", listing_fetch, {
            let state = Arc::clone(&state);
            let snapshots = Arc::clone(&snapshots);
            move |obs: Observation<Listing>| {
                let mut s = lock(&state);
                let transition = s.listing.apply_remote(obs.seq, obs.value);
                if let Some(diagnostic) = transition.diagnostic() {
                    debug!(session = %obs.session, %diagnostic, "listing observation not applied as-is");
                }
                if matches!(transition, ListingTransition::Stale { .. }) {
                    return;
                }
                s.mark_healthy(Concern::Listing);
                publish(&s, &snapshots);
            }
        })
        .with_failure_hook(failure_hook(Concern::Listing, threshold, &state, &snapshots));

        let request_fetch: Arc<dyn Fetch<(ListingId, UserId), RequestOutcome>> =
            Arc::new(ServiceFetch(Arc::clone(&service)));
        let request_sync = PollingSynchronizer::new("request_status", request_fetch, {
            let state = Arc::clone(&state);
            let snapshots = Arc::clone(&snapshots);
            move |obs: Observation<RequestOutcome>| {
                let mut s = lock(&state);
                let transition = s.request.apply_remote(obs.seq, obs.value);
                if matches!(transition, RequestTransition::Stale { .. }) {
                    return;
                }
                if let RequestTransition::Applied { from, to } = transition {
                    info!(?from, ?to, seq = obs.seq, "request outcome changed");
                }
                s.mark_healthy(Concern::Request);
                publish(&s, &snapshots);
            }
        })
        .with_failure_hook(failure_hook(Concern::Request, threshold, &state, &snapshots));

        let verification_fetch: Arc<dyn Fetch<UserId, UserVerification>> =
            Arc::new(ServiceFetch(Arc::clone(&service)));
        let verification_sync = PollingSynchronizer::new("verification", verification_fetch, {
            let state = Arc::clone(&state);
            let snapshots = Arc::clone(&snapshots);
            move |obs: Observation<UserVerification>| {
                let mut s = lock(&state);
                if obs.seq <= s.revoked_through {
                    debug!(
                        seq = obs.seq,
                        revoked_through = s.revoked_through,
                        "verification fetched before the 403; ignoring"
                    );
                    return;
                }
                s.verification = Some(obs.value);
                s.mark_healthy(Concern::Verification);
                publish(&s, &snapshots);
            }
        })
        .with_failure_hook(failure_hook(Concern::Verification, threshold, &state, &snapshots));

        Self {
            listing_id,
            viewer,
            config,
            service,
            state,
            snapshots,
            listing_sync,
            request_sync,
            verification_sync,
        }
    }

    /// session id と `last_success_at` に `clock` を使う
    pub fn with_clock<C: Clock + Clone + 'static>(mut self, clock: C) -> Self {
        self.listing_sync = self.listing_sync.with_clock(clock.clone());
        self.request_sync = self.request_sync.with_clock(clock.clone());
        self.verification_sync = self.verification_sync.with_clock(clock);
        self
    }

    /// 画面がフォーカスを得た（冪等）
    ///
    /// 設定が不正なら何も始めずにエラーを返す。
    pub fn activate(&mut self) -> Result<(), ConfigError> {
        self.config.validate()?;
        self.listing_sync
            .activate(self.listing_id.clone(), self.config.listing_poll_interval)?;
        self.verification_sync
            .activate(self.viewer.user_id.clone(), self.config.verification_poll_interval)?;
        // リクエストを出せるのは public user だけ
        if self.viewer.role == Role::PublicUser {
            self.request_sync.activate(
                (self.listing_id.clone(), self.viewer.user_id.clone()),
                self.config.request_poll_interval,
            )?;
        }
        Ok(())
    }

    /// 画面がフォーカスを失った。戻った後は snapshot が変わらない
    pub fn deactivate(&mut self) {
        self.listing_sync.deactivate();
        self.request_sync.deactivate();
        self.verification_sync.deactivate();
    }

    pub fn is_active(&self) -> bool {
        self.listing_sync.is_active()
    }

    /// pull-to-refresh。どれか 1 つでも fetch を始めたら true
    pub fn refresh(&self) -> bool {
        let listing = self.listing_sync.refresh();
        let request = self.request_sync.refresh();
        let verification = self.verification_sync.refresh();
        listing || request || verification
    }

    pub fn snapshot(&self) -> ListingSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListingSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn listing_id(&self) -> &ListingId {
        &self.listing_id
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn listing_stats(&self) -> PollStats {
        self.listing_sync.stats()
    }

    pub fn request_stats(&self) -> PollStats {
        self.request_sync.stats()
    }

    pub fn verification_stats(&self) -> PollStats {
        self.verification_sync.stats()
    }

    /// viewer としてこの listing をリクエストする
    ///
    /// # フロー
    /// 1. AdmissionController でローカル判定（通らなければ POST しない）
    /// 2. POST が ack されてはじめて Pending に進む
    /// 3. 403 なら手元の認証フラグを取り消す
    pub async fn submit_request(&self) -> Result<RequestOutcome, SyncError> {
        if self.viewer.role != Role::PublicUser {
            return Err(SyncError::CapabilityLocked(
                "only public users can request listings".to_string(),
            ));
        }

        let submission = {
            let s = lock(&self.state);
            let Some(listing) = s.listing.listing() else {
                return Err(SyncError::CapabilityLocked(
                    "listing has not loaded yet".to_string(),
                ));
            };
            // 認証フラグ未取得なら未認証として扱う
            let requester = s
                .verification
                .clone()
                .unwrap_or_else(|| UserVerification::new(self.viewer.user_id.clone(), false));
            AdmissionController::request_listing(listing, &requester, s.request.outcome())?
        };

        match self.service.submit_request(&submission).await {
            Ok(()) => {
                let mut s = lock(&self.state);
                if let Err(err) = s.request.submit() {
                    // ack より先にポーリングが Pending を見ていた
                    debug!(error = %err, "request already observed by a poll");
                }
                info!(
                    listing_id = %submission.listing_id,
                    user_id = %submission.user_id,
                    "request submitted"
                );
                let outcome = s.request.outcome();
                publish(&s, &self.snapshots);
                Ok(outcome)
            }
            Err(err) if err.is_unverified_rejection() => {
                warn!(
                    listing_id = %submission.listing_id,
                    user_id = %submission.user_id,
                    error = %err,
                    "server rejected request as unverified; revoking cached verification"
                );
                let mut s = lock(&self.state);
                // この時点までに出ていた取得は 403 より古い
                s.revoked_through = self.verification_sync.dispatched_seq();
                s.verification
                    .get_or_insert_with(|| UserVerification::new(self.viewer.user_id.clone(), true))
                    .revoke();
                publish(&s, &self.snapshots);
                Err(err)
            }
            Err(err) => {
                warn!(listing_id = %submission.listing_id, error = %err, "request submission failed");
                Err(err)
            }
        }
    }

    /// completed な listing の当選者一覧（作成した organization だけ）
    pub async fn accepted_users(&self) -> Result<Vec<AcceptedUser>, SyncError> {
        {
            let s = lock(&self.state);
            let Some(listing) = s.listing.listing() else {
                return Err(SyncError::CapabilityLocked(
                    "listing has not loaded yet".to_string(),
                ));
            };
            if !self.viewer.owns(listing) {
                return Err(SyncError::CapabilityLocked(
                    "accepted users are visible to the owning organization only".to_string(),
                ));
            }
            if !s.listing.accepted_users_unlocked() {
                return Err(SyncError::CapabilityLocked(format!(
                    "accepted users unlock once the listing is completed (status={})",
                    listing.status.as_str()
                )));
            }
        }
        self.service.fetch_accepted_users(&self.listing_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::listing::fixtures::listing;
    use crate::domain::{AdmissionDenied, ListingStatus};
    use crate::impls::InMemoryListingService;
    use std::time::Duration;
    use tokio::time::sleep;

    const SETTLE: Duration = Duration::from_millis(10);

    fn public(user: u64) -> Viewer {
        Viewer::new(UserId::from(user), Role::PublicUser)
    }

    fn service(status: ListingStatus, user: u64, verified: bool) -> InMemoryListingService {
        let svc = InMemoryListingService::new();
        svc.insert_listing(listing(status));
        svc.insert_user(UserId::from(user), verified);
        svc
    }

    fn view_model(svc: &InMemoryListingService, viewer: Viewer) -> ListingViewModel {
        ListingViewModel::new(
            Arc::new(svc.clone()),
            ListingId::from(1),
            viewer,
            SyncConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn activation_loads_listing_and_verification() {
        let svc = service(ListingStatus::Active, 42, true);
        let mut vm = view_model(&svc, public(42));

        vm.activate().unwrap();
        sleep(SETTLE).await;

        let snap = vm.snapshot();
        assert_eq!(snap.listing.as_ref().map(|l| l.quantity), Some(5));
        assert_eq!(snap.request, RequestOutcome::Absent);
        assert!(snap.verification.as_ref().is_some_and(|v| v.is_verified));
        assert!(snap.can_request);
        assert!(!snap.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_moves_to_pending_after_ack() {
        let svc = service(ListingStatus::Active, 42, true);
        let mut vm = view_model(&svc, public(42));
        vm.activate().unwrap();
        sleep(SETTLE).await;

        let outcome = vm.submit_request().await.unwrap();

        assert_eq!(outcome, RequestOutcome::Pending);
        assert_eq!(vm.snapshot().request, RequestOutcome::Pending);
        assert!(!vm.snapshot().can_request);
        assert_eq!(
            svc.request_outcome(&ListingId::from(1), &UserId::from(42)),
            RequestOutcome::Pending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unverified_user_is_refused_before_the_network() {
        let svc = service(ListingStatus::Active, 42, false);
        let mut vm = view_model(&svc, public(42));
        vm.activate().unwrap();
        sleep(SETTLE).await;

        let err = vm.submit_request().await.unwrap_err();

        assert!(matches!(err, SyncError::Admission(AdmissionDenied::NotVerified)));
        assert_eq!(
            svc.request_outcome(&ListingId::from(1), &UserId::from(42)),
            RequestOutcome::Absent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn server_unverified_rejection_revokes_cached_flag() {
        let svc = service(ListingStatus::Active, 42, true);
        let mut vm = view_model(&svc, public(42));
        vm.activate().unwrap();
        sleep(SETTLE).await;
        assert!(vm.snapshot().can_request);

        // 管理者が認証を取り消したが、クライアントはまだ古いフラグを持っている
        svc.insert_user(UserId::from(42), false);
        let err = vm.submit_request().await.unwrap_err();

        assert!(err.is_unverified_rejection());
        let snap = vm.snapshot();
        assert!(snap.verification.as_ref().is_some_and(|v| !v.is_verified));
        assert!(!snap.can_request);
        assert_eq!(snap.request, RequestOutcome::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn verification_fetched_before_a_403_does_not_restore_the_flag() {
        let svc = service(ListingStatus::Active, 42, true);
        let mut vm = view_model(&svc, public(42));
        vm.activate().unwrap();
        sleep(SETTLE).await;

        // この取得は「認証済み」を掴んだまま 3 秒遅れる
        svc.delay_next_verification(Duration::from_secs(3));
        assert!(vm.refresh());
        sleep(SETTLE).await;

        svc.insert_user(UserId::from(42), false);
        let err = vm.submit_request().await.unwrap_err();
        assert!(err.is_unverified_rejection());
        assert!(!vm.snapshot().can_request);

        sleep(Duration::from_secs(4)).await;
        assert_eq!(vm.verification_stats().applied, 2);
        let snap = vm.snapshot();
        assert!(snap.verification.as_ref().is_some_and(|v| !v.is_verified));
        assert!(!snap.can_request);

        // 403 の後に出た取得は普通に反映される
        svc.insert_user(UserId::from(42), true);
        assert!(vm.refresh());
        sleep(SETTLE).await;
        assert!(vm.snapshot().can_request);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_period_refuses_to_activate() {
        let svc = service(ListingStatus::Active, 42, true);
        let config = SyncConfig {
            verification_poll_interval: Duration::ZERO,
            ..SyncConfig::default()
        };
        let mut vm = ListingViewModel::new(Arc::new(svc), ListingId::from(1), public(42), config);

        assert!(matches!(vm.activate(), Err(ConfigError::ZeroInterval(_))));
        assert!(!vm.is_active());
        assert_eq!(vm.listing_stats().fetches_started, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_listing_shows_allocation_in_progress() {
        let svc = service(ListingStatus::Active, 42, true);
        let mut vm = view_model(&svc, public(42));
        vm.activate().unwrap();
        sleep(SETTLE).await;

        svc.set_listing_status(&ListingId::from(1), ListingStatus::Closed);
        sleep(Duration::from_secs(5)).await;

        let snap = vm.snapshot();
        assert!(snap.allocation_in_progress);
        assert!(!snap.can_request);
        assert!(matches!(
            vm.submit_request().await,
            Err(SyncError::Admission(AdmissionDenied::NotActive(ListingStatus::Closed)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_users_unlock_for_owner_once_completed() {
        let svc = service(ListingStatus::Active, 9, true);
        let owner = Viewer::new(UserId::from(9), Role::Organization);
        let mut vm = view_model(&svc, owner);
        vm.activate().unwrap();
        sleep(SETTLE).await;

        assert!(matches!(
            vm.accepted_users().await,
            Err(SyncError::CapabilityLocked(_))
        ));

        svc.complete_allocation(&ListingId::from(1), &[]);
        sleep(Duration::from_secs(5)).await;

        assert!(vm.snapshot().can_view_accepted_users);
        assert_eq!(vm.accepted_users().await.unwrap(), Vec::new());
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_users_stay_locked_for_other_viewers() {
        let svc = service(ListingStatus::Completed, 42, true);
        let mut vm = view_model(&svc, public(42));
        vm.activate().unwrap();
        sleep(SETTLE).await;

        assert!(!vm.snapshot().can_view_accepted_users);
        assert!(matches!(
            vm.accepted_users().await,
            Err(SyncError::CapabilityLocked(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_flag_stale_but_keep_last_snapshot() {
        let svc = service(ListingStatus::Active, 42, true);
        let mut vm = view_model(&svc, public(42));
        vm.activate().unwrap();
        sleep(SETTLE).await;

        svc.set_listing_unavailable(true);
        // 3 tick 分失敗させる（5s 間隔、しきい値 3）
        sleep(Duration::from_secs(15)).await;

        let snap = vm.snapshot();
        assert!(snap.stale);
        assert!(snap.last_error.is_some());
        assert_eq!(snap.listing.as_ref().map(|l| l.status), Some(ListingStatus::Active));
        assert_eq!(vm.listing_stats().consecutive_failures, 3);

        svc.set_listing_unavailable(false);
        sleep(Duration::from_secs(5)).await;

        let snap = vm.snapshot();
        assert!(!snap.stale);
        assert_eq!(snap.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn no_snapshot_changes_after_deactivate() {
        let svc = service(ListingStatus::Active, 42, true);
        let mut vm = view_model(&svc, public(42));
        vm.activate().unwrap();
        sleep(SETTLE).await;
        vm.deactivate();

        svc.set_listing_status(&ListingId::from(1), ListingStatus::Closed);
        sleep(Duration::from_secs(30)).await;

        assert!(!vm.is_active());
        assert_eq!(
            vm.snapshot().listing.map(|l| l.status),
            Some(ListingStatus::Active)
        );
    }
}
