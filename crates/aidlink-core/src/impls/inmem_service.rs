//! InMemoryListingService - 開発・テスト用の listing サービス
//!
//! サーバー側のチェック（未認証 403、重複 400、存在しない listing 404）を
//! 同じ順序で再現するので、ViewModel をネットワークなしで end-to-end に動かせる。
//!
//! # 学習ポイント
//! - `Arc<Mutex<_>>` を Clone で共有し、テストから「サーバー側」の状態を書き換える
//! - 遅延レスポンスは「呼び出し時点の値を取ってから sleep」で作る（追い越しの再現）

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    AcceptedUser, CollectionQuery, Listing, ListingId, ListingStatus, ListingSummary,
    RequestOutcome, Submission, SyncError, UserId, UserVerification,
};
use crate::ports::ListingService;

#[derive(Default)]
struct Inner {
    listings: HashMap<ListingId, Listing>,
    users: HashMap<UserId, bool>,
    requests: HashMap<(ListingId, UserId), RequestOutcome>,
    accepted: HashMap<ListingId, Vec<AcceptedUser>>,
    /// 次の request status 取得だけ遅らせる
    request_status_delay: Option<Duration>,
    /// 次の verification 取得だけ遅らせる
    verification_delay: Option<Duration>,
    /// 次の一覧取得だけ遅らせる
    listings_delay: Option<Duration>,
    /// true の間、listing 取得は 503 を返す
    listing_unavailable: bool,
}

/// InMemoryListingService はテストから台本を書ける listing/request サービス
#[derive(Clone, Default)]
pub struct InMemoryListingService {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryListingService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_listing(&self, listing: Listing) {
        self.lock().listings.insert(listing.id.clone(), listing);
    }

    pub fn insert_user(&self, user: UserId, is_verified: bool) {
        self.lock().users.insert(user, is_verified);
    }

    pub fn set_listing_status(&self, id: &ListingId, status: ListingStatus) {
        if let Some(listing) = self.lock().listings.get_mut(id) {
            listing.status = status;
        }
    }

    pub fn set_listing_unavailable(&self, unavailable: bool) {
        self.lock().listing_unavailable = unavailable;
    }

    /// 次の request status 応答を遅らせる。返す値は呼ばれた時点のもの
    pub fn delay_next_request_status(&self, delay: Duration) {
        self.lock().request_status_delay = Some(delay);
    }

    /// 次の verification 応答を遅らせる。フラグは呼ばれた時点のもの
    pub fn delay_next_verification(&self, delay: Duration) {
        self.lock().verification_delay = Some(delay);
    }

    /// 次の一覧応答を遅らせる。行は呼ばれた時点で確定する
    pub fn delay_next_listings(&self, delay: Duration) {
        self.lock().listings_delay = Some(delay);
    }

    pub fn set_request_outcome(&self, listing: &ListingId, user: &UserId, outcome: RequestOutcome) {
        self.lock()
            .requests
            .insert((listing.clone(), user.clone()), outcome);
    }

    /// 割り当てを終える。`accepted` の pending は Accepted、残りは Rejected、
    /// listing は Completed になる
    pub fn complete_allocation(&self, listing: &ListingId, accepted: &[AcceptedUser]) {
        let mut inner = self.lock();
        for ((l, user), outcome) in inner.requests.iter_mut() {
            if l != listing || *outcome != RequestOutcome::Pending {
                continue;
            }
            *outcome = if accepted.iter().any(|a| &a.id == user) {
                RequestOutcome::Accepted
            } else {
                RequestOutcome::Rejected
            };
        }
        inner.accepted.insert(listing.clone(), accepted.to_vec());
        if let Some(l) = inner.listings.get_mut(listing) {
            l.status = ListingStatus::Completed;
        }
    }

    pub fn request_outcome(&self, listing: &ListingId, user: &UserId) -> RequestOutcome {
        self.lock()
            .requests
            .get(&(listing.clone(), user.clone()))
            .copied()
            .unwrap_or_default()
    }
}

fn not_found(endpoint: String, what: &str) -> SyncError {
    SyncError::Status {
        endpoint,
        status: 404,
        message: format!("{what} not found"),
    }
}

fn summary(listing: &Listing) -> ListingSummary {
    ListingSummary {
        id: listing.id.clone(),
        organization_name: listing.organization_name.clone(),
        quantity: listing.quantity,
        distribution_time: listing.distribution_time,
        location_name: listing.location_name.clone(),
        resource_type: listing.resource_type.clone(),
        status: Some(listing.status),
        picture_url: listing.picture_url.clone(),
    }
}

#[async_trait]
impl ListingService for InMemoryListingService {
    async fn fetch_listing(&self, id: &ListingId) -> Result<Listing, SyncError> {
        let endpoint = format!("/listings/{}", id.as_str());
        let inner = self.lock();
        if inner.listing_unavailable {
            return Err(SyncError::Status {
                endpoint,
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        inner
            .listings
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(endpoint, "Listing"))
    }

    async fn fetch_request_status(
        &self,
        listing: &ListingId,
        user: &UserId,
    ) -> Result<RequestOutcome, SyncError> {
        let (outcome, delay) = {
            let mut inner = self.lock();
            let outcome = inner
                .requests
                .get(&(listing.clone(), user.clone()))
                .copied()
                .unwrap_or_default();
            (outcome, inner.request_status_delay.take())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(outcome)
    }

    async fn submit_request(&self, submission: &Submission) -> Result<(), SyncError> {
        let endpoint = format!("/request/{}", submission.listing_id.as_str());
        let mut inner = self.lock();
        let Some(&is_verified) = inner.users.get(&submission.user_id) else {
            return Err(not_found(endpoint, "User"));
        };
        if !is_verified {
            return Err(SyncError::Status {
                endpoint,
                status: 403,
                message: "User is not verified".to_string(),
            });
        }
        if !inner.listings.contains_key(&submission.listing_id) {
            return Err(not_found(endpoint, "Listing"));
        }
        let key = (submission.listing_id.clone(), submission.user_id.clone());
        if inner.requests.contains_key(&key) {
            return Err(SyncError::Status {
                endpoint,
                status: 400,
                message: "You have already requested this listing".to_string(),
            });
        }
        inner.requests.insert(key, RequestOutcome::Pending);
        Ok(())
    }

    async fn fetch_verification(&self, user: &UserId) -> Result<UserVerification, SyncError> {
        let endpoint = format!("/user/{}", user.as_str());
        let (reply, delay) = {
            let mut inner = self.lock();
            let reply = inner
                .users
                .get(user)
                .map(|&is_verified| UserVerification::new(user.clone(), is_verified))
                .ok_or_else(|| not_found(endpoint, "User"));
            (reply, inner.verification_delay.take())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }

    async fn fetch_accepted_users(&self, listing: &ListingId) -> Result<Vec<AcceptedUser>, SyncError> {
        Ok(self.lock().accepted.get(listing).cloned().unwrap_or_default())
    }

    /// `Nearby` は active な listing を全部返す（距離は見ない）
    async fn fetch_listings(&self, query: &CollectionQuery) -> Result<Vec<ListingSummary>, SyncError> {
        let (rows, delay) = {
            let mut inner = self.lock();
            if let CollectionQuery::Requested(user, _) = query
                && !inner.users.contains_key(user)
            {
                return Err(not_found(format!("/listings/requested/{}", user.as_str()), "User"));
            }
            let mut rows: Vec<ListingSummary> = inner
                .listings
                .values()
                .filter(|l| match query {
                    CollectionQuery::All => true,
                    CollectionQuery::Status(status) => l.status == *status,
                    CollectionQuery::Nearby(_) => l.status == ListingStatus::Active,
                    CollectionQuery::Requested(user, filter) => inner
                        .requests
                        .get(&(l.id.clone(), user.clone()))
                        .is_some_and(|outcome| {
                            *outcome != RequestOutcome::Absent && filter.is_none_or(|f| f == *outcome)
                        }),
                    CollectionQuery::Owned(org) => &l.organization_id == org,
                })
                .map(summary)
                .collect();
            rows.sort_by_key(|r| r.distribution_time);
            (rows, inner.listings_delay.take())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrganizationId;
    use crate::domain::listing::fixtures::listing;

    fn submission(user: u64) -> Submission {
        Submission {
            listing_id: ListingId::from(1),
            user_id: UserId::from(user),
        }
    }

    #[tokio::test]
    async fn submit_mirrors_server_checks() {
        let svc = InMemoryListingService::new();
        svc.insert_listing(listing(ListingStatus::Active));
        svc.insert_user(UserId::from(1), true);
        svc.insert_user(UserId::from(2), false);

        svc.submit_request(&submission(1)).await.unwrap();

        let duplicate = svc.submit_request(&submission(1)).await.unwrap_err();
        assert!(matches!(duplicate, SyncError::Status { status: 400, .. }));

        let unverified = svc.submit_request(&submission(2)).await.unwrap_err();
        assert!(unverified.is_unverified_rejection());

        assert_eq!(
            svc.request_outcome(&ListingId::from(1), &UserId::from(1)),
            RequestOutcome::Pending
        );
    }

    #[tokio::test]
    async fn allocation_decides_pending_requests() {
        let svc = InMemoryListingService::new();
        svc.insert_listing(listing(ListingStatus::Active));
        svc.insert_user(UserId::from(1), true);
        svc.insert_user(UserId::from(2), true);
        svc.submit_request(&submission(1)).await.unwrap();
        svc.submit_request(&submission(2)).await.unwrap();

        let winner = AcceptedUser {
            id: UserId::from(1),
            name: Some("Aiko".into()),
            location: None,
            address: None,
            telephone: None,
        };
        svc.complete_allocation(&ListingId::from(1), &[winner]);

        let id = ListingId::from(1);
        assert_eq!(svc.request_outcome(&id, &UserId::from(1)), RequestOutcome::Accepted);
        assert_eq!(svc.request_outcome(&id, &UserId::from(2)), RequestOutcome::Rejected);
        assert_eq!(svc.fetch_listing(&id).await.unwrap().status, ListingStatus::Completed);
        assert_eq!(svc.fetch_accepted_users(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn my_requests_and_my_listings_filter_by_owner() {
        let svc = InMemoryListingService::new();
        let mut other = listing(ListingStatus::Active);
        other.id = ListingId::from(2);
        other.organization_id = OrganizationId::from(10);
        svc.insert_listing(listing(ListingStatus::Active));
        svc.insert_listing(other);
        svc.insert_user(UserId::from(1), true);
        svc.submit_request(&submission(1)).await.unwrap();

        let user = UserId::from(1);
        let mine = svc
            .fetch_listings(&CollectionQuery::Requested(user.clone(), None))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, ListingId::from(1));

        let accepted = svc
            .fetch_listings(&CollectionQuery::Requested(user, Some(RequestOutcome::Accepted)))
            .await
            .unwrap();
        assert!(accepted.is_empty());

        let owned = svc
            .fetch_listings(&CollectionQuery::Owned(OrganizationId::from(10)))
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, ListingId::from(2));

        let unknown = svc
            .fetch_listings(&CollectionQuery::Requested(UserId::from(99), None))
            .await
            .unwrap_err();
        assert!(matches!(unknown, SyncError::Status { status: 404, .. }));
    }
}
