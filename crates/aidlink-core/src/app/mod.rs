//! App - ViewModel（composition root）
//!
//! 関心ごと（listing 詳細・リクエスト状態・認証フラグ・一覧）ごとに
//! PollingSynchronizer を 1 つずつ持ち、互いにブロックしないようにする。
//! UI には不変の snapshot を `tokio::sync::watch` で公開する。
//!
//! # ロック順序
//! synchronizer の gate → ViewModel の state。apply は gate の下で呼ばれるので、
//! state のロックを持ったまま synchronizer を触ってはいけない。

pub mod collection_view;
pub mod listing_view;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    CollectionQuery, Listing, ListingId, ListingSummary, RequestOutcome, SyncError, UserId,
    UserVerification,
};
use crate::ports::ListingService;
use crate::sync::Fetch;

pub use self::collection_view::{CollectionSnapshot, ListingCollectionViewModel};
pub use self::listing_view::{ListingSnapshot, ListingViewModel};

/// Role は画面を見ているアカウントの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    PublicUser,
    Organization,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: UserId,
    pub role: Role,
}

impl Viewer {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    /// listing を作った organization だけが owner
    pub fn owns(&self, listing: &Listing) -> bool {
        self.role == Role::Organization && listing.organization_id.is_account(&self.user_id)
    }
}

pub(crate) fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// ServiceFetch は ListingService を各 concern の `Fetch` につなぐ
pub(crate) struct ServiceFetch(pub(crate) Arc<dyn ListingService>);

#[async_trait]
impl Fetch<ListingId, Listing> for ServiceFetch {
    async fn fetch(&self, key: &ListingId) -> Result<Listing, SyncError> {
        self.0.fetch_listing(key).await
    }
}

#[async_trait]
impl Fetch<(ListingId, UserId), RequestOutcome> for ServiceFetch {
    async fn fetch(&self, key: &(ListingId, UserId)) -> Result<RequestOutcome, SyncError> {
        self.0.fetch_request_status(&key.0, &key.1).await
    }
}

#[async_trait]
impl Fetch<UserId, UserVerification> for ServiceFetch {
    async fn fetch(&self, key: &UserId) -> Result<UserVerification, SyncError> {
        self.0.fetch_verification(key).await
    }
}

#[async_trait]
impl Fetch<CollectionQuery, Vec<ListingSummary>> for ServiceFetch {
    async fn fetch(&self, key: &CollectionQuery) -> Result<Vec<ListingSummary>, SyncError> {
        self.0.fetch_listings(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::listing::fixtures::listing;
    use crate::domain::ListingStatus;
    use rstest::rstest;

    #[rstest]
    #[case::owning_org(Role::Organization, 9, true)]
    #[case::other_org(Role::Organization, 10, false)]
    #[case::public_with_same_raw_id(Role::PublicUser, 9, false)]
    #[case::admin(Role::Admin, 9, false)]
    fn ownership_requires_the_creating_organization(
        #[case] role: Role,
        #[case] user: u64,
        #[case] expected: bool,
    ) {
        let viewer = Viewer::new(UserId::from(user), role);
        assert_eq!(viewer.owns(&listing(ListingStatus::Active)), expected);
    }
}
