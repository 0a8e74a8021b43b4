//! ListingService port - listing/request サービスへのインターフェース
//!
//! サーバーが正本（source of truth）。このコアは結果（状態遷移）を観測するだけで、
//! 割り当てアルゴリズムの中身は知らない。
//!
//! # 実装
//! - **HttpListingService**: reqwest ベース（impls::http_service）
//! - テストではスクリプト化した in-memory 実装を使う

use async_trait::async_trait;

use crate::domain::{
    AcceptedUser, CollectionQuery, Listing, ListingId, ListingSummary, RequestOutcome,
    Submission, SyncError, UserId, UserVerification,
};

/// ListingService はコアから見た listing/request サービス
///
/// 1 メソッド = 1 往復。リトライとタイムアウトは synchronizer 側の責務
#[async_trait]
pub trait ListingService: Send + Sync {
    /// `GET /listings/{id}`
    async fn fetch_listing(&self, id: &ListingId) -> Result<Listing, SyncError>;

    /// `GET /request/status/{listingId}/{userId}`。404 は `Absent`
    async fn fetch_request_status(
        &self,
        listing: &ListingId,
        user: &UserId,
    ) -> Result<RequestOutcome, SyncError>;

    /// `POST /request/{listingId}`（body は `{user_id}`）
    async fn submit_request(&self, submission: &Submission) -> Result<(), SyncError>;

    /// `GET /user/{userId}`
    async fn fetch_verification(&self, user: &UserId) -> Result<UserVerification, SyncError>;

    /// `GET /listings/{id}/accepted`
    async fn fetch_accepted_users(&self, listing: &ListingId) -> Result<Vec<AcceptedUser>, SyncError>;

    /// クエリごとのエンドポイント:
    /// - `GET /listings[?status=]`
    /// - `GET /listings/nearby/{userId}`
    /// - `GET /listings/requested/{userId}[?status=]`（`{"listings": [...]}` で包まれる）
    /// - `GET /listings/org/{organizationId}`（0 件は 404）
    async fn fetch_listings(&self, query: &CollectionQuery) -> Result<Vec<ListingSummary>, SyncError>;
}
