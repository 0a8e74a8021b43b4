//! HttpListingService - reqwest ベースの ListingService 実装
//!
//! # 設計原則
//! - 1 メソッド = 1 往復。リトライ・タイムアウト方針は synchronizer 側が持つ
//! - non-2xx はサーバーの `message` / `error` を添えて `SyncError::Status` に
//! - ボディが期待する形でなければ `SyncError::Malformed`（最後の正常 snapshot を維持させる）
//!
//! # ワイヤフォーマット
//! サーバーは日時を RFC 2822（`Tue, 04 Jun 2024 10:00:00 GMT`）で返す。
//! 新しい API は RFC 3339 を返すので両方受け取る。フィールド名も
//! `date_time` と `distribution_date` の 2 通りがある。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use url::Url;

use crate::config::SyncConfig;
use crate::domain::{
    AcceptedUser, CollectionQuery, Listing, ListingId, ListingStatus, ListingSummary,
    OrganizationId, RequestOutcome, Submission, SyncError, UserId, UserVerification,
};
use crate::ports::ListingService;

pub struct HttpListingService {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpListingService {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, SyncError> {
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Transport {
                endpoint: base_url.to_string(),
                message: "base URL cannot carry a path".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transport {
                endpoint: base_url.to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        Self::new(config.api_url.clone(), config.request_timeout)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Transport {
                endpoint: self.base_url.to_string(),
                message: "base URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// 送信して、タイムアウトとそれ以外の transport エラーを分ける
    async fn send(
        &self,
        endpoint: &Url,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, SyncError> {
        debug!(%endpoint, "sending request");
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout(self.timeout)
            } else {
                SyncError::Transport {
                    endpoint: endpoint.to_string(),
                    message: e.to_string(),
                }
            }
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: Url) -> Result<T, SyncError> {
        let resp = self.send(&endpoint, self.client.get(endpoint.clone())).await?;
        let resp = ensure_success(&endpoint, resp).await?;
        decode(&endpoint, resp).await
    }
}

#[async_trait]
impl ListingService for HttpListingService {
    async fn fetch_listing(&self, id: &ListingId) -> Result<Listing, SyncError> {
        let endpoint = self.endpoint(&["listings", id.as_str()])?;
        let payload: ListingPayload = self.get_json(endpoint).await?;
        Ok(payload.into_listing(id))
    }

    async fn fetch_request_status(
        &self,
        listing: &ListingId,
        user: &UserId,
    ) -> Result<RequestOutcome, SyncError> {
        let endpoint = self.endpoint(&["request", "status", listing.as_str(), user.as_str()])?;
        let resp = self.send(&endpoint, self.client.get(endpoint.clone())).await?;
        // 404 = まだリクエストしていない
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(RequestOutcome::Absent);
        }
        let resp = ensure_success(&endpoint, resp).await?;
        let payload: RequestStatusPayload = decode(&endpoint, resp).await?;
        Ok(payload.status)
    }

    async fn submit_request(&self, submission: &Submission) -> Result<(), SyncError> {
        let endpoint = self.endpoint(&["request", submission.listing_id.as_str()])?;
        let body = SubmitRequestBody {
            user_id: &submission.user_id,
        };
        let resp = self
            .send(&endpoint, self.client.post(endpoint.clone()).json(&body))
            .await?;
        ensure_success(&endpoint, resp).await?;
        Ok(())
    }

    async fn fetch_verification(&self, user: &UserId) -> Result<UserVerification, SyncError> {
        let endpoint = self.endpoint(&["user", user.as_str()])?;
        let payload: UserPayload = self.get_json(endpoint).await?;
        Ok(UserVerification::new(
            payload.id.unwrap_or_else(|| user.clone()),
            payload.is_verified,
        ))
    }

    async fn fetch_accepted_users(&self, listing: &ListingId) -> Result<Vec<AcceptedUser>, SyncError> {
        let endpoint = self.endpoint(&["listings", listing.as_str(), "accepted"])?;
        let payload: AcceptedUsersPayload = self.get_json(endpoint).await?;
        Ok(payload.accepted_users)
    }

    async fn fetch_listings(&self, query: &CollectionQuery) -> Result<Vec<ListingSummary>, SyncError> {
        let endpoint = match query {
            CollectionQuery::All => self.endpoint(&["listings"])?,
            CollectionQuery::Status(status) => {
                let mut url = self.endpoint(&["listings"])?;
                url.query_pairs_mut().append_pair("status", status.as_str());
                url
            }
            CollectionQuery::Nearby(user) => self.endpoint(&["listings", "nearby", user.as_str()])?,
            CollectionQuery::Requested(user, outcome) => {
                let mut url = self.endpoint(&["listings", "requested", user.as_str()])?;
                if let Some(outcome) = outcome {
                    url.query_pairs_mut().append_pair("status", outcome.as_str());
                }
                // こちらだけ `{"listings": [...]}` で包まれて返る
                let payload: RequestedListingsPayload = self.get_json(url).await?;
                return Ok(payload.listings.into_iter().map(SummaryPayload::into_summary).collect());
            }
            CollectionQuery::Owned(org) => {
                let url = self.endpoint(&["listings", "org", org.as_str()])?;
                let resp = self.send(&url, self.client.get(url.clone())).await?;
                // 1 件もないとき 404 が返る
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(Vec::new());
                }
                let resp = ensure_success(&url, resp).await?;
                let payload: Vec<SummaryPayload> = decode(&url, resp).await?;
                return Ok(payload.into_iter().map(SummaryPayload::into_summary).collect());
            }
        };
        let payload: Vec<SummaryPayload> = self.get_json(endpoint).await?;
        Ok(payload.into_iter().map(SummaryPayload::into_summary).collect())
    }
}

async fn ensure_success(endpoint: &Url, resp: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SyncError::Status {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        message: error_message(&body),
    })
}

async fn decode<T: DeserializeOwned>(endpoint: &Url, resp: reqwest::Response) -> Result<T, SyncError> {
    let bytes = resp.bytes().await.map_err(|e| SyncError::Transport {
        endpoint: endpoint.to_string(),
        message: format!("failed to read body: {e}"),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| SyncError::Malformed {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

/// `{"message": ..}` か `{"error": ..}`。どちらもなければ本文そのまま
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        error: Option<String>,
    }

    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| body.trim().to_string())
}

fn wire_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_wire_time(&raw).ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp {raw:?}")))
}

pub(crate) fn parse_wire_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc2822(raw) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    // タイムゾーンなしの ISO 形式は UTC とみなす
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|t| t.and_utc())
}

// ========================================
// ワイヤ上の payload
// ========================================

#[derive(Deserialize)]
struct ListingPayload {
    /// 詳細エンドポイントは id を返さない
    id: Option<ListingId>,
    status: ListingStatus,
    quantity: u32,
    #[serde(alias = "distribution_date", deserialize_with = "wire_time")]
    date_time: DateTime<Utc>,
    organization_id: OrganizationId,
    organization_name: Option<String>,
    location_name: Option<String>,
    resource_type: Option<String>,
    picture_url: Option<String>,
}

impl ListingPayload {
    fn into_listing(self, requested: &ListingId) -> Listing {
        Listing {
            id: self.id.unwrap_or_else(|| requested.clone()),
            status: self.status,
            quantity: self.quantity,
            distribution_time: self.date_time,
            organization_id: self.organization_id,
            organization_name: self.organization_name,
            location_name: self.location_name,
            resource_type: self.resource_type,
            picture_url: self.picture_url,
        }
    }
}

#[derive(Deserialize)]
struct SummaryPayload {
    id: ListingId,
    organization_name: Option<String>,
    quantity: u32,
    #[serde(alias = "distribution_date", deserialize_with = "wire_time")]
    date_time: DateTime<Utc>,
    location_name: Option<String>,
    resource_type: Option<String>,
    #[serde(default)]
    status: Option<ListingStatus>,
    picture_url: Option<String>,
}

impl SummaryPayload {
    fn into_summary(self) -> ListingSummary {
        ListingSummary {
            id: self.id,
            organization_name: self.organization_name,
            quantity: self.quantity,
            distribution_time: self.date_time,
            location_name: self.location_name,
            resource_type: self.resource_type,
            status: self.status,
            picture_url: self.picture_url,
        }
    }
}

#[derive(Deserialize)]
struct RequestedListingsPayload {
    #[serde(default)]
    listings: Vec<SummaryPayload>,
}

#[derive(Deserialize)]
struct RequestStatusPayload {
    status: RequestOutcome,
}

#[derive(Serialize)]
struct SubmitRequestBody<'a> {
    user_id: &'a UserId,
}

#[derive(Deserialize)]
struct UserPayload {
    id: Option<UserId>,
    #[serde(default)]
    is_verified: bool,
}

#[derive(Deserialize)]
struct AcceptedUsersPayload {
    #[serde(default)]
    accepted_users: Vec<AcceptedUser>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case::rfc2822("Tue, 04 Jun 2024 10:00:00 GMT")]
    #[case::rfc3339("2024-06-04T10:00:00Z")]
    #[case::rfc3339_offset("2024-06-04T19:00:00+09:00")]
    #[case::naive_iso("2024-06-04T10:00:00")]
    fn wire_times_parse_to_utc(#[case] raw: &str) {
        assert_eq!(
            parse_wire_time(raw),
            Some(Utc.with_ymd_and_hms(2024, 6, 4, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn garbage_time_is_rejected() {
        assert_eq!(parse_wire_time("next tuesday"), None);
    }

    #[rstest]
    #[case::message(r#"{"message":"You have already requested this listing"}"#, "You have already requested this listing")]
    #[case::error(r#"{"error":"User is not verified"}"#, "User is not verified")]
    #[case::plain_text("Internal Server Error\n", "Internal Server Error")]
    fn error_message_prefers_json_fields(#[case] body: &str, #[case] expected: &str) {
        assert_eq!(error_message(body), expected);
    }

    #[test]
    fn detail_payload_accepts_either_date_field() {
        let old: ListingPayload = serde_json::from_value(serde_json::json!({
            "status": "active",
            "quantity": 5,
            "date_time": "Tue, 04 Jun 2024 10:00:00 GMT",
            "organization_id": 9
        }))
        .unwrap();
        let new: ListingPayload = serde_json::from_value(serde_json::json!({
            "status": "active",
            "quantity": 5,
            "distribution_date": "2024-06-04T10:00:00Z",
            "organization_id": "9"
        }))
        .unwrap();

        let id = ListingId::from(3);
        assert_eq!(old.into_listing(&id), new.into_listing(&id));
    }

    #[test]
    fn endpoints_keep_base_path() {
        let svc = HttpListingService::new(
            Url::parse("https://relief.example.org/api/").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        let url = svc.endpoint(&["listings", "7", "accepted"]).unwrap();
        assert_eq!(url.as_str(), "https://relief.example.org/api/listings/7/accepted");
    }
}
