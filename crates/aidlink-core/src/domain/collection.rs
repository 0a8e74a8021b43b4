//! ListingCollection - 一覧画面のリスト。ポーリングのたびに丸ごと入れ替える

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ids::{ListingId, OrganizationId, UserId};
use super::listing::ListingStatus;
use super::request::RequestOutcome;
use super::window::RequestWindow;

/// CollectionQuery は一覧画面が何を見ているか
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum CollectionQuery {
    /// 全 listing（organization / admin の「all」）
    All,
    /// 1 つのステータスだけ（organization / admin のフィルタ）
    Status(ListingStatus),
    /// public user の近くの active な listing
    Nearby(UserId),
    /// 「My Requests」: ユーザーがリクエストした listing（結果で絞り込める）
    Requested(UserId, Option<RequestOutcome>),
    /// 「My Listings」: organization が作った listing
    Owned(OrganizationId),
}

/// ListingSummary は一覧の 1 行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub id: ListingId,
    pub organization_name: Option<String>,
    pub quantity: u32,
    pub distribution_time: DateTime<Utc>,
    pub location_name: Option<String>,
    pub resource_type: Option<String>,
    pub status: Option<ListingStatus>,
    pub picture_url: Option<String>,
}

impl ListingSummary {
    pub fn request_window(&self) -> RequestWindow {
        RequestWindow::for_distribution(self.distribution_time)
    }
}

/// ListingCollection は seq で守った最新リストの入れ物
#[derive(Debug, Clone, Default)]
pub struct ListingCollection {
    items: Vec<ListingSummary>,
    last_seq: Option<u64>,
}

impl ListingCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// リストを入れ替える。`seq` が古ければ false
    pub fn apply_remote(&mut self, seq: u64, items: Vec<ListingSummary>) -> bool {
        if let Some(latest) = self.last_seq
            && seq <= latest
        {
            debug!(seq, latest, "discarding stale collection observation");
            return false;
        }
        self.last_seq = Some(seq);
        self.items = items;
        true
    }

    pub fn items(&self) -> &[ListingSummary] {
        &self.items
    }

    /// 空からやり直す（クエリが変わった）
    pub fn reset(&mut self) {
        self.items.clear();
        self.last_seq = None;
    }
}
