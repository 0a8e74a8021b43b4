//! Listing - listing のレコードとライフサイクルの state machine
//!
//! ステータスの正本はサーバー。クライアントは観測するだけ。
//! observation には fetch を dispatch した時点の seq が付いていて、
//! machine は適用済みの最新 seq を覚えている。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::errors::SyncError;
use super::ids::{ListingId, OrganizationId, UserId};

/// ListingStatus は listing のライフサイクル
///
/// # 状態遷移（単調）
/// - active -> closed -> completed
/// - active -> completed（ポーリングの間に closed を見逃すことがあるので許す）
///
/// derive した `Ord` がそのままライフサイクル順
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    /// リクエスト受付中
    Active,

    /// 受付終了。外部の割り当て処理が走っている
    Closed,

    /// 割り当て完了。当選者一覧が見られる
    Completed,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::Closed => "closed",
            ListingStatus::Completed => "completed",
        }
    }
}

/// Listing はサーバーから最後に観測した配布物 1 件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub status: ListingStatus,
    pub quantity: u32,
    /// 表示用。これ自体はステータスを動かさない
    pub distribution_time: DateTime<Utc>,
    pub organization_id: OrganizationId,
    pub organization_name: Option<String>,
    pub location_name: Option<String>,
    pub resource_type: Option<String>,
    pub picture_url: Option<String>,
}

/// AcceptedUser は割り当てで当選したユーザー（completed 後、作成 organization だけが見られる）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedUser {
    pub id: UserId,
    pub name: Option<String>,
    pub location: Option<String>,
    pub address: Option<String>,
    pub telephone: Option<String>,
}

/// ListingTransition は observation を 1 つ流した結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingTransition {
    /// この machine への最初の observation
    Initialized(ListingStatus),

    /// ステータスが進んだ
    Advanced {
        from: ListingStatus,
        to: ListingStatus,
        /// closed を見ないまま active -> completed
        skipped_allocation: bool,
    },

    /// ステータスは同じ。quantity などの詳細だけ更新
    Refreshed,

    /// より大きい seq で上書き済み。捨てる
    Stale { seq: u64, latest: u64 },

    /// 手元より前のステータスが返ってきた。ステータスは据え置き
    Regressed {
        held: ListingStatus,
        observed: ListingStatus,
    },
}

impl ListingTransition {
    /// Stale / Regressed を診断用のエラーとして返す（どちらも致命的ではない）
    pub fn diagnostic(&self) -> Option<SyncError> {
        match *self {
            ListingTransition::Stale { seq, latest } => Some(SyncError::StaleResponse { seq, latest }),
            ListingTransition::Regressed { held, observed } => {
                Some(SyncError::InvariantViolation(format!(
                    "listing status regressed from {} to {}",
                    held.as_str(),
                    observed.as_str()
                )))
            }
            _ => None,
        }
    }
}

/// ListingStateMachine は listing 1 件のライフサイクルのクライアント側モデル
///
/// # 設計原則
/// - ステータスを変えるのは `apply_remote` だけ
/// - 順序の狂った応答はステータスではなく seq で落とす
/// - 後退は適用しない（invariant violation としてログに残す）
#[derive(Debug, Clone, Default)]
pub struct ListingStateMachine {
    current: Option<Listing>,
    last_seq: Option<u64>,
}

impl ListingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// seq `seq` で取得した observation を適用する
    pub fn apply_remote(&mut self, seq: u64, mut observed: Listing) -> ListingTransition {
        if let Some(latest) = self.last_seq
            && seq <= latest
        {
            debug!(listing_id = %observed.id, seq, latest, "discarding stale listing observation");
            return ListingTransition::Stale { seq, latest };
        }
        self.last_seq = Some(seq);

        let Some(held) = self.current.as_ref().map(|l| l.status) else {
            let status = observed.status;
            self.current = Some(observed);
            return ListingTransition::Initialized(status);
        };

        let transition = if observed.status < held {
            error!(
                listing_id = %observed.id,
                seq,
                held = held.as_str(),
                observed = observed.status.as_str(),
                "server reported listing status regression; keeping local status"
            );
            let observed_status = observed.status;
            observed.status = held;
            ListingTransition::Regressed {
                held,
                observed: observed_status,
            }
        } else if observed.status > held {
            let skipped_allocation =
                held == ListingStatus::Active && observed.status == ListingStatus::Completed;
            if skipped_allocation {
                info!(listing_id = %observed.id, seq, "listing completed without observing closed");
            }
            ListingTransition::Advanced {
                from: held,
                to: observed.status,
                skipped_allocation,
            }
        } else {
            ListingTransition::Refreshed
        };

        self.current = Some(observed);
        transition
    }

    pub fn listing(&self) -> Option<&Listing> {
        self.current.as_ref()
    }

    pub fn status(&self) -> Option<ListingStatus> {
        self.current.as_ref().map(|l| l.status)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// リクエストできるのは active の間だけ
    pub fn accepts_requests(&self) -> bool {
        self.status() == Some(ListingStatus::Active)
    }

    /// closed = 割り当て中。ユーザーにできることはない
    pub fn allocation_in_progress(&self) -> bool {
        self.status() == Some(ListingStatus::Closed)
    }

    /// completed = 当選者一覧が見られる
    pub fn accepted_users_unlocked(&self) -> bool {
        self.status() == Some(ListingStatus::Completed)
    }
}
