//! Request - ユーザー 1 人が listing 1 件に出したリクエストの state machine

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

/// RequestOutcome はリクエストの結果
///
/// # 状態遷移
/// - Absent -> Pending（サーバーが送信を ack した、またはポーリングで見えた）
/// - Pending -> Accepted | Rejected（外部の割り当て処理が決める）
///
/// Accepted / Rejected は終端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RequestOutcome {
    /// まだリクエストしていない
    #[default]
    Absent,
    Pending,
    Accepted,
    Rejected,
}

impl RequestOutcome {
    /// 終端か（これ以上遷移しない）
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestOutcome::Accepted | RequestOutcome::Rejected)
    }

    /// ワイヤ上の名前（`?status=` フィルタで使う）
    pub fn as_str(self) -> &'static str {
        match self {
            RequestOutcome::Absent => "Absent",
            RequestOutcome::Pending => "Pending",
            RequestOutcome::Accepted => "Accepted",
            RequestOutcome::Rejected => "Rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("a request already exists (outcome={0:?})")]
    AlreadyRequested(RequestOutcome),
}

/// RequestTransition はリモートの observation を 1 つ流した結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTransition {
    Applied {
        from: RequestOutcome,
        to: RequestOutcome,
    },
    /// 手元と同じ（または ack 済みの送信に追いついていない）
    Unchanged,
    /// より大きい seq で上書き済み。捨てる
    Stale { seq: u64, latest: u64 },
    /// 終端の結果と食い違う。無視する
    Conflict {
        held: RequestOutcome,
        observed: RequestOutcome,
    },
}

/// RequestStateMachine は (listing, user) 1 組のリクエストのクライアント側モデル
#[derive(Debug, Clone, Default)]
pub struct RequestStateMachine {
    outcome: RequestOutcome,
    last_seq: Option<u64>,
}

impl RequestStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Pending` から始まる machine（送信は ack 済み）
    pub fn pending() -> Self {
        Self {
            outcome: RequestOutcome::Pending,
            last_seq: None,
        }
    }

    pub fn outcome(&self) -> RequestOutcome {
        self.outcome
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// 新しい送信がサーバーに ack されたことを記録する
    ///
    /// POST が成功してから呼ぶこと（ネットワーク前の先行更新はしない）
    pub fn submit(&mut self) -> Result<(), RequestError> {
        if self.outcome != RequestOutcome::Absent {
            return Err(RequestError::AlreadyRequested(self.outcome));
        }
        self.outcome = RequestOutcome::Pending;
        Ok(())
    }

    /// seq `seq` で取得した結果を適用する
    pub fn apply_remote(&mut self, seq: u64, observed: RequestOutcome) -> RequestTransition {
        if let Some(latest) = self.last_seq
            && seq <= latest
        {
            debug!(seq, latest, ?observed, "discarding stale request observation");
            return RequestTransition::Stale { seq, latest };
        }
        self.last_seq = Some(seq);

        let held = self.outcome;
        if observed == held {
            return RequestTransition::Unchanged;
        }

        match (held, observed) {
            (held, observed) if held.is_terminal() => {
                error!(?held, ?observed, seq, "request outcome conflicts with terminal outcome; ignoring");
                RequestTransition::Conflict { held, observed }
            }
            // ポーリングが送信 ack より前に出発していた場合、まだ Absent が返ってくる
            (RequestOutcome::Pending, RequestOutcome::Absent) => {
                warn!(seq, "server has no record of an acknowledged request yet; keeping pending");
                RequestTransition::Unchanged
            }
            (from, to) => {
                self.outcome = to;
                RequestTransition::Applied { from, to }
            }
        }
    }
}
