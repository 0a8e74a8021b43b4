use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// PollStats は synchronizer ごとの診断カウンタ（再 activate しても引き継ぐ）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStats {
    pub fetches_started: u64,
    pub applied: u64,
    /// fetch が in-flight のままだった tick
    pub skipped_ticks: u64,
    pub failures: u64,
    /// 次の成功で 0 に戻る
    pub consecutive_failures: u32,
    /// セッションが deactivate された後に届いた応答
    pub discarded: u64,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl PollStats {
    /// UI から見てデータが古くなったか
    pub fn is_stale(&self, threshold: u32) -> bool {
        threshold > 0 && self.consecutive_failures >= threshold
    }
}
