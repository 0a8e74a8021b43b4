//! Errors - エラー型と分類
//!
//! 分類 (`ErrorKind`) は composition 層が「次の tick で再試行」「ユーザーに見せる」
//! 「最後の正常 snapshot を保持」のどれにするかを決めるためのものです。

use std::time::Duration;

use thiserror::Error;

use super::admission::AdmissionDenied;

/// ErrorKind は同期エラーの運用分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 一時的なエラー（次の tick で再試行）
    Transient,
    /// ポリシーによる拒否（ユーザーに表示、自動再試行しない）
    Denied,
    /// 古いレスポンス（黙って捨てる）
    Stale,
    /// サーバーとクライアントの不一致（大きくログ、状態は戻さない）
    Invariant,
    /// ペイロード不正（最後の正常 snapshot を維持）
    Malformed,
}

/// SyncError は同期コアのエラー
#[derive(Debug, Error)]
pub enum SyncError {
    /// 応答が来る前のネットワーク障害
    #[error("transport error calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// 時間内に成功も失敗もしなかった
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// サーバーが non-2xx を返した
    #[error("{endpoint} returned {status}: {message}")]
    Status {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// 本文が期待した形でない
    #[error("malformed payload from {endpoint}: {message}")]
    Malformed { endpoint: String, message: String },

    #[error(transparent)]
    Admission(#[from] AdmissionDenied),

    #[error("stale response seq={seq} (latest applied seq={latest})")]
    StaleResponse { seq: u64, latest: u64 },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// 今の listing 状態ではまだ使えない操作
    #[error("capability locked: {0}")]
    CapabilityLocked(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transport { .. } | SyncError::Timeout(_) => ErrorKind::Transient,
            // 5xx はサーバー側の一時障害として扱う
            SyncError::Status { status, .. } if *status >= 500 => ErrorKind::Transient,
            SyncError::Status { .. } | SyncError::Admission(_) | SyncError::CapabilityLocked(_) => {
                ErrorKind::Denied
            }
            SyncError::Malformed { .. } => ErrorKind::Malformed,
            SyncError::StaleResponse { .. } => ErrorKind::Stale,
            SyncError::InvariantViolation(_) => ErrorKind::Invariant,
        }
    }

    /// サーバーが「未認証」と言った（手元のフラグより優先）
    pub fn is_unverified_rejection(&self) -> bool {
        matches!(self, SyncError::Status { status: 403, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ListingStatus;
    use rstest::rstest;

    fn status(code: u16) -> SyncError {
        SyncError::Status {
            endpoint: "/request/1".into(),
            status: code,
            message: "nope".into(),
        }
    }

    #[rstest]
    #[case::timeout(SyncError::Timeout(Duration::from_secs(5)), ErrorKind::Transient)]
    #[case::server_error(status(503), ErrorKind::Transient)]
    #[case::client_error(status(400), ErrorKind::Denied)]
    #[case::admission(
        SyncError::Admission(AdmissionDenied::NotActive(ListingStatus::Closed)),
        ErrorKind::Denied
    )]
    #[case::stale(SyncError::StaleResponse { seq: 1, latest: 2 }, ErrorKind::Stale)]
    #[case::malformed(
        SyncError::Malformed { endpoint: "/listings/1".into(), message: "eof".into() },
        ErrorKind::Malformed
    )]
    fn errors_are_classified(#[case] err: SyncError, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
    }

    #[test]
    fn forbidden_reply_means_unverified() {
        assert!(status(403).is_unverified_rejection());
        assert!(!status(400).is_unverified_rejection());
    }
}
