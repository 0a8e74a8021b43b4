//! VerificationGate - 認証済みフラグによる操作可否判定
//!
//! クライアント側の判定は UX のため（ボタンを無効化する）であって、権威ではない。
//! サーバーが「未認証」で拒否したら、その結果をキャッシュに反映する。

use serde::{Deserialize, Serialize};

use super::ids::UserId;

/// Action は gate が判定する操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    CreateListing,
    SubmitRequest,
    CreatePost,
    ViewListings,
    ViewPosts,
}

impl Action {
    pub fn requires_verification(self) -> bool {
        matches!(
            self,
            Action::CreateListing | Action::SubmitRequest | Action::CreatePost
        )
    }
}

/// VerificationGate は (action, 認証フラグ) の純粋な判定
pub struct VerificationGate;

impl VerificationGate {
    pub fn permit(action: Action, is_verified: bool) -> bool {
        !action.requires_verification() || is_verified
    }
}

/// UserVerification は 1 アカウント分の認証フラグのキャッシュ
///
/// 変わるのは新しい `/user/{id}` の observation か、サーバーの 403 のときだけ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserVerification {
    pub user_id: UserId,
    pub is_verified: bool,
}

impl UserVerification {
    pub fn new(user_id: UserId, is_verified: bool) -> Self {
        Self {
            user_id,
            is_verified,
        }
    }

    pub fn permits(&self, action: Action) -> bool {
        VerificationGate::permit(action, self.is_verified)
    }

    /// サーバーが未認証として操作を拒否した
    pub fn revoke(&mut self) {
        self.is_verified = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Action::CreateListing, false, false)]
    #[case(Action::CreateListing, true, true)]
    #[case(Action::SubmitRequest, false, false)]
    #[case(Action::SubmitRequest, true, true)]
    #[case(Action::CreatePost, false, false)]
    #[case(Action::CreatePost, true, true)]
    #[case(Action::ViewListings, false, true)]
    #[case(Action::ViewListings, true, true)]
    #[case(Action::ViewPosts, false, true)]
    #[case(Action::ViewPosts, true, true)]
    fn gate_matrix(#[case] action: Action, #[case] verified: bool, #[case] expected: bool) {
        assert_eq!(VerificationGate::permit(action, verified), expected);
    }

    #[test]
    fn server_rejection_revokes_cached_flag() {
        let mut v = UserVerification::new(UserId::from(1), true);
        assert!(v.permits(Action::SubmitRequest));

        v.revoke();
        assert!(!v.permits(Action::SubmitRequest));
        assert!(v.permits(Action::ViewListings));
    }
}
