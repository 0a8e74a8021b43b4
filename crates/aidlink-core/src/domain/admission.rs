//! AdmissionController - 新規リクエストの受付判定
//!
//! 取得済みの状態だけを見る純粋関数。ネットワーク I/O はしない
//! （送信は呼び出し側が `Submission` を見て行う）。

use thiserror::Error;

use super::ids::{ListingId, UserId};
use super::listing::{Listing, ListingStatus};
use super::request::{RequestOutcome, RequestStateMachine};
use super::verification::{Action, UserVerification};

/// AdmissionDenied はネットワークに出る前にリクエストを断った理由
///
/// 優先順位: NotActive > NotVerified > DuplicateRequest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionDenied {
    #[error("listing is not accepting requests (status={0:?})")]
    NotActive(ListingStatus),

    #[error("you must be verified to request this listing")]
    NotVerified,

    #[error("you have already requested this listing (outcome={0:?})")]
    DuplicateRequest(RequestOutcome),
}

/// Submission は受付済みのリクエスト。`POST /request/{listing_id}` に必要なものを持つ
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "an admitted submission does nothing until it is sent"]
pub struct Submission {
    pub listing_id: ListingId,
    pub user_id: UserId,
}

impl Submission {
    /// POST が ack された。Pending から始まる machine を作る
    pub fn into_pending(self) -> RequestStateMachine {
        RequestStateMachine::pending()
    }
}

pub struct AdmissionController;

impl AdmissionController {
    pub fn request_listing(
        listing: &Listing,
        requester: &UserVerification,
        existing: RequestOutcome,
    ) -> Result<Submission, AdmissionDenied> {
        if listing.status != ListingStatus::Active {
            return Err(AdmissionDenied::NotActive(listing.status));
        }
        if !requester.permits(Action::SubmitRequest) {
            return Err(AdmissionDenied::NotVerified);
        }
        if existing != RequestOutcome::Absent {
            return Err(AdmissionDenied::DuplicateRequest(existing));
        }
        Ok(Submission {
            listing_id: listing.id.clone(),
            user_id: requester.user_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::listing::fixtures::listing;
    use rstest::rstest;

    fn verified(flag: bool) -> UserVerification {
        UserVerification::new(UserId::from(42), flag)
    }

    #[rstest]
    fn not_active_wins_over_everything(
        #[values(ListingStatus::Closed, ListingStatus::Completed)] status: ListingStatus,
        #[values(true, false)] is_verified: bool,
        #[values(
            RequestOutcome::Absent,
            RequestOutcome::Pending,
            RequestOutcome::Accepted,
            RequestOutcome::Rejected
        )]
        existing: RequestOutcome,
    ) {
        let res = AdmissionController::request_listing(&listing(status), &verified(is_verified), existing);
        assert_eq!(res, Err(AdmissionDenied::NotActive(status)));
    }

    #[rstest]
    fn not_verified_wins_over_duplicate(
        #[values(RequestOutcome::Absent, RequestOutcome::Pending)] existing: RequestOutcome,
    ) {
        let res = AdmissionController::request_listing(
            &listing(ListingStatus::Active),
            &verified(false),
            existing,
        );
        assert_eq!(res, Err(AdmissionDenied::NotVerified));
    }

    #[rstest]
    #[case(RequestOutcome::Pending)]
    #[case(RequestOutcome::Accepted)]
    #[case(RequestOutcome::Rejected)]
    fn duplicate_only_when_active_and_verified(#[case] existing: RequestOutcome) {
        let res = AdmissionController::request_listing(
            &listing(ListingStatus::Active),
            &verified(true),
            existing,
        );
        assert_eq!(res, Err(AdmissionDenied::DuplicateRequest(existing)));
    }

    #[test]
    fn admitted_submission_seeds_pending() {
        let submission = AdmissionController::request_listing(
            &listing(ListingStatus::Active),
            &verified(true),
            RequestOutcome::Absent,
        )
        .unwrap();

        assert_eq!(submission.listing_id, ListingId::from(1));
        assert_eq!(submission.user_id, UserId::from(42));
        assert_eq!(submission.into_pending().outcome(), RequestOutcome::Pending);
    }
}
