//! Domain model (ids, listing, collection, request, verification, admission, window, errors).
//!
//! ここにあるものは全て同期的な純粋遷移。I/O は ports / sync 側。

pub mod admission;
pub mod collection;
pub mod errors;
pub mod ids;
pub mod listing;
pub mod request;
pub mod verification;
pub mod window;

pub use admission::{AdmissionController, AdmissionDenied, Submission};
pub use collection::{CollectionQuery, ListingCollection, ListingSummary};
pub use errors::{ErrorKind, SyncError};
pub use ids::{ListingId, OrganizationId, SessionId, UserId};
pub use listing::{AcceptedUser, Listing, ListingStateMachine, ListingStatus, ListingTransition};
pub use request::{RequestError, RequestOutcome, RequestStateMachine, RequestTransition};
pub use verification::{Action, UserVerification, VerificationGate};
pub use window::{Countdown, RequestWindow};
