//! Ports - 抽象化レイヤー
//!
//! 外部（listing サービス、時計、ID 生成）への trait を定義し、実装の詳細を隠蔽します。

pub mod clock;
pub mod id_generator;
pub mod listing_service;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::listing_service::ListingService;
