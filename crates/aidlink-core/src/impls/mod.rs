//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **HttpListingService**: 本番用（reqwest）
//! - **InMemoryListingService**: 開発・テスト用（サーバーのチェックを再現）

pub mod http_service;
pub mod inmem_service;

pub use self::http_service::HttpListingService;
pub use self::inmem_service::InMemoryListingService;
