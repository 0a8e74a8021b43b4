//! aidlink-core
//!
//! Listing/request lifecycle synchronization for the relief-resource client.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, listing, request, verification, admission, window, errors）
//! - **ports**: 抽象化レイヤー（Clock, ListingService, SessionIdGenerator）
//! - **sync**: PollSession と PollingSynchronizer（fetch → tag → apply）
//! - **app**: ViewModel（snapshot を UI に公開する composition root）
//! - **impls**: 実装（HttpListingService）
//! - **config**: 環境変数からの設定読み込み
//! - **observability**: PollStats（診断用カウンタ）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod sync;

pub use app::{ListingCollectionViewModel, ListingSnapshot, ListingViewModel};
pub use config::{ConfigError, SyncConfig};
pub use domain::errors::{ErrorKind, SyncError};
