//! Domain identifiers (strongly-typed IDs).
//!
//! # Server-assigned ID + Phantom type パターン
//! Listing / User / Organization の ID はサーバーが採番する不透明な値です。
//! 旧 API は数値 (`12`) で返し、新しい API は文字列 (`"12"`) で返すことがあるので、
//! どちらでも受け取れるようにして内部では文字列として保持します。
//!
//! `Id<T>` の `T` は PhantomData のマーカー型で、`ListingId` と `UserId` を
//! 混同するとコンパイルエラーになります。
//!
//! `SessionId` だけはクライアント側で生成する ULID です（ログの相関用）。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "listing-", "user-"）
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型（サーバー採番、不透明）
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    raw: String,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            _marker: PhantomData,
        }
    }

    /// URL パスに埋め込む生の値（プレフィックスなし）
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

// derive(Clone) だと T: Clone を要求されるので手で書く
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        Self::new(self.raw.clone())
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl<T: IdMarker> From<u64> for Id<T> {
    fn from(raw: u64) -> Self {
        Self::new(raw.to_string())
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.raw)
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Self::from(n),
            Raw::Text(s) => Self::new(s),
        })
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Listing {}

impl IdMarker for Listing {
    fn prefix() -> &'static str {
        "listing-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum User {}

impl IdMarker for User {
    fn prefix() -> &'static str {
        "user-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Organization {}

impl IdMarker for Organization {
    fn prefix() -> &'static str {
        "org-"
    }
}

/// 配布物 listing の ID
pub type ListingId = Id<Listing>;

/// public user の ID（verification の問い合わせではアカウント全般）
pub type UserId = Id<User>;

/// listing を作った organization の ID
pub type OrganizationId = Id<Organization>;

impl OrganizationId {
    /// organization もアカウントなので、owner 判定は生の値で比べる
    pub fn is_account(&self, user: &UserId) -> bool {
        self.as_str() == user.as_str()
    }
}

/// 1 つの poll session の ID（クライアント採番、ログの相関用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Ulid);

impl SessionId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_accept_numbers_and_strings() {
        let from_number: ListingId = serde_json::from_str("12").unwrap();
        let from_text: ListingId = serde_json::from_str("\"12\"").unwrap();

        assert_eq!(from_number, from_text);
        assert_eq!(from_number.as_str(), "12");
    }

    #[test]
    fn display_carries_prefix_but_path_value_does_not() {
        let listing = ListingId::from(7);
        let user = UserId::from("abc");

        assert_eq!(listing.to_string(), "listing-7");
        assert_eq!(listing.as_str(), "7");
        assert_eq!(user.to_string(), "user-abc");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let user = UserId::from(42);
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"42\"");
    }

    #[test]
    fn organization_matches_owning_account() {
        let org = OrganizationId::from(3);
        assert!(org.is_account(&UserId::from(3)));
        assert!(!org.is_account(&UserId::from(4)));
    }

    #[test]
    fn session_ids_display_ulid() {
        let ulid = Ulid::new();
        let id = SessionId::from_ulid(ulid);
        assert_eq!(id.as_ulid(), ulid);
        assert!(id.to_string().starts_with("session-"));
    }
}
