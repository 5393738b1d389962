use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// Always i64 keys; Postgres BIGSERIAL or the in-memory counter.
pub type Id = i64;

/// Listing lifecycle state. Transitions live in `crate::lifecycle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum ListingStatus {
    Available,
    Reserved,
    Sold,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Available => "Available",
            ListingStatus::Reserved => "Reserved",
            ListingStatus::Sold => "Sold",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Available" => Some(ListingStatus::Available),
            "Reserved" => Some(ListingStatus::Reserved),
            "Sold" => Some(ListingStatus::Sold),
            _ => None,
        }
    }
}

impl std::fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal user record. Carries the credential hash, so it never goes to
/// API clients directly; responses go through [`UserPublic`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct User {
    pub id: Id,
    pub username: String,
    pub password_hash: String,
    pub avatar_filename: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UserPublic {
    pub id: Id,
    pub username: String,
    pub avatar_filename: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserPublic {
    fn from(u: &User) -> Self {
        UserPublic {
            id: u.id,
            username: u.username.clone(),
            avatar_filename: u.avatar_filename.clone(),
            is_admin: u.is_admin,
            created_at: u.created_at,
        }
    }
}

/// Repo-level payload for account creation; `password_hash` is already
/// computed by the caller (`crate::auth`).
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Listing {
    pub id: Id,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub location: String,
    pub category: String,
    pub status: ListingStatus,
    pub seller_id: Id,
    pub reserved_by_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewListing {
    pub title: String,
    pub description: String,
    pub price: f64,
    pub location: String,
    pub category: String,
}

/// Full-replace edit payload; the listing form always posts every field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateListing {
    pub title: String,
    pub description: String,
    pub price: f64,
    pub location: String,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct ListingImage {
    pub id: Id,
    pub listing_id: Id,
    pub filename: String,
    pub is_cover: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Message {
    pub id: Id,
    pub sender_id: Id,
    pub recipient_id: Id,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: Id,
    pub recipient_id: Id,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Review {
    pub id: Id,
    pub reviewer_id: Id,
    pub reviewee_id: Id,
    pub listing_id: Id,
    pub rating: i32,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewReview {
    pub reviewer_id: Id,
    pub reviewee_id: Id,
    pub listing_id: Id,
    pub rating: i32,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Report {
    pub id: Id,
    pub reporter_id: Id,
    pub listing_id: Option<Id>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
}

#[derive(Debug, Clone)]
pub struct NewReport {
    pub reporter_id: Id,
    pub listing_id: Option<Id>,
    pub reason: String,
}

/// One row of the conversations index (counterparty + latest traffic).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConversationSummary {
    pub user: UserPublic,
    pub last_message: Option<Message>,
    pub unread: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListingSort {
    #[default]
    Newest,
    PriceAsc,
    PriceDesc,
}

impl ListingSort {
    /// Unknown sort params fall back to newest-first.
    pub fn from_param(s: &str) -> Self {
        match s {
            "price_asc" => ListingSort::PriceAsc,
            "price_desc" => ListingSort::PriceDesc,
            _ => ListingSort::Newest,
        }
    }
}

/// Search predicates for the listings index. All predicates are optional and
/// conjunctive. `status` stays a raw string: an unrecognized value matches
/// no rows instead of being dropped.
#[derive(Debug, Clone, Default)]
pub struct ListingFilter {
    pub category: Option<String>,
    pub keyword: Option<String>,
    pub location: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub status: Option<String>,
    pub sort: ListingSort,
}

/// Mean of received ratings, rounded to 2 decimals. `None` when the user has
/// no reviews (undefined, not zero).
pub fn average_rating(reviews: &[Review]) -> Option<f64> {
    if reviews.is_empty() {
        return None;
    }
    let sum: i64 = reviews.iter().map(|r| i64::from(r.rating)).sum();
    let mean = sum as f64 / reviews.len() as f64;
    Some((mean * 100.0).round() / 100.0)
}

pub const CATEGORIES: &[&str] = &[
    "Electronics",
    "Appliances",
    "Books",
    "Clothing",
    "Sports",
    "Other",
];
