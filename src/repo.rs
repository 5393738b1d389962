use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Conflict when the username is taken.
    async fn create_user(&self, new: NewUser) -> RepoResult<User>;
    async fn get_user(&self, id: Id) -> RepoResult<User>;
    async fn get_user_by_username(&self, username: &str) -> RepoResult<User>;
    async fn set_avatar(&self, user_id: Id, filename: &str) -> RepoResult<()>;
    async fn list_users(&self) -> RepoResult<Vec<User>>;
}

#[async_trait]
pub trait ListingRepo: Send + Sync {
    async fn create_listing(&self, seller_id: Id, new: NewListing) -> RepoResult<Listing>;
    async fn get_listing(&self, id: Id) -> RepoResult<Listing>;
    async fn list_listings(&self, filter: &ListingFilter) -> RepoResult<Vec<Listing>>;
    async fn update_listing(&self, id: Id, upd: UpdateListing) -> RepoResult<Listing>;
    /// Removes the listing and everything hanging off it; returns the image
    /// rows so the caller can clean stored files up.
    async fn delete_listing(&self, id: Id) -> RepoResult<Vec<ListingImage>>;
    /// Compare-and-swap lifecycle commit: applies only while the row still
    /// holds `expect`. A lost race is a Conflict, never a second winner.
    async fn update_lifecycle(
        &self,
        id: Id,
        expect: ListingStatus,
        status: ListingStatus,
        reserved_by: Option<Id>,
    ) -> RepoResult<Listing>;
    async fn listings_by_seller(&self, seller_id: Id) -> RepoResult<Vec<Listing>>;
    async fn sold_listings_for_buyer(&self, buyer_id: Id) -> RepoResult<Vec<Listing>>;
    async fn sold_listings_for_seller(&self, seller_id: Id) -> RepoResult<Vec<Listing>>;
    async fn distinct_locations(&self) -> RepoResult<Vec<String>>;

    async fn add_image(&self, listing_id: Id, filename: &str, is_cover: bool) -> RepoResult<ListingImage>;
    async fn list_images(&self, listing_id: Id) -> RepoResult<Vec<ListingImage>>;
    /// Deletes the given image rows of one listing; returns what was removed.
    async fn delete_images(&self, listing_id: Id, image_ids: &[Id]) -> RepoResult<Vec<ListingImage>>;
    /// Clears every cover flag on the listing, then sets the chosen one.
    async fn set_cover_image(&self, listing_id: Id, image_id: Option<Id>) -> RepoResult<()>;
}

#[async_trait]
pub trait MessageRepo: Send + Sync {
    async fn create_message(&self, new: NewMessage) -> RepoResult<Message>;
    /// Distinct users the given user has exchanged messages with.
    async fn conversation_partners(&self, user_id: Id) -> RepoResult<Vec<Id>>;
    async fn last_message_between(&self, a: Id, b: Id) -> RepoResult<Option<Message>>;
    /// Full thread between two users, oldest first.
    async fn messages_between(&self, a: Id, b: Id) -> RepoResult<Vec<Message>>;
    async fn unread_from(&self, sender_id: Id, recipient_id: Id) -> RepoResult<i64>;
    async fn unread_total(&self, recipient_id: Id) -> RepoResult<i64>;
    async fn mark_read(&self, sender_id: Id, recipient_id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait ReviewRepo: Send + Sync {
    /// Conflict on a duplicate (reviewer, reviewee, listing) triple.
    async fn create_review(&self, new: NewReview) -> RepoResult<Review>;
    async fn reviews_for(&self, reviewee_id: Id) -> RepoResult<Vec<Review>>;
    async fn reviews_for_listing(&self, listing_id: Id) -> RepoResult<Vec<Review>>;
}

#[async_trait]
pub trait ReportRepo: Send + Sync {
    async fn create_report(&self, new: NewReport) -> RepoResult<Report>;
    /// Newest first.
    async fn list_reports(&self) -> RepoResult<Vec<Report>>;
    async fn resolve_report(&self, id: Id) -> RepoResult<Report>;
}

#[async_trait]
pub trait FavoriteRepo: Send + Sync {
    /// False when the pair already existed (idempotent add).
    async fn add_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<bool>;
    /// False when there was nothing to remove.
    async fn remove_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<bool>;
    async fn is_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<bool>;
    async fn favorites_of(&self, user_id: Id) -> RepoResult<Vec<Listing>>;
}

pub trait Repo:
    UserRepo + ListingRepo + MessageRepo + ReviewRepo + ReportRepo + FavoriteRepo
{
}

impl<T> Repo for T where
    T: UserRepo + ListingRepo + MessageRepo + ReviewRepo + ReportRepo + FavoriteRepo
{
}

fn listing_matches(l: &Listing, f: &ListingFilter) -> bool {
    if let Some(c) = &f.category {
        if &l.category != c {
            return false;
        }
    }
    if let Some(loc) = &f.location {
        if !l.location.contains(loc.as_str()) {
            return false;
        }
    }
    if let Some(k) = &f.keyword {
        if !l.title.contains(k.as_str()) && !l.description.contains(k.as_str()) {
            return false;
        }
    }
    if let Some(min) = f.min_price {
        if l.price < min {
            return false;
        }
    }
    if let Some(max) = f.max_price {
        if l.price > max {
            return false;
        }
    }
    if let Some(s) = &f.status {
        // Unknown status strings match nothing.
        if l.status.as_str() != s {
            return false;
        }
    }
    true
}

fn sort_listings(v: &mut Vec<Listing>, sort: ListingSort) {
    match sort {
        ListingSort::PriceAsc => v.sort_by(|a, b| a.price.total_cmp(&b.price)),
        ListingSort::PriceDesc => v.sort_by(|a, b| b.price.total_cmp(&a.price)),
        ListingSort::Newest => v.sort_by(|a, b| b.id.cmp(&a.id)),
    }
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeSet, HashMap, HashSet};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        users: HashMap<Id, User>,
        listings: HashMap<Id, Listing>,
        images: HashMap<Id, ListingImage>,
        messages: HashMap<Id, Message>,
        reviews: HashMap<Id, Review>,
        reports: HashMap<Id, Report>,
        favorites: HashSet<(Id, Id)>, // (user_id, listing_id)
        next_id: Id,
    }

    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn data_dir() -> PathBuf {
            std::env::var("LOPPIS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn snapshot_path() -> PathBuf {
            if std::env::var("LOPPIS_DATA_DIR").is_ok() {
                let mut p = Self::data_dir();
                p.push("state.json");
                p
            } else {
                PathBuf::from(SNAPSHOT_PATH)
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        eprintln!("[inmem] Loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        eprintln!("[inmem] Failed to parse snapshot '{}': {e}. Starting empty.", path.display());
                        State::default()
                    }
                },
                Err(e) => {
                    eprintln!("[inmem] No snapshot at '{}': {e}. Starting empty.", path.display());
                    State::default()
                }
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    eprintln!("[inmem] Failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self { Self::new() }
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            if s.users.values().any(|u| u.username == new.username) {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let user = User {
                id,
                username: new.username,
                password_hash: new.password_hash,
                avatar_filename: None,
                is_admin: false,
                created_at: Utc::now(),
            };
            s.users.insert(id, user.clone());
            drop(s);
            self.persist();
            Ok(user)
        }

        async fn get_user(&self, id: Id) -> RepoResult<User> {
            let s = self.state.read().unwrap();
            s.users.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn get_user_by_username(&self, username: &str) -> RepoResult<User> {
            let s = self.state.read().unwrap();
            s.users
                .values()
                .find(|u| u.username == username)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn set_avatar(&self, user_id: Id, filename: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let user = s.users.get_mut(&user_id).ok_or(RepoError::NotFound)?;
            user.avatar_filename = Some(filename.to_string());
            drop(s);
            self.persist();
            Ok(())
        }

        async fn list_users(&self) -> RepoResult<Vec<User>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s.users.values().cloned().collect();
            v.sort_by_key(|u| u.id);
            Ok(v)
        }
    }

    #[async_trait]
    impl ListingRepo for InMemRepo {
        async fn create_listing(&self, seller_id: Id, new: NewListing) -> RepoResult<Listing> {
            let mut s = self.state.write().unwrap();
            if !s.users.contains_key(&seller_id) {
                return Err(RepoError::NotFound);
            }
            let id = Self::next_id(&mut s);
            let listing = Listing {
                id,
                title: new.title,
                description: new.description,
                price: new.price,
                location: new.location,
                category: new.category,
                status: ListingStatus::Available,
                seller_id,
                reserved_by_id: None,
                created_at: Utc::now(),
            };
            s.listings.insert(id, listing.clone());
            drop(s);
            self.persist();
            Ok(listing)
        }

        async fn get_listing(&self, id: Id) -> RepoResult<Listing> {
            let s = self.state.read().unwrap();
            s.listings.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn list_listings(&self, filter: &ListingFilter) -> RepoResult<Vec<Listing>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .listings
                .values()
                .filter(|l| listing_matches(l, filter))
                .cloned()
                .collect();
            sort_listings(&mut v, filter.sort);
            Ok(v)
        }

        async fn update_listing(&self, id: Id, upd: UpdateListing) -> RepoResult<Listing> {
            let mut s = self.state.write().unwrap();
            let listing = s.listings.get_mut(&id).ok_or(RepoError::NotFound)?;
            listing.title = upd.title;
            listing.description = upd.description;
            listing.price = upd.price;
            listing.location = upd.location;
            listing.category = upd.category;
            let updated = listing.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn delete_listing(&self, id: Id) -> RepoResult<Vec<ListingImage>> {
            let mut s = self.state.write().unwrap();
            s.listings.remove(&id).ok_or(RepoError::NotFound)?;
            let image_ids: Vec<Id> = s
                .images
                .values()
                .filter(|i| i.listing_id == id)
                .map(|i| i.id)
                .collect();
            let mut removed = Vec::new();
            for iid in image_ids {
                if let Some(img) = s.images.remove(&iid) {
                    removed.push(img);
                }
            }
            s.favorites.retain(|(_, lid)| *lid != id);
            let review_ids: Vec<Id> = s
                .reviews
                .values()
                .filter(|r| r.listing_id == id)
                .map(|r| r.id)
                .collect();
            for rid in review_ids {
                s.reviews.remove(&rid);
            }
            for report in s.reports.values_mut() {
                if report.listing_id == Some(id) {
                    report.listing_id = None;
                }
            }
            drop(s);
            self.persist();
            Ok(removed)
        }

        async fn update_lifecycle(
            &self,
            id: Id,
            expect: ListingStatus,
            status: ListingStatus,
            reserved_by: Option<Id>,
        ) -> RepoResult<Listing> {
            let mut s = self.state.write().unwrap();
            let listing = s.listings.get_mut(&id).ok_or(RepoError::NotFound)?;
            if listing.status != expect {
                return Err(RepoError::Conflict);
            }
            listing.status = status;
            listing.reserved_by_id = reserved_by;
            let updated = listing.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn listings_by_seller(&self, seller_id: Id) -> RepoResult<Vec<Listing>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .listings
                .values()
                .filter(|l| l.seller_id == seller_id)
                .cloned()
                .collect();
            v.sort_by(|a, b| b.id.cmp(&a.id));
            Ok(v)
        }

        async fn sold_listings_for_buyer(&self, buyer_id: Id) -> RepoResult<Vec<Listing>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .listings
                .values()
                .filter(|l| l.status == ListingStatus::Sold && l.reserved_by_id == Some(buyer_id))
                .cloned()
                .collect();
            v.sort_by(|a, b| b.id.cmp(&a.id));
            Ok(v)
        }

        async fn sold_listings_for_seller(&self, seller_id: Id) -> RepoResult<Vec<Listing>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .listings
                .values()
                .filter(|l| l.status == ListingStatus::Sold && l.seller_id == seller_id)
                .cloned()
                .collect();
            v.sort_by(|a, b| b.id.cmp(&a.id));
            Ok(v)
        }

        async fn distinct_locations(&self) -> RepoResult<Vec<String>> {
            let s = self.state.read().unwrap();
            let set: BTreeSet<String> = s
                .listings
                .values()
                .map(|l| l.location.clone())
                .filter(|loc| !loc.is_empty())
                .collect();
            Ok(set.into_iter().collect())
        }

        async fn add_image(&self, listing_id: Id, filename: &str, is_cover: bool) -> RepoResult<ListingImage> {
            let mut s = self.state.write().unwrap();
            if !s.listings.contains_key(&listing_id) {
                return Err(RepoError::NotFound);
            }
            let id = Self::next_id(&mut s);
            let img = ListingImage {
                id,
                listing_id,
                filename: filename.to_string(),
                is_cover,
            };
            s.images.insert(id, img.clone());
            drop(s);
            self.persist();
            Ok(img)
        }

        async fn list_images(&self, listing_id: Id) -> RepoResult<Vec<ListingImage>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .images
                .values()
                .filter(|i| i.listing_id == listing_id)
                .cloned()
                .collect();
            v.sort_by_key(|i| i.id);
            Ok(v)
        }

        async fn delete_images(&self, listing_id: Id, image_ids: &[Id]) -> RepoResult<Vec<ListingImage>> {
            let mut s = self.state.write().unwrap();
            let mut removed = Vec::new();
            for iid in image_ids {
                let belongs = s
                    .images
                    .get(iid)
                    .map(|i| i.listing_id == listing_id)
                    .unwrap_or(false);
                if belongs {
                    if let Some(img) = s.images.remove(iid) {
                        removed.push(img);
                    }
                }
            }
            drop(s);
            self.persist();
            Ok(removed)
        }

        async fn set_cover_image(&self, listing_id: Id, image_id: Option<Id>) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            for img in s.images.values_mut() {
                if img.listing_id == listing_id {
                    img.is_cover = image_id == Some(img.id);
                }
            }
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl MessageRepo for InMemRepo {
        async fn create_message(&self, new: NewMessage) -> RepoResult<Message> {
            let mut s = self.state.write().unwrap();
            if !s.users.contains_key(&new.sender_id) || !s.users.contains_key(&new.recipient_id) {
                return Err(RepoError::NotFound);
            }
            let id = Self::next_id(&mut s);
            let msg = Message {
                id,
                sender_id: new.sender_id,
                recipient_id: new.recipient_id,
                content: new.content,
                created_at: Utc::now(),
                read: false,
            };
            s.messages.insert(id, msg.clone());
            drop(s);
            self.persist();
            Ok(msg)
        }

        async fn conversation_partners(&self, user_id: Id) -> RepoResult<Vec<Id>> {
            let s = self.state.read().unwrap();
            let mut partners = BTreeSet::new();
            for m in s.messages.values() {
                if m.sender_id == user_id {
                    partners.insert(m.recipient_id);
                } else if m.recipient_id == user_id {
                    partners.insert(m.sender_id);
                }
            }
            Ok(partners.into_iter().collect())
        }

        async fn last_message_between(&self, a: Id, b: Id) -> RepoResult<Option<Message>> {
            let s = self.state.read().unwrap();
            Ok(s.messages
                .values()
                .filter(|m| {
                    (m.sender_id == a && m.recipient_id == b)
                        || (m.sender_id == b && m.recipient_id == a)
                })
                .max_by_key(|m| (m.created_at, m.id))
                .cloned())
        }

        async fn messages_between(&self, a: Id, b: Id) -> RepoResult<Vec<Message>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .messages
                .values()
                .filter(|m| {
                    (m.sender_id == a && m.recipient_id == b)
                        || (m.sender_id == b && m.recipient_id == a)
                })
                .cloned()
                .collect();
            v.sort_by_key(|m| (m.created_at, m.id));
            Ok(v)
        }

        async fn unread_from(&self, sender_id: Id, recipient_id: Id) -> RepoResult<i64> {
            let s = self.state.read().unwrap();
            Ok(s.messages
                .values()
                .filter(|m| m.sender_id == sender_id && m.recipient_id == recipient_id && !m.read)
                .count() as i64)
        }

        async fn unread_total(&self, recipient_id: Id) -> RepoResult<i64> {
            let s = self.state.read().unwrap();
            Ok(s.messages
                .values()
                .filter(|m| m.recipient_id == recipient_id && !m.read)
                .count() as i64)
        }

        async fn mark_read(&self, sender_id: Id, recipient_id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            for m in s.messages.values_mut() {
                if m.sender_id == sender_id && m.recipient_id == recipient_id {
                    m.read = true;
                }
            }
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl ReviewRepo for InMemRepo {
        async fn create_review(&self, new: NewReview) -> RepoResult<Review> {
            let mut s = self.state.write().unwrap();
            let duplicate = s.reviews.values().any(|r| {
                r.reviewer_id == new.reviewer_id
                    && r.reviewee_id == new.reviewee_id
                    && r.listing_id == new.listing_id
            });
            if duplicate {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let review = Review {
                id,
                reviewer_id: new.reviewer_id,
                reviewee_id: new.reviewee_id,
                listing_id: new.listing_id,
                rating: new.rating,
                comment: new.comment,
                created_at: Utc::now(),
            };
            s.reviews.insert(id, review.clone());
            drop(s);
            self.persist();
            Ok(review)
        }

        async fn reviews_for(&self, reviewee_id: Id) -> RepoResult<Vec<Review>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .reviews
                .values()
                .filter(|r| r.reviewee_id == reviewee_id)
                .cloned()
                .collect();
            v.sort_by_key(|r| r.id);
            Ok(v)
        }

        async fn reviews_for_listing(&self, listing_id: Id) -> RepoResult<Vec<Review>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .reviews
                .values()
                .filter(|r| r.listing_id == listing_id)
                .cloned()
                .collect();
            v.sort_by_key(|r| r.id);
            Ok(v)
        }
    }

    #[async_trait]
    impl ReportRepo for InMemRepo {
        async fn create_report(&self, new: NewReport) -> RepoResult<Report> {
            let mut s = self.state.write().unwrap();
            let id = Self::next_id(&mut s);
            let report = Report {
                id,
                reporter_id: new.reporter_id,
                listing_id: new.listing_id,
                reason: new.reason,
                created_at: Utc::now(),
                resolved: false,
            };
            s.reports.insert(id, report.clone());
            drop(s);
            self.persist();
            Ok(report)
        }

        async fn list_reports(&self) -> RepoResult<Vec<Report>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s.reports.values().cloned().collect();
            v.sort_by(|a, b| b.id.cmp(&a.id));
            Ok(v)
        }

        async fn resolve_report(&self, id: Id) -> RepoResult<Report> {
            let mut s = self.state.write().unwrap();
            let report = s.reports.get_mut(&id).ok_or(RepoError::NotFound)?;
            report.resolved = true;
            let updated = report.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }
    }

    #[async_trait]
    impl FavoriteRepo for InMemRepo {
        async fn add_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<bool> {
            let mut s = self.state.write().unwrap();
            if !s.listings.contains_key(&listing_id) {
                return Err(RepoError::NotFound);
            }
            let inserted = s.favorites.insert((user_id, listing_id));
            drop(s);
            if inserted {
                self.persist();
            }
            Ok(inserted)
        }

        async fn remove_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<bool> {
            let mut s = self.state.write().unwrap();
            let removed = s.favorites.remove(&(user_id, listing_id));
            drop(s);
            if removed {
                self.persist();
            }
            Ok(removed)
        }

        async fn is_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<bool> {
            let s = self.state.read().unwrap();
            Ok(s.favorites.contains(&(user_id, listing_id)))
        }

        async fn favorites_of(&self, user_id: Id) -> RepoResult<Vec<Listing>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .favorites
                .iter()
                .filter(|(uid, _)| *uid == user_id)
                .filter_map(|(_, lid)| s.listings.get(lid).cloned())
                .collect();
            v.sort_by(|a, b| b.id.cmp(&a.id));
            Ok(v)
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use chrono::{DateTime, Utc};
    use sqlx::{Pool, Postgres, QueryBuilder, Row};

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    }

    fn map_db(e: sqlx::Error) -> RepoError {
        match &e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::Conflict,
            _ => RepoError::Internal(e.to_string()),
        }
    }

    // Status travels as TEXT; the enum conversion happens at the row edge.
    #[derive(sqlx::FromRow)]
    struct ListingRow {
        id: Id,
        title: String,
        description: String,
        price: f64,
        location: String,
        category: String,
        status: String,
        seller_id: Id,
        reserved_by_id: Option<Id>,
        created_at: DateTime<Utc>,
    }

    impl TryFrom<ListingRow> for Listing {
        type Error = RepoError;
        fn try_from(r: ListingRow) -> Result<Self, Self::Error> {
            let status = ListingStatus::parse(&r.status)
                .ok_or_else(|| RepoError::Internal(format!("bad status '{}'", r.status)))?;
            Ok(Listing {
                id: r.id,
                title: r.title,
                description: r.description,
                price: r.price,
                location: r.location,
                category: r.category,
                status,
                seller_id: r.seller_id,
                reserved_by_id: r.reserved_by_id,
                created_at: r.created_at,
            })
        }
    }

    const LISTING_COLS: &str =
        "id, title, description, price, location, category, status, seller_id, reserved_by_id, created_at";

    fn rows_to_listings(rows: Vec<ListingRow>) -> RepoResult<Vec<Listing>> {
        rows.into_iter().map(Listing::try_from).collect()
    }

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            sqlx::query_as::<_, User>(
                "INSERT INTO users (username, password_hash) VALUES ($1, $2)
                 RETURNING id, username, password_hash, avatar_filename, is_admin, created_at",
            )
            .bind(&new.username)
            .bind(&new.password_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn get_user(&self, id: Id) -> RepoResult<User> {
            sqlx::query_as::<_, User>(
                "SELECT id, username, password_hash, avatar_filename, is_admin, created_at
                 FROM users WHERE id = $1",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn get_user_by_username(&self, username: &str) -> RepoResult<User> {
            sqlx::query_as::<_, User>(
                "SELECT id, username, password_hash, avatar_filename, is_admin, created_at
                 FROM users WHERE username = $1",
            )
            .bind(username)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn set_avatar(&self, user_id: Id, filename: &str) -> RepoResult<()> {
            let res = sqlx::query("UPDATE users SET avatar_filename = $2 WHERE id = $1")
                .bind(user_id)
                .bind(filename)
                .execute(&self.pool)
                .await
                .map_err(map_db)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        async fn list_users(&self) -> RepoResult<Vec<User>> {
            sqlx::query_as::<_, User>(
                "SELECT id, username, password_hash, avatar_filename, is_admin, created_at
                 FROM users ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)
        }
    }

    #[async_trait]
    impl ListingRepo for PgRepo {
        async fn create_listing(&self, seller_id: Id, new: NewListing) -> RepoResult<Listing> {
            let row = sqlx::query_as::<_, ListingRow>(&format!(
                "INSERT INTO listings (title, description, price, location, category, status, seller_id)
                 VALUES ($1, $2, $3, $4, $5, 'Available', $6)
                 RETURNING {LISTING_COLS}"
            ))
            .bind(&new.title)
            .bind(&new.description)
            .bind(new.price)
            .bind(&new.location)
            .bind(&new.category)
            .bind(seller_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)?;
            row.try_into()
        }

        async fn get_listing(&self, id: Id) -> RepoResult<Listing> {
            let row = sqlx::query_as::<_, ListingRow>(&format!(
                "SELECT {LISTING_COLS} FROM listings WHERE id = $1"
            ))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)?;
            row.try_into()
        }

        async fn list_listings(&self, filter: &ListingFilter) -> RepoResult<Vec<Listing>> {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("SELECT {LISTING_COLS} FROM listings WHERE TRUE"));
            if let Some(c) = &filter.category {
                qb.push(" AND category = ").push_bind(c);
            }
            if let Some(loc) = &filter.location {
                qb.push(" AND location LIKE ").push_bind(format!("%{loc}%"));
            }
            if let Some(k) = &filter.keyword {
                qb.push(" AND (title LIKE ")
                    .push_bind(format!("%{k}%"))
                    .push(" OR description LIKE ")
                    .push_bind(format!("%{k}%"))
                    .push(")");
            }
            if let Some(min) = filter.min_price {
                qb.push(" AND price >= ").push_bind(min);
            }
            if let Some(max) = filter.max_price {
                qb.push(" AND price <= ").push_bind(max);
            }
            if let Some(status) = &filter.status {
                qb.push(" AND status = ").push_bind(status);
            }
            match filter.sort {
                ListingSort::PriceAsc => qb.push(" ORDER BY price ASC"),
                ListingSort::PriceDesc => qb.push(" ORDER BY price DESC"),
                ListingSort::Newest => qb.push(" ORDER BY id DESC"),
            };
            let rows: Vec<ListingRow> = qb
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(map_db)?;
            rows_to_listings(rows)
        }

        async fn update_listing(&self, id: Id, upd: UpdateListing) -> RepoResult<Listing> {
            let row = sqlx::query_as::<_, ListingRow>(&format!(
                "UPDATE listings
                 SET title = $2, description = $3, price = $4, location = $5, category = $6
                 WHERE id = $1
                 RETURNING {LISTING_COLS}"
            ))
            .bind(id)
            .bind(&upd.title)
            .bind(&upd.description)
            .bind(upd.price)
            .bind(&upd.location)
            .bind(&upd.category)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)?;
            row.try_into()
        }

        async fn delete_listing(&self, id: Id) -> RepoResult<Vec<ListingImage>> {
            let mut tx = self.pool.begin().await.map_err(map_db)?;
            let images = sqlx::query_as::<_, ListingImage>(
                "SELECT id, listing_id, filename, is_cover FROM listing_images WHERE listing_id = $1",
            )
            .bind(id)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_db)?;
            // FKs cascade images/favorites/reviews and null report references.
            let res = sqlx::query("DELETE FROM listings WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(map_db)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            tx.commit().await.map_err(map_db)?;
            Ok(images)
        }

        async fn update_lifecycle(
            &self,
            id: Id,
            expect: ListingStatus,
            status: ListingStatus,
            reserved_by: Option<Id>,
        ) -> RepoResult<Listing> {
            let row = sqlx::query_as::<_, ListingRow>(&format!(
                "UPDATE listings SET status = $2, reserved_by_id = $3
                 WHERE id = $1 AND status = $4
                 RETURNING {LISTING_COLS}"
            ))
            .bind(id)
            .bind(status.as_str())
            .bind(reserved_by)
            .bind(expect.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db)?;
            match row {
                Some(r) => r.try_into(),
                None => {
                    // Row gone, or someone else won the race.
                    let exists = sqlx::query("SELECT 1 FROM listings WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(map_db)?;
                    Err(if exists.is_some() { RepoError::Conflict } else { RepoError::NotFound })
                }
            }
        }

        async fn listings_by_seller(&self, seller_id: Id) -> RepoResult<Vec<Listing>> {
            let rows = sqlx::query_as::<_, ListingRow>(&format!(
                "SELECT {LISTING_COLS} FROM listings WHERE seller_id = $1 ORDER BY id DESC"
            ))
            .bind(seller_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)?;
            rows_to_listings(rows)
        }

        async fn sold_listings_for_buyer(&self, buyer_id: Id) -> RepoResult<Vec<Listing>> {
            let rows = sqlx::query_as::<_, ListingRow>(&format!(
                "SELECT {LISTING_COLS} FROM listings
                 WHERE reserved_by_id = $1 AND status = 'Sold' ORDER BY id DESC"
            ))
            .bind(buyer_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)?;
            rows_to_listings(rows)
        }

        async fn sold_listings_for_seller(&self, seller_id: Id) -> RepoResult<Vec<Listing>> {
            let rows = sqlx::query_as::<_, ListingRow>(&format!(
                "SELECT {LISTING_COLS} FROM listings
                 WHERE seller_id = $1 AND status = 'Sold' ORDER BY id DESC"
            ))
            .bind(seller_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)?;
            rows_to_listings(rows)
        }

        async fn distinct_locations(&self) -> RepoResult<Vec<String>> {
            let rows = sqlx::query(
                "SELECT DISTINCT location FROM listings WHERE location <> '' ORDER BY location",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)?;
            Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
        }

        async fn add_image(&self, listing_id: Id, filename: &str, is_cover: bool) -> RepoResult<ListingImage> {
            sqlx::query_as::<_, ListingImage>(
                "INSERT INTO listing_images (listing_id, filename, is_cover)
                 VALUES ($1, $2, $3)
                 RETURNING id, listing_id, filename, is_cover",
            )
            .bind(listing_id)
            .bind(filename)
            .bind(is_cover)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn list_images(&self, listing_id: Id) -> RepoResult<Vec<ListingImage>> {
            sqlx::query_as::<_, ListingImage>(
                "SELECT id, listing_id, filename, is_cover
                 FROM listing_images WHERE listing_id = $1 ORDER BY id",
            )
            .bind(listing_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn delete_images(&self, listing_id: Id, image_ids: &[Id]) -> RepoResult<Vec<ListingImage>> {
            sqlx::query_as::<_, ListingImage>(
                "DELETE FROM listing_images
                 WHERE listing_id = $1 AND id = ANY($2)
                 RETURNING id, listing_id, filename, is_cover",
            )
            .bind(listing_id)
            .bind(image_ids.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn set_cover_image(&self, listing_id: Id, image_id: Option<Id>) -> RepoResult<()> {
            let mut tx = self.pool.begin().await.map_err(map_db)?;
            sqlx::query("UPDATE listing_images SET is_cover = FALSE WHERE listing_id = $1")
                .bind(listing_id)
                .execute(&mut *tx)
                .await
                .map_err(map_db)?;
            if let Some(iid) = image_id {
                sqlx::query(
                    "UPDATE listing_images SET is_cover = TRUE WHERE listing_id = $1 AND id = $2",
                )
                .bind(listing_id)
                .bind(iid)
                .execute(&mut *tx)
                .await
                .map_err(map_db)?;
            }
            tx.commit().await.map_err(map_db)
        }
    }

    #[async_trait]
    impl MessageRepo for PgRepo {
        async fn create_message(&self, new: NewMessage) -> RepoResult<Message> {
            sqlx::query_as::<_, Message>(
                "INSERT INTO messages (sender_id, recipient_id, content)
                 VALUES ($1, $2, $3)
                 RETURNING id, sender_id, recipient_id, content, created_at, read",
            )
            .bind(new.sender_id)
            .bind(new.recipient_id)
            .bind(&new.content)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn conversation_partners(&self, user_id: Id) -> RepoResult<Vec<Id>> {
            let rows = sqlx::query(
                "SELECT DISTINCT CASE WHEN sender_id = $1 THEN recipient_id ELSE sender_id END AS partner
                 FROM messages WHERE sender_id = $1 OR recipient_id = $1
                 ORDER BY partner",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)?;
            Ok(rows.into_iter().map(|r| r.get::<Id, _>(0)).collect())
        }

        async fn last_message_between(&self, a: Id, b: Id) -> RepoResult<Option<Message>> {
            sqlx::query_as::<_, Message>(
                "SELECT id, sender_id, recipient_id, content, created_at, read
                 FROM messages
                 WHERE (sender_id = $1 AND recipient_id = $2)
                    OR (sender_id = $2 AND recipient_id = $1)
                 ORDER BY created_at DESC, id DESC LIMIT 1",
            )
            .bind(a)
            .bind(b)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn messages_between(&self, a: Id, b: Id) -> RepoResult<Vec<Message>> {
            sqlx::query_as::<_, Message>(
                "SELECT id, sender_id, recipient_id, content, created_at, read
                 FROM messages
                 WHERE (sender_id = $1 AND recipient_id = $2)
                    OR (sender_id = $2 AND recipient_id = $1)
                 ORDER BY created_at ASC, id ASC",
            )
            .bind(a)
            .bind(b)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn unread_from(&self, sender_id: Id, recipient_id: Id) -> RepoResult<i64> {
            let row = sqlx::query(
                "SELECT COUNT(*) FROM messages
                 WHERE sender_id = $1 AND recipient_id = $2 AND read = FALSE",
            )
            .bind(sender_id)
            .bind(recipient_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)?;
            Ok(row.get::<i64, _>(0))
        }

        async fn unread_total(&self, recipient_id: Id) -> RepoResult<i64> {
            let row = sqlx::query(
                "SELECT COUNT(*) FROM messages WHERE recipient_id = $1 AND read = FALSE",
            )
            .bind(recipient_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)?;
            Ok(row.get::<i64, _>(0))
        }

        async fn mark_read(&self, sender_id: Id, recipient_id: Id) -> RepoResult<()> {
            sqlx::query(
                "UPDATE messages SET read = TRUE
                 WHERE sender_id = $1 AND recipient_id = $2 AND read = FALSE",
            )
            .bind(sender_id)
            .bind(recipient_id)
            .execute(&self.pool)
            .await
            .map_err(map_db)?;
            Ok(())
        }
    }

    #[async_trait]
    impl ReviewRepo for PgRepo {
        async fn create_review(&self, new: NewReview) -> RepoResult<Review> {
            sqlx::query_as::<_, Review>(
                "INSERT INTO reviews (reviewer_id, reviewee_id, listing_id, rating, comment)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id, reviewer_id, reviewee_id, listing_id, rating, comment, created_at",
            )
            .bind(new.reviewer_id)
            .bind(new.reviewee_id)
            .bind(new.listing_id)
            .bind(new.rating)
            .bind(&new.comment)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn reviews_for(&self, reviewee_id: Id) -> RepoResult<Vec<Review>> {
            sqlx::query_as::<_, Review>(
                "SELECT id, reviewer_id, reviewee_id, listing_id, rating, comment, created_at
                 FROM reviews WHERE reviewee_id = $1 ORDER BY id",
            )
            .bind(reviewee_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn reviews_for_listing(&self, listing_id: Id) -> RepoResult<Vec<Review>> {
            sqlx::query_as::<_, Review>(
                "SELECT id, reviewer_id, reviewee_id, listing_id, rating, comment, created_at
                 FROM reviews WHERE listing_id = $1 ORDER BY id",
            )
            .bind(listing_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)
        }
    }

    #[async_trait]
    impl ReportRepo for PgRepo {
        async fn create_report(&self, new: NewReport) -> RepoResult<Report> {
            sqlx::query_as::<_, Report>(
                "INSERT INTO reports (reporter_id, listing_id, reason)
                 VALUES ($1, $2, $3)
                 RETURNING id, reporter_id, listing_id, reason, created_at, resolved",
            )
            .bind(new.reporter_id)
            .bind(new.listing_id)
            .bind(&new.reason)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn list_reports(&self) -> RepoResult<Vec<Report>> {
            sqlx::query_as::<_, Report>(
                "SELECT id, reporter_id, listing_id, reason, created_at, resolved
                 FROM reports ORDER BY id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)
        }

        async fn resolve_report(&self, id: Id) -> RepoResult<Report> {
            sqlx::query_as::<_, Report>(
                "UPDATE reports SET resolved = TRUE WHERE id = $1
                 RETURNING id, reporter_id, listing_id, reason, created_at, resolved",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db)
        }
    }

    #[async_trait]
    impl FavoriteRepo for PgRepo {
        async fn add_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<bool> {
            let res = sqlx::query(
                "INSERT INTO favorites (user_id, listing_id) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(user_id)
            .bind(listing_id)
            .execute(&self.pool)
            .await
            .map_err(map_db)?;
            Ok(res.rows_affected() > 0)
        }

        async fn remove_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<bool> {
            let res = sqlx::query(
                "DELETE FROM favorites WHERE user_id = $1 AND listing_id = $2",
            )
            .bind(user_id)
            .bind(listing_id)
            .execute(&self.pool)
            .await
            .map_err(map_db)?;
            Ok(res.rows_affected() > 0)
        }

        async fn is_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<bool> {
            let row = sqlx::query(
                "SELECT 1 FROM favorites WHERE user_id = $1 AND listing_id = $2",
            )
            .bind(user_id)
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db)?;
            Ok(row.is_some())
        }

        async fn favorites_of(&self, user_id: Id) -> RepoResult<Vec<Listing>> {
            let rows = sqlx::query_as::<_, ListingRow>(
                "SELECT l.id, l.title, l.description, l.price, l.location, l.category,
                        l.status, l.seller_id, l.reserved_by_id, l.created_at
                 FROM listings l
                 JOIN favorites f ON f.listing_id = l.id
                 WHERE f.user_id = $1
                 ORDER BY l.id DESC",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db)?;
            rows_to_listings(rows)
        }
    }
}
