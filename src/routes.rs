use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::TryStreamExt as _;
use serde_json::json;

use crate::auth::{create_jwt, hash_password, verify_password, Auth};
use crate::error::ApiError;
use crate::lifecycle::{self, LifecycleAction};
use crate::models::*;
use crate::rate_limit::RateLimiterFacade;
use crate::repo::{Repo, RepoError};
use crate::storage::{
    allowed_file, is_servable_name, secure_filename, MediaKind, MediaStore, MediaStoreError,
    UPLOAD_SIZE_LIMIT,
};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/auth/register").route(web::post().to(register)))
            .service(web::resource("/auth/login").route(web::post().to(login)))
            .service(web::resource("/auth/me").route(web::get().to(auth_me)))
            .service(web::resource("/listings").route(web::get().to(list_listings)))
            .service(web::resource("/listings/locations").route(web::get().to(listing_locations)))
            .service(web::resource("/listings/categories").route(web::get().to(listing_categories)))
            .service(web::resource("/listing/new").route(web::post().to(create_listing)))
            .service(web::resource("/listing/{id}").route(web::get().to(listing_detail)))
            .service(web::resource("/listing/{id}/edit").route(web::post().to(edit_listing)))
            .service(web::resource("/listing/{id}/delete").route(web::post().to(delete_listing)))
            .service(web::resource("/listing/{id}/reserve").route(web::post().to(reserve_listing)))
            .service(
                web::resource("/listing/{id}/cancel_reservation")
                    .route(web::post().to(cancel_reservation)),
            )
            .service(web::resource("/listing/{id}/relist").route(web::post().to(relist_listing)))
            .service(web::resource("/listing/{id}/mark_sold").route(web::post().to(mark_sold)))
            .service(
                web::resource("/user/{username}")
                    .route(web::get().to(user_profile))
                    .route(web::post().to(upload_avatar)),
            )
            .service(web::resource("/conversations").route(web::get().to(conversations)))
            // registered before /messages/{username} so the literal segment wins
            .service(web::resource("/messages/unread_count").route(web::get().to(unread_count)))
            .service(
                web::resource("/messages/{username}")
                    .route(web::get().to(conversation_thread))
                    .route(web::post().to(post_in_thread)),
            )
            .service(web::resource("/message/send/{recipient_id}").route(web::post().to(send_message)))
            .service(web::resource("/my/favorites").route(web::get().to(my_favorites)))
            .service(web::resource("/my/purchases").route(web::get().to(my_purchases)))
            .service(web::resource("/my/sales").route(web::get().to(my_sales)))
            .service(web::resource("/favorite/{id}").route(web::post().to(favorite_listing)))
            .service(web::resource("/unfavorite/{id}").route(web::post().to(unfavorite_listing)))
            .service(
                web::resource("/review/{listing_id}/{reviewee_id}")
                    .route(web::post().to(submit_review)),
            )
            .service(web::resource("/report/listing/{id}").route(web::post().to(report_listing)))
            .service(web::resource("/admin").route(web::get().to(admin_dashboard)))
            .service(
                web::resource("/admin/reports/{id}/resolve")
                    .route(web::post().to(admin_resolve_report)),
            ),
    );
    // Unprefixed file routes so direct <img src="/uploads/..."> URLs work.
    cfg.route("/uploads/{filename}", web::get().to(serve_upload));
    cfg.route("/avatars/{filename}", web::get().to(serve_avatar));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub media: Arc<dyn MediaStore>,
    pub rate_limiter: Option<RateLimiterFacade>,
}

fn client_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string()
}

fn too_many_requests() -> HttpResponse {
    HttpResponse::TooManyRequests().json(json!({"error": "rate_limited"}))
}

/// Flash-style action outcome: guard failures answer 200 with a rejection
/// message instead of an HTTP error, leaving state untouched.
fn outcome(status: &'static str, message: &str) -> serde_json::Value {
    json!({"status": status, "message": message})
}

// ---------------- Auth ----------------

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    request_body = Credentials,
    responses(
        (status = 201, description = "Account created", body = UserPublic),
        (status = 409, description = "Username already exists"),
        (status = 400, description = "Blank username or password")
    )
)]
pub async fn register(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<Credentials>,
) -> Result<HttpResponse, ApiError> {
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow_auth(&client_ip(&req)) {
            return Ok(too_many_requests());
        }
    }
    let username = payload.username.trim();
    if username.is_empty() || payload.password.is_empty() {
        return Err(ApiError::BadRequest);
    }
    let password_hash = hash_password(&payload.password).map_err(|e| {
        log::error!("password hashing failed: {e}");
        ApiError::Internal
    })?;
    let user = data
        .repo
        .create_user(NewUser {
            username: username.to_string(),
            password_hash,
        })
        .await?;
    Ok(HttpResponse::Created().json(UserPublic::from(&user)))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = Credentials,
    responses(
        (status = 200, description = "Session token issued"),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<Credentials>,
) -> Result<HttpResponse, ApiError> {
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow_auth(&client_ip(&req)) {
            return Ok(too_many_requests());
        }
    }
    let user = match data.repo.get_user_by_username(&payload.username).await {
        Ok(u) => u,
        Err(RepoError::NotFound) => {
            return Ok(HttpResponse::Unauthorized().json(json!({"error": "invalid credentials"})))
        }
        Err(e) => return Err(e.into()),
    };
    if !verify_password(&payload.password, &user.password_hash) {
        return Ok(HttpResponse::Unauthorized().json(json!({"error": "invalid credentials"})));
    }
    let token = create_jwt(&user).map_err(|_| ApiError::Internal)?;
    Ok(HttpResponse::Ok().json(json!({"token": token, "user": UserPublic::from(&user)})))
}

pub async fn auth_me(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.get_user(auth.user_id()?).await?;
    Ok(HttpResponse::Ok().json(UserPublic::from(&user)))
}

// ---------------- Listings: search & detail ----------------

#[derive(serde::Deserialize)]
pub struct ListingsQuery {
    category: Option<String>,
    keyword: Option<String>,
    location: Option<String>,
    min_price: Option<String>,
    max_price: Option<String>,
    status: Option<String>,
    sort: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

impl ListingsQuery {
    fn into_filter(self) -> ListingFilter {
        ListingFilter {
            category: non_empty(self.category),
            keyword: non_empty(self.keyword),
            location: non_empty(self.location),
            // Malformed numbers are dropped, not rejected.
            min_price: non_empty(self.min_price).and_then(|v| v.parse().ok()),
            max_price: non_empty(self.max_price).and_then(|v| v.parse().ok()),
            status: non_empty(self.status),
            sort: ListingSort::from_param(self.sort.as_deref().unwrap_or("newest")),
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/listings",
    params(
        ("category" = Option<String>, Query, description = "Exact category"),
        ("keyword" = Option<String>, Query, description = "Substring over title or description"),
        ("location" = Option<String>, Query, description = "Substring over location"),
        ("min_price" = Option<String>, Query, description = "Lower price bound; malformed input ignored"),
        ("max_price" = Option<String>, Query, description = "Upper price bound; malformed input ignored"),
        ("status" = Option<String>, Query, description = "Available | Reserved | Sold"),
        ("sort" = Option<String>, Query, description = "price_asc | price_desc | newest")
    ),
    responses((status = 200, description = "Filtered listings", body = [Listing]))
)]
pub async fn list_listings(
    query: web::Query<ListingsQuery>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let listings = data.repo.list_listings(&query.into_inner().into_filter()).await?;
    Ok(HttpResponse::Ok().json(listings))
}

pub async fn listing_locations(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let locations = data.repo.distinct_locations().await?;
    Ok(HttpResponse::Ok().json(locations))
}

pub async fn listing_categories() -> HttpResponse {
    HttpResponse::Ok().json(CATEGORIES)
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct ListingDetail {
    pub listing: Listing,
    pub seller: UserPublic,
    pub images: Vec<ListingImage>,
    pub reviews: Vec<Review>,
}

#[utoipa::path(
    get,
    path = "/api/v1/listing/{id}",
    params(("id" = Id, Path, description = "Listing id")),
    responses(
        (status = 200, description = "Listing with images and reviews", body = ListingDetail),
        (status = 404, description = "Listing not found")
    )
)]
pub async fn listing_detail(
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let listing = data.repo.get_listing(path.into_inner()).await?;
    let seller = data.repo.get_user(listing.seller_id).await?;
    let images = data.repo.list_images(listing.id).await?;
    let reviews = data.repo.reviews_for_listing(listing.id).await?;
    Ok(HttpResponse::Ok().json(ListingDetail {
        seller: UserPublic::from(&seller),
        listing,
        images,
        reviews,
    }))
}

// ---------------- Multipart form plumbing ----------------

struct UploadedFile {
    filename: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct FormData {
    fields: std::collections::HashMap<String, String>,
    files: Vec<(String, UploadedFile)>,
}

impl FormData {
    fn text(&self, name: &str) -> Result<&str, ApiError> {
        self.fields.get(name).map(String::as_str).ok_or(ApiError::BadRequest)
    }

    fn text_or(&self, name: &str, default: &'static str) -> String {
        self.fields.get(name).cloned().unwrap_or_else(|| default.to_string())
    }

    fn files_named<'a>(&'a self, name: &str) -> Vec<&'a UploadedFile> {
        self.files
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, f)| f)
            .collect()
    }
}

/// Drain a multipart payload into memory, capping the total at the 2 MB
/// request budget. Parts with a filename become files; the rest are UTF-8
/// text fields.
async fn read_form(payload: &mut Multipart) -> Result<FormData, ApiError> {
    let mut form = FormData::default();
    let mut total = 0usize;
    while let Some(mut field) = payload.try_next().await.map_err(|e| {
        log::error!("multipart error: {e}");
        ApiError::BadRequest
    })? {
        let name = field
            .content_disposition()
            .get_name()
            .unwrap_or_default()
            .to_string();
        let filename = field
            .content_disposition()
            .get_filename()
            .map(|f| f.to_string());
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(|e| {
            log::error!("stream read error: {e}");
            ApiError::Internal
        })? {
            total += chunk.len();
            if total > UPLOAD_SIZE_LIMIT {
                return Err(ApiError::PayloadTooLarge);
            }
            bytes.extend_from_slice(&chunk);
        }
        match filename {
            Some(f) if !f.is_empty() => form.files.push((name, UploadedFile { filename: f, bytes })),
            _ => {
                let text = String::from_utf8(bytes).map_err(|_| ApiError::BadRequest)?;
                form.fields.insert(name, text);
            }
        }
    }
    Ok(form)
}

fn parse_price(raw: &str) -> Result<f64, ApiError> {
    raw.trim().parse().map_err(|_| ApiError::BadRequest)
}

// ---------------- Listings: create / edit / delete ----------------

pub async fn create_listing(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow_listing(&client_ip(&req)) {
            return Ok(too_many_requests());
        }
    }
    let uid = auth.user_id()?;
    let form = read_form(&mut payload).await?;
    let new = NewListing {
        title: form.text("title")?.to_string(),
        description: form.text("description")?.to_string(),
        price: parse_price(form.text("price")?)?,
        category: form.text("category")?.to_string(),
        location: form.text("location")?.to_string(),
    };
    let cover_index: usize = form.text_or("cover_index", "0").parse().unwrap_or(0);
    let listing = data.repo.create_listing(uid, new).await?;

    for (i, file) in form.files_named("images").into_iter().enumerate() {
        if !allowed_file(&file.filename) {
            continue;
        }
        let stored = format!("{}_{}_{}", uid, listing.id, secure_filename(&file.filename));
        data.media
            .save(MediaKind::ListingImage, &stored, &file.bytes)
            .await
            .map_err(|e| {
                log::error!("media save error: {e}");
                ApiError::Internal
            })?;
        data.repo
            .add_image(listing.id, &stored, i == cover_index)
            .await?;
    }
    Ok(HttpResponse::Created().json(json!({
        "status": "ok",
        "message": "Listing created!",
        "listing": listing
    })))
}

pub async fn edit_listing(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let uid = auth.user_id()?;
    let listing = data.repo.get_listing(path.into_inner()).await?;
    if listing.seller_id != uid {
        return Err(ApiError::Forbidden);
    }
    let form = read_form(&mut payload).await?;
    let upd = UpdateListing {
        title: form.text("title")?.to_string(),
        description: form.text("description")?.to_string(),
        price: parse_price(form.text("price")?)?,
        category: form.text("category")?.to_string(),
        location: form.text("location")?.to_string(),
    };
    let listing = data.repo.update_listing(listing.id, upd).await?;

    // Remove images the seller ticked for deletion, files included.
    let delete_ids: Vec<Id> = form
        .text_or("delete_image_ids", "")
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if !delete_ids.is_empty() {
        let removed = data.repo.delete_images(listing.id, &delete_ids).await?;
        for img in removed {
            let _ = data.media.delete(MediaKind::ListingImage, &img.filename).await;
        }
    }

    // Cover selection: every flag is reset, then an existing image wins over
    // a newly uploaded one.
    let cover_existing: Option<Id> = form.text_or("cover_existing", "").trim().parse().ok();
    data.repo.set_cover_image(listing.id, cover_existing).await?;
    let cover_index_new: Option<usize> = form.text_or("cover_index_new", "").trim().parse().ok();

    for (i, file) in form.files_named("images").into_iter().enumerate() {
        if !allowed_file(&file.filename) {
            continue;
        }
        let stored = format!("{}_{}_{}", uid, listing.id, secure_filename(&file.filename));
        data.media
            .save(MediaKind::ListingImage, &stored, &file.bytes)
            .await
            .map_err(|e| {
                log::error!("media save error: {e}");
                ApiError::Internal
            })?;
        let is_cover = cover_index_new == Some(i) && cover_existing.is_none();
        data.repo.add_image(listing.id, &stored, is_cover).await?;
    }
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "message": "Listing updated!",
        "listing": listing
    })))
}

pub async fn delete_listing(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let uid = auth.user_id()?;
    let listing = data.repo.get_listing(path.into_inner()).await?;
    if listing.seller_id != uid {
        return Err(ApiError::Forbidden);
    }
    let images = data.repo.delete_listing(listing.id).await?;
    for img in images {
        let _ = data.media.delete(MediaKind::ListingImage, &img.filename).await;
    }
    Ok(HttpResponse::Ok().json(outcome("ok", "Listing deleted.")))
}

// ---------------- Listing lifecycle ----------------

async fn run_transition(
    auth: Auth,
    data: web::Data<AppState>,
    listing_id: Id,
    action: LifecycleAction,
) -> Result<HttpResponse, ApiError> {
    let actor = auth.user_id()?;
    let listing = data.repo.get_listing(listing_id).await?;
    let transition = match lifecycle::apply(&listing, actor, action) {
        Ok(t) => t,
        Err(denied) => {
            metrics::increment_counter!(
                "listing_lifecycle_transitions_total",
                "action" => action.as_str(),
                "outcome" => "rejected"
            );
            return Ok(HttpResponse::Ok().json(outcome("rejected", &denied.to_string())));
        }
    };
    match data
        .repo
        .update_lifecycle(
            listing.id,
            transition.expect,
            transition.status,
            transition.reserved_by,
        )
        .await
    {
        Ok(updated) => {
            metrics::increment_counter!(
                "listing_lifecycle_transitions_total",
                "action" => action.as_str(),
                "outcome" => "ok"
            );
            Ok(HttpResponse::Ok().json(json!({
                "status": "ok",
                "message": transition.message,
                "listing": updated
            })))
        }
        // Someone else advanced the listing between the guard and the
        // commit; the race loser gets a rejection, not a second win.
        Err(RepoError::Conflict) => {
            metrics::increment_counter!(
                "listing_lifecycle_transitions_total",
                "action" => action.as_str(),
                "outcome" => "conflict"
            );
            Ok(HttpResponse::Ok().json(outcome(
                "rejected",
                "The listing changed while processing your request. Please try again.",
            )))
        }
        Err(e) => Err(e.into()),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/listing/{id}/reserve",
    params(("id" = Id, Path, description = "Listing id")),
    responses(
        (status = 200, description = "Outcome message; rejected reservations leave state unchanged"),
        (status = 404, description = "Listing not found")
    )
)]
pub async fn reserve_listing(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    run_transition(auth, data, path.into_inner(), LifecycleAction::Reserve).await
}

#[utoipa::path(
    post,
    path = "/api/v1/listing/{id}/cancel_reservation",
    params(("id" = Id, Path, description = "Listing id")),
    responses((status = 200, description = "Outcome message"), (status = 404, description = "Listing not found"))
)]
pub async fn cancel_reservation(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    run_transition(auth, data, path.into_inner(), LifecycleAction::CancelReservation).await
}

#[utoipa::path(
    post,
    path = "/api/v1/listing/{id}/relist",
    params(("id" = Id, Path, description = "Listing id")),
    responses((status = 200, description = "Outcome message"), (status = 404, description = "Listing not found"))
)]
pub async fn relist_listing(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    run_transition(auth, data, path.into_inner(), LifecycleAction::Relist).await
}

#[utoipa::path(
    post,
    path = "/api/v1/listing/{id}/mark_sold",
    params(("id" = Id, Path, description = "Listing id")),
    responses((status = 200, description = "Outcome message"), (status = 404, description = "Listing not found"))
)]
pub async fn mark_sold(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    run_transition(auth, data, path.into_inner(), LifecycleAction::MarkSold).await
}

// ---------------- Profiles & avatars ----------------

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct UserProfile {
    pub user: UserPublic,
    pub listings: Vec<Listing>,
    pub reviews: Vec<Review>,
    /// Mean received rating to 2 decimals; absent when unreviewed.
    pub avg_rating: Option<f64>,
}

#[utoipa::path(
    get,
    path = "/api/v1/user/{username}",
    params(("username" = String, Path, description = "Profile owner")),
    responses(
        (status = 200, description = "Profile with listings and reviews", body = UserProfile),
        (status = 404, description = "No such user")
    )
)]
pub async fn user_profile(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user = data.repo.get_user_by_username(&path.into_inner()).await?;
    let listings = data.repo.listings_by_seller(user.id).await?;
    let reviews = data.repo.reviews_for(user.id).await?;
    let avg_rating = average_rating(&reviews);
    Ok(HttpResponse::Ok().json(UserProfile {
        user: UserPublic::from(&user),
        listings,
        reviews,
        avg_rating,
    }))
}

pub async fn upload_avatar(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let user = data.repo.get_user_by_username(&path.into_inner()).await?;
    if auth.user_id()? != user.id {
        return Err(ApiError::Forbidden);
    }
    let form = read_form(&mut payload).await?;
    let Some(file) = form.files_named("avatar").into_iter().next() else {
        return Err(ApiError::BadRequest);
    };
    if !allowed_file(&file.filename) {
        return Ok(HttpResponse::Ok().json(outcome(
            "rejected",
            "Avatars must be png, jpg, jpeg or gif.",
        )));
    }
    let stored = format!("{}_{}", user.id, secure_filename(&file.filename));
    data.media
        .save(MediaKind::Avatar, &stored, &file.bytes)
        .await
        .map_err(|e| {
            log::error!("media save error: {e}");
            ApiError::Internal
        })?;
    data.repo.set_avatar(user.id, &stored).await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "message": "Avatar updated!",
        "avatar_filename": stored
    })))
}

// ---------------- Messaging ----------------

pub async fn conversations(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let uid = auth.user_id()?;
    let partners = data.repo.conversation_partners(uid).await?;
    let mut threads = Vec::with_capacity(partners.len());
    for pid in partners {
        let user = match data.repo.get_user(pid).await {
            Ok(u) => u,
            Err(RepoError::NotFound) => continue,
            Err(e) => return Err(e.into()),
        };
        let last_message = data.repo.last_message_between(uid, pid).await?;
        let unread = data.repo.unread_from(pid, uid).await?;
        threads.push(ConversationSummary {
            user: UserPublic::from(&user),
            last_message,
            unread,
        });
    }
    // Most recent traffic first; partners with no messages sink to the end.
    threads.sort_by(|a, b| {
        let ka = a.last_message.as_ref().map(|m| (m.created_at, m.id));
        let kb = b.last_message.as_ref().map(|m| (m.created_at, m.id));
        kb.cmp(&ka)
    });
    Ok(HttpResponse::Ok().json(threads))
}

pub async fn unread_count(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let count = data.repo.unread_total(auth.user_id()?).await?;
    Ok(HttpResponse::Ok().json(json!({"count": count})))
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct ConversationThread {
    pub other: UserPublic,
    pub messages: Vec<Message>,
}

#[utoipa::path(
    get,
    path = "/api/v1/messages/{username}",
    params(("username" = String, Path, description = "Counterparty")),
    responses(
        (status = 200, description = "Thread, oldest first; unread messages from the counterparty are marked read", body = ConversationThread),
        (status = 404, description = "No such user")
    )
)]
pub async fn conversation_thread(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let uid = auth.user_id()?;
    let other = data.repo.get_user_by_username(&path.into_inner()).await?;
    // Reading the thread is what clears the unread flags.
    data.repo.mark_read(other.id, uid).await?;
    let messages = data.repo.messages_between(uid, other.id).await?;
    Ok(HttpResponse::Ok().json(ConversationThread {
        other: UserPublic::from(&other),
        messages,
    }))
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct MessageForm {
    pub content: String,
}

pub async fn post_in_thread(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<MessageForm>,
) -> Result<HttpResponse, ApiError> {
    let other = data.repo.get_user_by_username(&path.into_inner()).await?;
    deliver_message(req, auth, data, other.id, payload.into_inner()).await
}

pub async fn send_message(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<MessageForm>,
) -> Result<HttpResponse, ApiError> {
    let recipient = data.repo.get_user(path.into_inner()).await?;
    deliver_message(req, auth, data, recipient.id, payload.into_inner()).await
}

async fn deliver_message(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    recipient_id: Id,
    form: MessageForm,
) -> Result<HttpResponse, ApiError> {
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow_message(&client_ip(&req)) {
            return Ok(too_many_requests());
        }
    }
    if form.content.trim().is_empty() {
        return Ok(HttpResponse::Ok().json(outcome("rejected", "Message cannot be empty.")));
    }
    let msg = data
        .repo
        .create_message(NewMessage {
            sender_id: auth.user_id()?,
            recipient_id,
            content: form.content,
        })
        .await?;
    Ok(HttpResponse::Created().json(json!({
        "status": "ok",
        "message": "Message sent!",
        "sent": msg
    })))
}

// ---------------- Favorites ----------------

pub async fn my_favorites(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let listings = data.repo.favorites_of(auth.user_id()?).await?;
    Ok(HttpResponse::Ok().json(listings))
}

pub async fn my_purchases(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let listings = data.repo.sold_listings_for_buyer(auth.user_id()?).await?;
    Ok(HttpResponse::Ok().json(listings))
}

pub async fn my_sales(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let listings = data.repo.sold_listings_for_seller(auth.user_id()?).await?;
    Ok(HttpResponse::Ok().json(listings))
}

#[utoipa::path(
    post,
    path = "/api/v1/favorite/{id}",
    params(("id" = Id, Path, description = "Listing id")),
    responses(
        (status = 200, description = "Outcome; re-adding and own listings are no-ops"),
        (status = 404, description = "Listing not found")
    )
)]
pub async fn favorite_listing(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let uid = auth.user_id()?;
    let listing = data.repo.get_listing(path.into_inner()).await?;
    if data.repo.is_favorite(uid, listing.id).await? {
        return Ok(HttpResponse::Ok().json(outcome("noop", "Already in favorites.")));
    }
    if listing.seller_id == uid {
        return Ok(HttpResponse::Ok().json(outcome("rejected", "You cannot favorite your own listing.")));
    }
    data.repo.add_favorite(uid, listing.id).await?;
    Ok(HttpResponse::Ok().json(outcome("ok", "Added to favorites.")))
}

#[utoipa::path(
    post,
    path = "/api/v1/unfavorite/{id}",
    params(("id" = Id, Path, description = "Listing id")),
    responses(
        (status = 200, description = "Outcome; removing a non-favorite is a no-op"),
        (status = 404, description = "Listing not found")
    )
)]
pub async fn unfavorite_listing(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let uid = auth.user_id()?;
    let listing = data.repo.get_listing(path.into_inner()).await?;
    if data.repo.remove_favorite(uid, listing.id).await? {
        Ok(HttpResponse::Ok().json(outcome("ok", "Removed from favorites.")))
    } else {
        Ok(HttpResponse::Ok().json(outcome("noop", "Not in favorites.")))
    }
}

// ---------------- Reviews ----------------

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct ReviewForm {
    pub rating: i32,
    pub comment: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/review/{listing_id}/{reviewee_id}",
    request_body = ReviewForm,
    params(
        ("listing_id" = Id, Path, description = "The sold listing"),
        ("reviewee_id" = Id, Path, description = "The counterparty being reviewed")
    ),
    responses(
        (status = 200, description = "Outcome; only completed-transaction participants may review, once"),
        (status = 404, description = "Listing or user not found")
    )
)]
pub async fn submit_review(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
    payload: web::Json<ReviewForm>,
) -> Result<HttpResponse, ApiError> {
    let (listing_id, reviewee_id) = path.into_inner();
    let uid = auth.user_id()?;
    let listing = data.repo.get_listing(listing_id).await?;
    let reviewee = data.repo.get_user(reviewee_id).await?;
    let participant = uid == listing.seller_id || Some(uid) == listing.reserved_by_id;
    if listing.status != ListingStatus::Sold || !participant {
        return Ok(HttpResponse::Ok().json(outcome("rejected", "You cannot review this transaction.")));
    }
    match data
        .repo
        .create_review(NewReview {
            reviewer_id: uid,
            reviewee_id: reviewee.id,
            listing_id: listing.id,
            rating: payload.rating,
            comment: payload.comment.clone(),
        })
        .await
    {
        Ok(review) => Ok(HttpResponse::Ok().json(json!({
            "status": "ok",
            "message": "Review submitted!",
            "review": review
        }))),
        Err(RepoError::Conflict) => Ok(HttpResponse::Ok().json(outcome(
            "noop",
            "You have already reviewed this user for this transaction.",
        ))),
        Err(e) => Err(e.into()),
    }
}

// ---------------- Moderation ----------------

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct ReportForm {
    pub reason: String,
}

pub async fn report_listing(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<ReportForm>,
) -> Result<HttpResponse, ApiError> {
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow_report(&client_ip(&req)) {
            return Ok(too_many_requests());
        }
    }
    let listing = data.repo.get_listing(path.into_inner()).await?;
    data.repo
        .create_report(NewReport {
            reporter_id: auth.user_id()?,
            listing_id: Some(listing.id),
            reason: payload.reason.clone(),
        })
        .await?;
    Ok(HttpResponse::Created().json(outcome(
        "ok",
        "Report submitted. Thank you for helping keep the platform safe.",
    )))
}

macro_rules! ensure_admin {
    ($auth:expr) => {
        if !$auth.0.admin {
            return Err(ApiError::Forbidden);
        }
    };
}

pub async fn admin_dashboard(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let reports = data.repo.list_reports().await?;
    let users: Vec<UserPublic> = data
        .repo
        .list_users()
        .await?
        .iter()
        .map(UserPublic::from)
        .collect();
    let listings = data.repo.list_listings(&ListingFilter::default()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "reports": reports,
        "users": users,
        "listings": listings
    })))
}

pub async fn admin_resolve_report(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin!(auth);
    let report = data.repo.resolve_report(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(report))
}

// ---------------- Stored file serving ----------------

async fn serve_media(
    data: &AppState,
    kind: MediaKind,
    name: &str,
) -> Result<HttpResponse, ApiError> {
    if !is_servable_name(name) {
        return Err(ApiError::NotFound);
    }
    match data.media.load(kind, name).await {
        Ok(bytes) => {
            let mime = infer::get(&bytes)
                .map(|t| t.mime_type().to_string())
                .unwrap_or_else(|| "application/octet-stream".into());
            Ok(HttpResponse::Ok()
                .insert_header(("Content-Type", mime))
                .body(bytes))
        }
        Err(MediaStoreError::NotFound) => Err(ApiError::NotFound),
        Err(e) => {
            log::error!("media load error: {e}");
            Err(ApiError::Internal)
        }
    }
}

pub async fn serve_upload(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    serve_media(&data, MediaKind::ListingImage, &path.into_inner()).await
}

pub async fn serve_avatar(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    serve_media(&data, MediaKind::Avatar, &path.into_inner()).await
}
