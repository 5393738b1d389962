#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use loppis::auth::create_jwt;
use loppis::models::{ListingStatus, NewListing, NewUser, User};
use loppis::repo::inmem::InMemRepo;
use loppis::repo::{ListingRepo, UserRepo};
use loppis::routes::{config, AppState};
use loppis::storage::FsMediaStore;
use serial_test::serial;
use std::sync::Arc;

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let data = tempfile::tempdir().unwrap();
    std::env::set_var("LOPPIS_DATA_DIR", data.path());
    let media = tempfile::tempdir().unwrap();
    std::env::set_var("LOPPIS_MEDIA_DIR", media.path());
    std::mem::forget(data);
    std::mem::forget(media);
}

async fn seed_user(repo: &InMemRepo, name: &str) -> (User, String) {
    let user = repo
        .create_user(NewUser {
            username: name.into(),
            password_hash: "$argon2$fake".into(),
        })
        .await
        .unwrap();
    let token = create_jwt(&user).unwrap();
    (user, token)
}

async fn seed_listing(repo: &InMemRepo, seller: &User) -> loppis::models::Listing {
    repo.create_listing(
        seller.id,
        NewListing {
            title: "Road bike".into(),
            description: "Ten speeds".into(),
            price: 150.0,
            location: "Uppsala".into(),
            category: "Sports".into(),
        },
    )
    .await
    .unwrap()
}

macro_rules! post_json {
    ($app:expr, $uri:expr, $token:expr) => {{
        let req = test::TestRequest::post()
            .uri($uri)
            .insert_header(("Authorization", format!("Bearer {}", $token)))
            .to_request();
        let resp = test::call_service(&$app, req).await;
        let status = resp.status();
        let body: serde_json::Value =
            serde_json::from_slice(&test::read_body(resp).await).unwrap();
        (status, body)
    }};
    ($app:expr, $uri:expr, $token:expr, $json:expr) => {{
        let req = test::TestRequest::post()
            .uri($uri)
            .insert_header(("Authorization", format!("Bearer {}", $token)))
            .set_json($json)
            .to_request();
        let resp = test::call_service(&$app, req).await;
        let status = resp.status();
        let body: serde_json::Value =
            serde_json::from_slice(&test::read_body(resp).await).unwrap();
        (status, body)
    }};
}

#[actix_web::test]
#[serial]
async fn full_transaction_and_review_scenario() {
    setup_env();
    let repo = InMemRepo::new();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(AppState {
                repo: Arc::new(repo.clone()),
                media: Arc::new(FsMediaStore::new().unwrap()),
                rate_limiter: None,
            }))
            .configure(config),
    )
    .await;

    let (seller, seller_token) = seed_user(&repo, "anna").await;
    let (buyer, buyer_token) = seed_user(&repo, "bjorn").await;
    let listing = seed_listing(&repo, &seller).await;

    // buyer reserves
    let (status, body) = post_json!(app, &format!("/api/v1/listing/{}/reserve", listing.id), buyer_token);
    assert!(status.is_success());
    assert_eq!(body["status"], "ok");
    assert_eq!(body["listing"]["status"], "Reserved");
    assert_eq!(body["listing"]["reserved_by_id"], buyer.id);

    // seller marks sold; buyer stays on record
    let (status, body) = post_json!(app, &format!("/api/v1/listing/{}/mark_sold", listing.id), seller_token);
    assert!(status.is_success());
    assert_eq!(body["status"], "ok");
    assert_eq!(body["listing"]["status"], "Sold");
    assert_eq!(body["listing"]["reserved_by_id"], buyer.id);

    // both sides review each other exactly once
    let (status, body) = post_json!(
        app,
        &format!("/api/v1/review/{}/{}", listing.id, seller.id),
        buyer_token,
        &serde_json::json!({"rating": 5, "comment": "great seller"})
    );
    assert!(status.is_success());
    assert_eq!(body["status"], "ok");

    let (_, body) = post_json!(
        app,
        &format!("/api/v1/review/{}/{}", listing.id, buyer.id),
        seller_token,
        &serde_json::json!({"rating": 4, "comment": null})
    );
    assert_eq!(body["status"], "ok");

    // a second attempt is a no-op
    let (status, body) = post_json!(
        app,
        &format!("/api/v1/review/{}/{}", listing.id, seller.id),
        buyer_token,
        &serde_json::json!({"rating": 1, "comment": "changed my mind"})
    );
    assert!(status.is_success());
    assert_eq!(body["status"], "noop");

    // profile averages reflect a single review each
    let req = test::TestRequest::get().uri("/api/v1/user/anna").to_request();
    let resp = test::call_service(&app, req).await;
    let profile: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(profile["avg_rating"], 5.0);
    assert_eq!(profile["reviews"].as_array().unwrap().len(), 1);
}

#[actix_web::test]
#[serial]
async fn guard_failures_reject_without_changing_state() {
    setup_env();
    let repo = InMemRepo::new();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(AppState {
                repo: Arc::new(repo.clone()),
                media: Arc::new(FsMediaStore::new().unwrap()),
                rate_limiter: None,
            }))
            .configure(config),
    )
    .await;

    let (seller, seller_token) = seed_user(&repo, "anna").await;
    let (buyer, buyer_token) = seed_user(&repo, "bjorn").await;
    let (_, stranger_token) = seed_user(&repo, "carl").await;
    let listing = seed_listing(&repo, &seller).await;

    // seller cannot reserve their own listing
    let (status, body) = post_json!(app, &format!("/api/v1/listing/{}/reserve", listing.id), seller_token);
    assert!(status.is_success());
    assert_eq!(body["status"], "rejected");
    assert_eq!(body["message"], "You cannot reserve your own listing.");
    assert_eq!(repo.get_listing(listing.id).await.unwrap().status, ListingStatus::Available);

    // mark_sold before any reservation is rejected
    let (_, body) = post_json!(app, &format!("/api/v1/listing/{}/mark_sold", listing.id), seller_token);
    assert_eq!(body["status"], "rejected");
    assert_eq!(body["message"], "Listing must be reserved before marking as sold.");

    // reserve, then a second reserve bounces off
    let (_, body) = post_json!(app, &format!("/api/v1/listing/{}/reserve", listing.id), buyer_token);
    assert_eq!(body["status"], "ok");
    let (_, body) = post_json!(app, &format!("/api/v1/listing/{}/reserve", listing.id), stranger_token);
    assert_eq!(body["status"], "rejected");
    let after = repo.get_listing(listing.id).await.unwrap();
    assert_eq!(after.status, ListingStatus::Reserved);
    assert_eq!(after.reserved_by_id, Some(buyer.id));

    // a third party cannot cancel the reservation
    let (_, body) = post_json!(
        app,
        &format!("/api/v1/listing/{}/cancel_reservation", listing.id),
        stranger_token
    );
    assert_eq!(body["status"], "rejected");
    assert_eq!(repo.get_listing(listing.id).await.unwrap().status, ListingStatus::Reserved);

    // only the seller may relist
    let (_, body) = post_json!(app, &format!("/api/v1/listing/{}/relist", listing.id), buyer_token);
    assert_eq!(body["status"], "rejected");
    assert_eq!(body["message"], "Only the seller can relist.");

    // the buyer can cancel; the reservation is gone
    let (_, body) = post_json!(
        app,
        &format!("/api/v1/listing/{}/cancel_reservation", listing.id),
        buyer_token
    );
    assert_eq!(body["status"], "ok");
    let after = repo.get_listing(listing.id).await.unwrap();
    assert_eq!(after.status, ListingStatus::Available);
    assert_eq!(after.reserved_by_id, None);

    // reviews are gated until the sale completes
    let (_, body) = post_json!(
        app,
        &format!("/api/v1/review/{}/{}", listing.id, seller.id),
        buyer_token,
        &serde_json::json!({"rating": 5, "comment": null})
    );
    assert_eq!(body["status"], "rejected");
    assert_eq!(body["message"], "You cannot review this transaction.");

    // transitions require a session
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/listing/{}/reserve", listing.id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    // unknown listing -> 404
    let (status, _) = post_json!(app, "/api/v1/listing/9999/reserve", buyer_token);
    assert_eq!(status, 404);
}

#[actix_web::test]
#[serial]
async fn relist_recovers_a_sold_listing() {
    setup_env();
    let repo = InMemRepo::new();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(AppState {
                repo: Arc::new(repo.clone()),
                media: Arc::new(FsMediaStore::new().unwrap()),
                rate_limiter: None,
            }))
            .configure(config),
    )
    .await;

    let (seller, seller_token) = seed_user(&repo, "anna").await;
    let (_, buyer_token) = seed_user(&repo, "bjorn").await;
    let listing = seed_listing(&repo, &seller).await;

    let (_, body) = post_json!(app, &format!("/api/v1/listing/{}/reserve", listing.id), buyer_token);
    assert_eq!(body["status"], "ok");
    let (_, body) = post_json!(app, &format!("/api/v1/listing/{}/mark_sold", listing.id), seller_token);
    assert_eq!(body["status"], "ok");

    let (_, body) = post_json!(app, &format!("/api/v1/listing/{}/relist", listing.id), seller_token);
    assert_eq!(body["status"], "ok");
    let after = repo.get_listing(listing.id).await.unwrap();
    assert_eq!(after.status, ListingStatus::Available);
    assert_eq!(after.reserved_by_id, None);
}
