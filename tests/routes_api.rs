#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use loppis::repo::inmem::InMemRepo;
use loppis::routes::{config, AppState};
use loppis::security::SecurityHeaders;
use loppis::storage::FsMediaStore;
use serial_test::serial;
use std::sync::Arc;

// Helper to ensure JWT secret present & unique temp data dirs per test
fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let data = tempfile::tempdir().unwrap();
    std::env::set_var("LOPPIS_DATA_DIR", data.path());
    let media = tempfile::tempdir().unwrap();
    std::env::set_var("LOPPIS_MEDIA_DIR", media.path());
    // leak the tempdirs so files survive the whole test
    std::mem::forget(data);
    std::mem::forget(media);
}

fn state() -> AppState {
    AppState {
        repo: Arc::new(InMemRepo::new()),
        media: Arc::new(FsMediaStore::new().unwrap()),
        rate_limiter: None,
    }
}

/// Multipart body with text fields and files.
fn multipart_body(
    boundary: &str,
    fields: &[(&str, &str)],
    files: &[(&str, &str, &[u8])],
) -> Vec<u8> {
    let mut body: Vec<u8> = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!("--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    for (name, filename, bytes) in files {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

// Minimal 1x1 PNG (transparent)
fn sample_png() -> Vec<u8> {
    vec![
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A,
        0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R',
        0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00,
        0x1F, 0x15, 0xC4, 0x89,
        0x00, 0x00, 0x00, 0x0A, b'I', b'D', b'A', b'T', 0x78, 0x9C, 0x63, 0x00, 0x01,
        0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4,
        0x00, 0x00, 0x00, 0x00, b'I', b'E', b'N', b'D', 0xAE, 0x42, 0x60, 0x82,
    ]
}

/// Registers an account and returns a session token.
macro_rules! register_and_login {
    ($app:expr, $username:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/v1/auth/register")
            .set_json(serde_json::json!({"username": $username, "password": "pass-word-123"}))
            .to_request();
        let resp = test::call_service(&$app, req).await;
        assert_eq!(resp.status(), 201);

        let req = test::TestRequest::post()
            .uri("/api/v1/auth/login")
            .set_json(serde_json::json!({"username": $username, "password": "pass-word-123"}))
            .to_request();
        let resp = test::call_service(&$app, req).await;
        assert!(resp.status().is_success());
        let body: serde_json::Value =
            serde_json::from_slice(&test::read_body(resp).await).unwrap();
        body["token"].as_str().unwrap().to_string()
    }};
}

#[actix_web::test]
#[serial]
async fn register_login_me_flow() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;

    let token = register_and_login!(app, "alice");

    // duplicate username -> 409
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/register")
        .set_json(serde_json::json!({"username": "alice", "password": "whatever1"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    // wrong password -> 401
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/login")
        .set_json(serde_json::json!({"username": "alice", "password": "wrong"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    // me resolves the account
    let req = test::TestRequest::get()
        .uri("/api/v1/auth/me")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let me: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(me["username"], "alice");
    assert_eq!(me["is_admin"], false);

    // no token -> 401
    let req = test::TestRequest::get().uri("/api/v1/auth/me").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}

#[actix_web::test]
#[serial]
async fn listing_create_detail_edit_delete() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;

    let seller = register_and_login!(app, "seller");
    let stranger = register_and_login!(app, "stranger");

    // create with one image
    let boundary = "BOUNDARY42";
    let png = sample_png();
    let body = multipart_body(
        boundary,
        &[
            ("title", "Record player"),
            ("description", "Plays records"),
            ("price", "75.50"),
            ("category", "Electronics"),
            ("location", "Lund"),
            ("cover_index", "0"),
        ],
        &[("images", "player.png", &png)],
    );
    let req = test::TestRequest::post()
        .uri("/api/v1/listing/new")
        .insert_header(("Authorization", format!("Bearer {seller}")))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let created: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let listing_id = created["listing"]["id"].as_i64().unwrap();
    assert_eq!(created["listing"]["status"], "Available");

    // detail carries the image with the secured, prefixed name
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/listing/{listing_id}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let detail: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(detail["seller"]["username"], "seller");
    let images = detail["images"].as_array().unwrap();
    assert_eq!(images.len(), 1);
    let filename = images[0]["filename"].as_str().unwrap();
    assert!(filename.ends_with("_player.png"));
    assert_eq!(images[0]["is_cover"], true);

    // the file is actually served back
    let req = test::TestRequest::get().uri(&format!("/uploads/{filename}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let ct = resp.headers().get("content-type").unwrap().to_str().unwrap();
    assert_eq!(ct, "image/png");

    // strangers cannot edit
    let body = multipart_body(
        boundary,
        &[
            ("title", "Hacked"),
            ("description", "x"),
            ("price", "1"),
            ("category", "Other"),
            ("location", "Nowhere"),
        ],
        &[],
    );
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/listing/{listing_id}/edit"))
        .insert_header(("Authorization", format!("Bearer {stranger}")))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // the seller can
    let body = multipart_body(
        boundary,
        &[
            ("title", "Record player (serviced)"),
            ("description", "Plays records"),
            ("price", "85"),
            ("category", "Electronics"),
            ("location", "Lund"),
        ],
        &[],
    );
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/listing/{listing_id}/edit"))
        .insert_header(("Authorization", format!("Bearer {seller}")))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let updated: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(updated["listing"]["price"], 85.0);

    // bad price on edit -> 400
    let body = multipart_body(
        boundary,
        &[
            ("title", "t"),
            ("description", "d"),
            ("price", "not-a-number"),
            ("category", "Other"),
            ("location", "x"),
        ],
        &[],
    );
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/listing/{listing_id}/edit"))
        .insert_header(("Authorization", format!("Bearer {seller}")))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // delete: stranger 403, seller ok, then 404
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/listing/{listing_id}/delete"))
        .insert_header(("Authorization", format!("Bearer {stranger}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/listing/{listing_id}/delete"))
        .insert_header(("Authorization", format!("Bearer {seller}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/listing/{listing_id}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
#[serial]
async fn profile_and_avatar() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;

    let token = register_and_login!(app, "mina");

    // upload avatar
    let boundary = "AVBOUNDARY";
    let png = sample_png();
    let body = multipart_body(boundary, &[], &[("avatar", "me selfie.png", &png)]);
    let req = test::TestRequest::post()
        .uri("/api/v1/user/mina")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let out: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let avatar = out["avatar_filename"].as_str().unwrap().to_string();
    assert!(avatar.ends_with("_me_selfie.png"));

    // profile exposes it
    let req = test::TestRequest::get().uri("/api/v1/user/mina").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let profile: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(profile["user"]["avatar_filename"], avatar.as_str());
    assert!(profile["avg_rating"].is_null());

    // avatar file served
    let req = test::TestRequest::get().uri(&format!("/avatars/{avatar}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    // someone else cannot replace it
    let other = register_and_login!(app, "not-mina");
    let body = multipart_body(boundary, &[], &[("avatar", "evil.png", &sample_png())]);
    let req = test::TestRequest::post()
        .uri("/api/v1/user/mina")
        .insert_header(("Authorization", format!("Bearer {other}")))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    // disallowed extension is a polite rejection, not an error
    let body = multipart_body(boundary, &[], &[("avatar", "script.exe", b"MZ".as_slice())]);
    let req = test::TestRequest::post()
        .uri("/api/v1/user/mina")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let out: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(out["status"], "rejected");

    // unknown profile -> 404
    let req = test::TestRequest::get().uri("/api/v1/user/ghost").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
#[serial]
async fn oversized_uploads_are_cut_off() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(actix_web::web::Data::new(state()))
            .configure(config),
    )
    .await;

    let token = register_and_login!(app, "bulk");

    // one byte over the 2 MB request budget
    let oversized = vec![0u8; 2 * 1024 * 1024 + 1];
    let boundary = "BIGBOUNDARY";
    let body = multipart_body(
        boundary,
        &[
            ("title", "Huge"),
            ("description", "Too many pixels"),
            ("price", "1"),
            ("category", "Other"),
            ("location", "Disk"),
        ],
        &[("images", "huge.png", &oversized)],
    );
    let req = test::TestRequest::post()
        .uri("/api/v1/listing/new")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 413);

    // nothing was created
    let req = test::TestRequest::get().uri("/api/v1/listings").to_request();
    let resp = test::call_service(&app, req).await;
    let listings: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(listings.as_array().unwrap().is_empty());
}
