pub mod anon;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod og;
pub mod rate_limit;
pub mod routes;
pub mod session;
pub mod uploads;

use std::time::Duration;

use rocket::data::{ByteUnit, Limits};
use rocket::fs::FileServer;
use rocket::serde::json::{json, Json, Value};
use rocket::{catch, catchers, Request};

use crate::config::AppConfig;

// --- JSON error catchers ---

#[catch(400)]
fn bad_request(_req: &Request) -> Json<Value> {
    Json(json!({"error": "Malformed request", "code": "BAD_REQUEST"}))
}

#[catch(401)]
fn unauthorized(_req: &Request) -> Json<Value> {
    Json(json!({"error": "Unauthorized", "code": "UNAUTHORIZED"}))
}

#[catch(404)]
fn not_found(_req: &Request) -> Json<Value> {
    Json(json!({"error": "Not found", "code": "NOT_FOUND"}))
}

#[catch(413)]
fn payload_too_large(_req: &Request) -> Json<Value> {
    Json(json!({"error": "Upload is too large", "code": "PAYLOAD_TOO_LARGE"}))
}

#[catch(422)]
fn unprocessable(_req: &Request) -> Json<Value> {
    Json(json!({"error": "Invalid request body", "code": "UNPROCESSABLE_ENTITY"}))
}

#[catch(429)]
fn too_many_requests(_req: &Request) -> Json<Value> {
    Json(json!({"error": "Rate limit exceeded, try again later", "code": "RATE_LIMIT_EXCEEDED"}))
}

#[catch(500)]
fn internal_error(_req: &Request) -> Json<Value> {
    Json(json!({"error": "Internal server error", "code": "INTERNAL_ERROR"}))
}

pub fn build_rocket(db: db::Db, config: AppConfig) -> rocket::Rocket<rocket::Build> {
    // Multipart bodies carry the file plus a few small fields.
    let upload_limit = ByteUnit::from(config.max_upload_bytes());
    let limits = Limits::default()
        .limit("file", upload_limit)
        .limit("data-form", upload_limit + ByteUnit::Mebibyte(1));
    let figment = rocket::Config::figment().merge(("limits", limits));

    let rate_limiter =
        rate_limit::RateLimiter::new(Duration::from_secs(60), config.item_rate_limit);
    let link_fetcher = og::LinkFetcher::new(config.link_previews);
    let has_frontend = config.static_dir.join("index.html").exists();
    let static_dir = config.static_dir.clone();

    let mut rocket = rocket::custom(figment)
        .manage(db)
        .manage(rate_limiter)
        .manage(link_fetcher)
        .manage(events::Broadcaster::new())
        .manage(config)
        .mount(
            "/api",
            rocket::routes![
                routes::health,
                routes::list_boards,
                routes::create_board,
                routes::get_board,
                routes::update_board,
                routes::list_channels,
                routes::create_channel,
                routes::get_channel,
                routes::update_channel,
                routes::list_items,
                routes::list_sessions,
                routes::create_item,
                routes::upload_file,
                routes::delete_item,
                routes::serve_file,
                routes::event_stream,
                routes::identify,
                routes::get_profile,
                routes::update_profile,
                routes::admin_login,
                routes::admin_logout,
                routes::admin_session,
            ],
        )
        .register(
            "/",
            catchers![
                bad_request,
                unauthorized,
                not_found,
                payload_too_large,
                unprocessable,
                too_many_requests,
                internal_error,
            ],
        );

    if has_frontend {
        tracing::info!(dir = %static_dir.display(), "serving frontend");
        rocket = rocket.mount("/", FileServer::from(&static_dir));
    } else {
        tracing::info!(dir = %static_dir.display(), "API-only mode, no frontend found");
    }

    rocket
}
