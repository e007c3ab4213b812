use hmac::{Hmac, Mac};
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::request::{self, FromRequest, Outcome, Request};
use sha2::Sha256;

use crate::config::AppConfig;

type HmacSha256 = Hmac<Sha256>;

pub const ADMIN_COOKIE: &str = "is_admin";
const ADMIN_SESSION_HOURS: i64 = 8;

/// Request guard for admin-only routes.
///
/// The `is_admin` cookie must carry the HMAC of the admin name keyed by the
/// configured password. Without a configured password nobody is admin.
pub struct Admin;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Admin {
    type Error = &'static str;

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let Some(config) = req.rocket().state::<AppConfig>() else {
            return Outcome::Error((Status::InternalServerError, "Missing configuration"));
        };
        let Some(password) = config.admin_password.as_deref() else {
            return Outcome::Error((Status::Unauthorized, "Admin login disabled"));
        };
        match req.cookies().get(ADMIN_COOKIE) {
            Some(cookie) if verify_signature(password, &config.admin_name, cookie.value()) => {
                Outcome::Success(Admin)
            }
            _ => Outcome::Error((Status::Unauthorized, "Admin privileges required")),
        }
    }
}

fn mac(password: &str, admin_name: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(password.as_bytes()).ok()?;
    mac.update(admin_name.as_bytes());
    Some(mac)
}

/// Hex HMAC-SHA256 of the admin name, keyed by the admin password.
pub fn admin_signature(password: &str, admin_name: &str) -> String {
    mac(password, admin_name)
        .map(|m| hex::encode(m.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Constant-time check of a cookie value against the expected signature.
pub fn verify_signature(password: &str, admin_name: &str, candidate_hex: &str) -> bool {
    let Ok(candidate) = hex::decode(candidate_hex) else {
        return false;
    };
    mac(password, admin_name).is_some_and(|m| m.verify_slice(&candidate).is_ok())
}

/// Compares a login attempt with the configured password without an early
/// exit on the first differing byte.
pub fn password_matches(config: &AppConfig, attempt: &str) -> bool {
    match config.admin_password.as_deref() {
        Some(password) => verify_signature(
            password,
            &config.admin_name,
            &admin_signature(attempt, &config.admin_name),
        ),
        None => false,
    }
}

pub fn set_admin_cookie(jar: &CookieJar<'_>, config: &AppConfig) {
    let Some(password) = config.admin_password.as_deref() else {
        return;
    };
    jar.add(
        Cookie::build((ADMIN_COOKIE, admin_signature(password, &config.admin_name)))
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(config.secure_cookies)
            .path("/")
            .max_age(rocket::time::Duration::hours(ADMIN_SESSION_HOURS)),
    );
}

pub fn clear_admin_cookie(jar: &CookieJar<'_>) {
    jar.remove(Cookie::build(ADMIN_COOKIE).path("/"));
}
