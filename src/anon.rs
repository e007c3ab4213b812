//! Anonymous visitor identities carried in the `anon_id` cookie.

use rand::Rng;
use rocket::http::{Cookie, SameSite, Status};
use rocket::request::{self, FromRequest, Outcome, Request};

use crate::config::AppConfig;
use crate::db::{self, AnonUser, Db};

pub const ANON_COOKIE: &str = "anon_id";
const COOKIE_MAX_AGE_DAYS: i64 = 365;

const COLORS: [&str; 10] = [
    "Blue", "Red", "Green", "Yellow", "Violet", "White", "Black", "Silver", "Golden", "Clear",
];
const ANIMALS: [&str; 10] = [
    "Whale", "Fox", "Owl", "Deer", "Panda", "Hawk", "Otter", "Raccoon", "Leopard", "Turtle",
];

pub fn generate_nickname(seed: u32) -> String {
    let seed = seed as usize;
    let color = COLORS[seed % COLORS.len()];
    let animal = ANIMALS[(seed / COLORS.len()) % ANIMALS.len()];
    format!("{}{}-{}", color, animal, 10 + seed % 90)
}

/// The requesting visitor, created on first contact.
pub struct Visitor {
    pub user: AnonUser,
    pub is_new: bool,
}

/// A visitor that already holds a valid identity cookie.
pub struct KnownVisitor(pub AnonUser);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Visitor {
    type Error = &'static str;

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let (Some(db), Some(config)) = (req.rocket().state::<Db>(), req.rocket().state::<AppConfig>())
        else {
            return Outcome::Error((Status::InternalServerError, "Missing state"));
        };

        match existing(req, db) {
            Ok(Some(user)) => {
                req.cookies().add(identity_cookie(&user.id, config));
                return Outcome::Success(Visitor { user, is_new: false });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "anonymous identity lookup failed");
                return Outcome::Error((Status::InternalServerError, "Identity lookup failed"));
            }
        }

        let id = db::new_id("anon");
        let nickname = generate_nickname(rand::thread_rng().gen_range(0..10_000));
        match db::create_anon_user(db, &id, &nickname) {
            Ok(user) => {
                tracing::info!(anon_id = %user.id, nickname = %user.nickname, "new anonymous visitor");
                req.cookies().add(identity_cookie(&user.id, config));
                Outcome::Success(Visitor { user, is_new: true })
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to create anonymous visitor");
                Outcome::Error((Status::InternalServerError, "Identity creation failed"))
            }
        }
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for KnownVisitor {
    type Error = &'static str;

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let Some(db) = req.rocket().state::<Db>() else {
            return Outcome::Error((Status::InternalServerError, "Missing state"));
        };
        match existing(req, db) {
            Ok(Some(user)) => Outcome::Success(KnownVisitor(user)),
            Ok(None) => Outcome::Error((Status::Unauthorized, "Unknown visitor")),
            Err(_) => Outcome::Error((Status::InternalServerError, "Identity lookup failed")),
        }
    }
}

/// Looks up the cookie's identity and bumps its last-seen time.
fn existing(req: &Request<'_>, db: &Db) -> crate::error::Result<Option<AnonUser>> {
    let Some(id) = req.cookies().get(ANON_COOKIE).map(|c| c.value().to_string()) else {
        return Ok(None);
    };
    if !db::touch_anon_user(db, &id)? {
        return Ok(None);
    }
    db::get_anon_user(db, &id)
}

fn identity_cookie(id: &str, config: &AppConfig) -> Cookie<'static> {
    Cookie::build((ANON_COOKIE, id.to_string()))
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(config.secure_cookies)
        .path("/")
        .max_age(rocket::time::Duration::days(COOKIE_MAX_AGE_DAYS))
        .build()
}
