use std::path::PathBuf;
use std::time::Duration;

use rocket::form::Form;
use rocket::fs::TempFile;
use rocket::http::{CookieJar, Status};
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::{json, Json, Value};
use rocket::tokio::select;
use rocket::{delete, get, patch, post, FromForm, Shutdown, State};

use crate::anon::{KnownVisitor, Visitor};
use crate::auth::{self, Admin};
use crate::config::AppConfig;
use crate::db::{self, Board, Channel, Db, ItemKind, NewItem};
use crate::error::{PileError, Result};
use crate::events::{BoardEventKind, Broadcaster, Subscription};
use crate::og::{self, LinkFetcher};
use crate::rate_limit::{ClientIp, RateLimiter};
use crate::session::{self, Anchor};
use crate::uploads::{self, CachedFile};

const MAX_BOARD_NAME: usize = 120;
const MAX_DESCRIPTION: usize = 500;
const MAX_SLUG: usize = 64;
const MAX_DERIVED_SLUG: usize = 48;
const MAX_TEXT: usize = 5000;
const MAX_DISPLAY_NAME: usize = 30;
const ITEM_PAGE_SIZE: i64 = 100;

// Helper: generate slug from a name
fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .take(MAX_DERIVED_SLUG)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

fn is_valid_slug(slug: &str) -> bool {
    (1..=MAX_SLUG).contains(&slug.len())
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

fn str_field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key).and_then(|v| v.as_str())
}

// Helper: a provided slug must already be well-formed; otherwise derive one
fn slug_from(body: &Value, name: &str) -> Result<String> {
    match str_field(body, "slug").map(str::trim) {
        Some(slug) if !slug.is_empty() => {
            if is_valid_slug(slug) {
                Ok(slug.to_string())
            } else {
                Err(PileError::validation(
                    "slug may only contain a-z, 0-9 and '-' (max 64 chars)",
                ))
            }
        }
        _ => {
            let derived = slugify(name);
            if derived.is_empty() {
                Err(PileError::validation("a slug could not be derived from the name"))
            } else {
                Ok(derived)
            }
        }
    }
}

fn validate_name(raw: Option<&str>) -> Result<&str> {
    match raw.map(str::trim) {
        Some(n) if !n.is_empty() && n.chars().count() <= MAX_BOARD_NAME => Ok(n),
        Some(n) if !n.is_empty() => Err(PileError::validation(format!(
            "name must be at most {} characters",
            MAX_BOARD_NAME
        ))),
        _ => Err(PileError::validation("name is required")),
    }
}

fn validate_description(raw: &str) -> Result<&str> {
    let description = raw.trim();
    if description.chars().count() > MAX_DESCRIPTION {
        return Err(PileError::validation(format!(
            "description must be at most {} characters",
            MAX_DESCRIPTION
        )));
    }
    Ok(description)
}

/// `0` disables session bucketing; otherwise 15 to 240 whole minutes.
fn validate_block(value: &Value) -> Result<i64> {
    match value.as_i64() {
        Some(0) => Ok(0),
        Some(m) if (15..=240).contains(&m) => Ok(m),
        _ => Err(PileError::validation(
            "sessionBlockMinutes must be 0 or between 15 and 240",
        )),
    }
}

fn validate_anchor(raw: &str) -> Result<String> {
    Anchor::parse(raw)
        .map(|a| a.to_string())
        .ok_or_else(|| PileError::validation("sessionAnchor must be HH:MM"))
}

fn find_board(db: &Db, slug: &str) -> Result<Board> {
    db::get_board_by_slug(db, slug)?.ok_or(PileError::NotFound("Board"))
}

/// Exact channel match by id or slug.
fn find_channel(db: &Db, board: &Board, key: &str) -> Result<Channel> {
    db::list_channels(db, &board.id)?
        .into_iter()
        .find(|c| c.id == key || c.slug == key)
        .ok_or(PileError::NotFound("Channel"))
}

fn active_channel(db: &Db, board: &Board, hint: Option<&str>) -> Result<Channel> {
    db::resolve_channel(db, board, hint)?.ok_or(PileError::NotFound("Channel"))
}

fn check_rate(limiter: &RateLimiter, ip: &ClientIp) -> Result<()> {
    let decision = limiter.check(&ip.0);
    if decision.allowed {
        return Ok(());
    }
    tracing::warn!(
        client = %ip.0,
        retry_after_secs = decision.retry_after_secs,
        "item rate limit exceeded"
    );
    Err(PileError::RateLimited)
}

fn current_session_start(board: &Board, config: &AppConfig) -> Option<i64> {
    session::session_start_now(&board.session_config(), config.utc_offset).map(|t| t.timestamp())
}

// --- Board routes ---

#[post("/boards", format = "json", data = "<body>")]
pub fn create_board(
    db: &State<Db>,
    bus: &State<Broadcaster>,
    _admin: Admin,
    body: Json<Value>,
) -> Result<(Status, Json<Value>)> {
    let name = validate_name(str_field(&body, "name"))?;
    let slug = slug_from(&body, name)?;
    let description = str_field(&body, "description")
        .map(validate_description)
        .transpose()?
        .filter(|d| !d.is_empty());
    let session_block_minutes = match body.get("sessionBlockMinutes") {
        Some(v) if !v.is_null() => validate_block(v)?,
        _ => i64::from(session::DEFAULT_BLOCK_MINUTES),
    };
    let session_anchor = match str_field(&body, "sessionAnchor") {
        Some(a) => validate_anchor(a)?,
        None => Anchor::default().to_string(),
    };

    let (board, channel) = db::create_board(
        db,
        &db::NewBoard {
            name,
            slug: &slug,
            description,
            session_block_minutes,
            session_anchor: &session_anchor,
        },
    )?;

    tracing::info!(board_id = %board.id, slug = %board.slug, "board created");
    bus.emit(&board.id, BoardEventKind::BoardUpdated, json!({"id": board.id}));

    Ok((
        Status::Created,
        Json(json!({"board": board, "channels": [channel]})),
    ))
}

#[get("/boards")]
pub fn list_boards(db: &State<Db>) -> Result<Json<Value>> {
    Ok(Json(json!(db::list_boards(db)?)))
}

#[get("/boards/<slug>")]
pub fn get_board(db: &State<Db>, slug: &str) -> Result<Json<Value>> {
    let board = find_board(db, slug)?;
    let channels = db::list_channels(db, &board.id)?;
    let member_count = db::count_board_members(db, &board.id)?;
    Ok(Json(json!({
        "board": board,
        "channels": channels,
        "memberCount": member_count,
    })))
}

#[patch("/boards/<slug>", format = "json", data = "<body>")]
pub fn update_board(
    db: &State<Db>,
    bus: &State<Broadcaster>,
    _admin: Admin,
    slug: &str,
    body: Json<Value>,
) -> Result<Json<Value>> {
    let board = find_board(db, slug)?;

    let name = match body.get("name") {
        Some(v) => Some(validate_name(v.as_str())?),
        None => None,
    };
    let new_slug = match str_field(&body, "slug").map(str::trim) {
        Some(s) if is_valid_slug(s) => Some(s),
        Some(_) => {
            return Err(PileError::validation(
                "slug may only contain a-z, 0-9 and '-' (max 64 chars)",
            ))
        }
        None => None,
    };
    let description = str_field(&body, "description")
        .map(validate_description)
        .transpose()?;
    let session_block_minutes = body
        .get("sessionBlockMinutes")
        .map(validate_block)
        .transpose()?;
    let session_anchor = str_field(&body, "sessionAnchor")
        .map(validate_anchor)
        .transpose()?;

    let update = db::BoardUpdate {
        name,
        slug: new_slug,
        description,
        session_block_minutes,
        session_anchor: session_anchor.as_deref(),
    };
    if !db::update_board(db, &board.id, &update)? {
        return Err(PileError::validation("No fields to update"));
    }

    let board = db::get_board(db, &board.id)?.ok_or(PileError::NotFound("Board"))?;
    tracing::info!(board_id = %board.id, "board updated");
    bus.emit(&board.id, BoardEventKind::BoardUpdated, json!({"id": board.id}));
    Ok(Json(json!(board)))
}

// --- Channel routes ---

#[get("/boards/<slug>/channels")]
pub fn list_channels(db: &State<Db>, slug: &str) -> Result<Json<Value>> {
    let board = find_board(db, slug)?;
    Ok(Json(json!(db::list_channels(db, &board.id)?)))
}

#[post("/boards/<slug>/channels", format = "json", data = "<body>")]
pub fn create_channel(
    db: &State<Db>,
    bus: &State<Broadcaster>,
    _admin: Admin,
    slug: &str,
    body: Json<Value>,
) -> Result<(Status, Json<Value>)> {
    let board = find_board(db, slug)?;
    let name = validate_name(str_field(&body, "name"))?;
    let channel_slug = slug_from(&body, name)?;

    let channel = db::create_channel(db, &board.id, name, &channel_slug)?;
    tracing::info!(board_id = %board.id, channel_id = %channel.id, "channel created");
    bus.emit(&board.id, BoardEventKind::ChannelCreated, json!(channel));

    Ok((Status::Created, Json(json!(channel))))
}

#[get("/boards/<slug>/channels/<channel_slug>")]
pub fn get_channel(db: &State<Db>, slug: &str, channel_slug: &str) -> Result<Json<Value>> {
    let board = find_board(db, slug)?;
    let channel = db::get_channel_by_slug(db, &board.id, channel_slug)?
        .ok_or(PileError::NotFound("Channel"))?;
    Ok(Json(json!(channel)))
}

#[patch("/boards/<slug>/channels/<channel_slug>", format = "json", data = "<body>")]
pub fn update_channel(
    db: &State<Db>,
    bus: &State<Broadcaster>,
    _admin: Admin,
    slug: &str,
    channel_slug: &str,
    body: Json<Value>,
) -> Result<Json<Value>> {
    let board = find_board(db, slug)?;
    let channel = db::get_channel_by_slug(db, &board.id, channel_slug)?
        .ok_or(PileError::NotFound("Channel"))?;

    let name = match body.get("name") {
        Some(v) => Some(validate_name(v.as_str())?),
        None => None,
    };
    let new_slug = match str_field(&body, "slug").map(str::trim) {
        Some(s) if is_valid_slug(s) => Some(s),
        Some(_) => {
            return Err(PileError::validation(
                "slug may only contain a-z, 0-9 and '-' (max 64 chars)",
            ))
        }
        None => None,
    };
    let order_index = match body.get("orderIndex") {
        Some(v) => Some(
            v.as_i64()
                .ok_or_else(|| PileError::validation("orderIndex must be an integer"))?,
        ),
        None => None,
    };
    if name.is_none() && new_slug.is_none() && order_index.is_none() {
        return Err(PileError::validation("No fields to update"));
    }

    let update = db::ChannelUpdate {
        name,
        slug: new_slug,
        order_index,
    };
    let channel =
        db::update_channel(db, &channel.id, &update)?.ok_or(PileError::NotFound("Channel"))?;
    bus.emit(&board.id, BoardEventKind::BoardUpdated, json!({"id": board.id}));
    Ok(Json(json!(channel)))
}

// --- Item routes ---

#[get("/boards/<slug>/items?<channel>&<before>")]
pub fn list_items(
    db: &State<Db>,
    slug: &str,
    channel: Option<&str>,
    before: Option<i64>,
) -> Result<Json<Value>> {
    let board = find_board(db, slug)?;
    let channel_id = match channel.map(str::trim).filter(|c| !c.is_empty()) {
        Some(key) => Some(find_channel(db, &board, key)?.id),
        None => None,
    };
    let items = db::list_items(db, &board.id, channel_id.as_deref(), before, ITEM_PAGE_SIZE)?;
    Ok(Json(json!(items)))
}

#[get("/boards/<slug>/sessions?<channel>")]
pub fn list_sessions(
    db: &State<Db>,
    config: &State<AppConfig>,
    slug: &str,
    channel: Option<&str>,
) -> Result<Json<Value>> {
    let board = find_board(db, slug)?;
    let channel = active_channel(db, &board, channel)?;
    let items = db::list_channel_items(db, &board.id, &channel.id)?;
    let groups = session::group_by_session(items, config.utc_offset);
    Ok(Json(json!({"channel": channel, "groups": groups})))
}

#[allow(clippy::too_many_arguments)]
#[post("/boards/<slug>/items", format = "json", data = "<body>")]
pub async fn create_item(
    db: &State<Db>,
    config: &State<AppConfig>,
    bus: &State<Broadcaster>,
    limiter: &State<RateLimiter>,
    fetcher: &State<LinkFetcher>,
    ip: ClientIp,
    visitor: Visitor,
    slug: &str,
    body: Json<Value>,
) -> Result<(Status, Json<Value>)> {
    check_rate(limiter, &ip)?;
    let board = find_board(db, slug)?;
    let channel = active_channel(db, &board, str_field(&body, "channel"))?;

    let mut new = NewItem {
        id: db::new_id("item"),
        board_id: board.id.clone(),
        channel_id: channel.id.clone(),
        anon_user_id: Some(visitor.user.id.clone()),
        session_start: current_session_start(&board, config),
        ..NewItem::default()
    };

    match str_field(&body, "type").unwrap_or("text") {
        "text" => {
            let text = str_field(&body, "text")
                .unwrap_or("")
                .replace("\r\n", "\n");
            let text = text.trim();
            if text.is_empty() {
                return Err(PileError::validation("text is required"));
            }
            if text.chars().count() > MAX_TEXT {
                return Err(PileError::validation(format!(
                    "text must be at most {} characters",
                    MAX_TEXT
                )));
            }
            new.kind = ItemKind::Text;
            new.text_md = Some(text.to_string());
        }
        "link" => {
            let url = str_field(&body, "url")
                .and_then(og::parse_link)
                .ok_or_else(|| PileError::validation("url must be an absolute http(s) URL"))?;
            let meta = fetcher.fetch(&url).await;
            new.kind = ItemKind::Link;
            new.link_title = Some(meta.title.unwrap_or_else(|| url.to_string()));
            new.link_desc = meta.description;
            new.link_image = meta.image;
            new.link_url = Some(url.into());
        }
        other => {
            return Err(PileError::validation(format!(
                "unsupported item type '{}'",
                other
            )))
        }
    }

    let item = db::insert_item(db, &new)?;
    tracing::info!(
        item_id = %item.id,
        board_id = %board.id,
        kind = item.kind.as_str(),
        "item created"
    );
    bus.emit(&board.id, BoardEventKind::ItemCreated, json!(item));
    Ok((Status::Created, Json(json!(item))))
}

#[derive(FromForm)]
pub struct FileUpload<'r> {
    file: TempFile<'r>,
    channel: Option<String>,
}

#[allow(clippy::too_many_arguments)]
#[post("/boards/<slug>/files", data = "<upload>")]
pub async fn upload_file(
    db: &State<Db>,
    config: &State<AppConfig>,
    bus: &State<Broadcaster>,
    limiter: &State<RateLimiter>,
    ip: ClientIp,
    visitor: Visitor,
    slug: &str,
    mut upload: Form<FileUpload<'_>>,
) -> Result<(Status, Json<Value>)> {
    check_rate(limiter, &ip)?;
    let board = find_board(db, slug)?;
    let channel = active_channel(db, &board, upload.channel.as_deref())?;

    let uploads_root = config.uploads_dir();
    let stored =
        uploads::save_upload(&mut upload.file, &uploads_root, config.max_upload_bytes()).await?;

    let new = NewItem {
        id: db::new_id("item"),
        board_id: board.id.clone(),
        channel_id: channel.id.clone(),
        anon_user_id: Some(visitor.user.id.clone()),
        kind: ItemKind::File,
        file_path: Some(stored.relative_path.clone()),
        file_mime: Some(stored.mime),
        file_size: Some(stored.size as i64),
        file_original_name: Some(stored.original_name),
        session_start: current_session_start(&board, config),
        ..NewItem::default()
    };
    let item = match db::insert_item(db, &new) {
        Ok(item) => item,
        Err(e) => {
            uploads::remove_upload(&uploads_root, &stored.relative_path).await;
            return Err(e);
        }
    };

    tracing::info!(
        item_id = %item.id,
        board_id = %board.id,
        size = stored.size,
        "file uploaded"
    );
    bus.emit(&board.id, BoardEventKind::ItemCreated, json!(item));
    Ok((Status::Created, Json(json!(item))))
}

#[delete("/items/<id>")]
pub async fn delete_item(
    db: &State<Db>,
    config: &State<AppConfig>,
    bus: &State<Broadcaster>,
    admin: Option<Admin>,
    visitor: Option<KnownVisitor>,
    id: &str,
) -> Result<Json<Value>> {
    let item = db::get_item(db, id)?.ok_or(PileError::NotFound("Item"))?;

    let is_owner = match (&visitor, &item.anon_user_id) {
        (Some(KnownVisitor(user)), Some(owner)) => &user.id == owner,
        _ => false,
    };
    if !is_owner && admin.is_none() {
        return Err(PileError::Forbidden(
            "Only the author or an admin can delete this item".into(),
        ));
    }

    if !db::delete_item(db, &item.id)? {
        return Err(PileError::NotFound("Item"));
    }
    if let (ItemKind::File, Some(path)) = (item.kind, item.file_path.as_deref()) {
        uploads::remove_upload(&config.uploads_dir(), path).await;
    }

    tracing::info!(item_id = %item.id, board_id = %item.board_id, by_admin = !is_owner, "item deleted");
    bus.emit(&item.board_id, BoardEventKind::ItemDeleted, json!({"id": item.id}));
    Ok(Json(json!({"status": "deleted", "id": item.id})))
}

#[get("/files/<path..>")]
pub async fn serve_file(config: &State<AppConfig>, path: PathBuf) -> Option<CachedFile> {
    CachedFile::open(&config.uploads_dir(), &path).await
}

// --- Live updates ---

/// Holds a stream's subscription and logs when the client goes away.
struct LiveStream(Subscription);

impl Drop for LiveStream {
    fn drop(&mut self) {
        tracing::info!(board_id = self.0.board_id(), "event stream closed");
    }
}

#[get("/boards/<slug>/stream")]
pub fn event_stream(
    db: &State<Db>,
    config: &State<AppConfig>,
    bus: &State<Broadcaster>,
    slug: &str,
    mut shutdown: Shutdown,
) -> Result<EventStream![]> {
    let board = find_board(db, slug)?;
    let (subscription, mut rx) = bus.subscribe_channel(&board.id);
    tracing::info!(
        board_id = %board.id,
        subscribers = bus.subscriber_count(&board.id),
        "event stream opened"
    );

    let live = LiveStream(subscription);
    let hello = json!({"id": board.id});
    let stream = EventStream! {
        let _live = live;
        yield Event::json(&hello).event(BoardEventKind::BoardUpdated.as_str());
        loop {
            let event = select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = &mut shutdown => break,
            };
            yield Event::json(&event.payload).event(event.kind.as_str());
        }
    };
    Ok(stream.heartbeat(Duration::from_secs(config.keepalive_secs)))
}

// --- Anonymous identity ---

#[post("/anon/identify")]
pub fn identify(visitor: Visitor) -> Json<Value> {
    Json(json!({"user": visitor.user, "isNew": visitor.is_new}))
}

#[get("/anon/profile")]
pub fn get_profile(visitor: Visitor) -> Json<Value> {
    Json(json!(visitor.user))
}

#[patch("/anon/profile", format = "json", data = "<body>")]
pub fn update_profile(
    db: &State<Db>,
    visitor: KnownVisitor,
    body: Json<Value>,
) -> Result<Json<Value>> {
    let display_name = match body.get("displayName") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim()).filter(|s| !s.is_empty()),
        Some(_) => return Err(PileError::validation("displayName must be a string")),
    };
    if display_name.is_some_and(|n| n.chars().count() > MAX_DISPLAY_NAME) {
        return Err(PileError::validation(format!(
            "displayName must be at most {} characters",
            MAX_DISPLAY_NAME
        )));
    }

    let user = db::set_display_name(db, &visitor.0.id, display_name)?
        .ok_or(PileError::NotFound("Anonymous user"))?;
    Ok(Json(json!(user)))
}

// --- Admin session ---

#[post("/admin/login", format = "json", data = "<body>")]
pub fn admin_login(
    config: &State<AppConfig>,
    jar: &CookieJar<'_>,
    ip: ClientIp,
    body: Json<Value>,
) -> Result<Json<Value>> {
    let password = match str_field(&body, "password") {
        Some(p) if !p.is_empty() => p,
        _ => return Err(PileError::validation("password is required")),
    };
    if !auth::password_matches(config, password) {
        tracing::warn!(client = %ip.0, "rejected admin login");
        return Err(PileError::BadCredentials);
    }

    auth::set_admin_cookie(jar, config);
    tracing::info!(client = %ip.0, admin = %config.admin_name, "admin logged in");
    Ok(Json(json!({"admin": true})))
}

#[post("/admin/logout")]
pub fn admin_logout(jar: &CookieJar<'_>) -> Json<Value> {
    auth::clear_admin_cookie(jar);
    Json(json!({"admin": false}))
}

#[get("/admin/session")]
pub fn admin_session(admin: Option<Admin>) -> Json<Value> {
    Json(json!({"admin": admin.is_some()}))
}

// --- Health ---

#[get("/health")]
pub fn health(bus: &State<Broadcaster>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "live_boards": bus.board_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_keeps_unicode_and_caps_length() {
        assert_eq!(slugify("  Team Notes!! 2024 "), "team-notes-2024");
        assert_eq!(slugify("Café Über"), "café-über");
        assert_eq!(slugify("***"), "");
        let long = "word ".repeat(30);
        let slug = slugify(&long);
        assert!(slug.chars().count() <= MAX_DERIVED_SLUG);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn provided_slugs_are_strict() {
        assert!(is_valid_slug("week-12"));
        assert!(!is_valid_slug("Week-12"));
        assert!(!is_valid_slug("week 12"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug(&"a".repeat(65)));
    }

    #[test]
    fn block_lengths() {
        assert_eq!(validate_block(&json!(0)).unwrap(), 0);
        assert_eq!(validate_block(&json!(90)).unwrap(), 90);
        assert!(validate_block(&json!(10)).is_err());
        assert!(validate_block(&json!(241)).is_err());
        assert!(validate_block(&json!(30.5)).is_err());
        assert!(validate_block(&json!("60")).is_err());
    }

    #[test]
    fn anchors_are_normalized() {
        assert_eq!(validate_anchor(" 09:30 ").unwrap(), "09:30");
        assert!(validate_anchor("9:30").is_err());
        assert!(validate_anchor("24:00").is_err());
    }
}
