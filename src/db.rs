use std::sync::{Mutex, MutexGuard};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{PileError, Result};
use crate::session::SessionConfig;

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(path)?
        };

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PileError::LockPoisoned)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS boards (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                description TEXT,
                default_channel_id TEXT REFERENCES channels(id) ON DELETE SET NULL,
                session_block_minutes INTEGER NOT NULL DEFAULT 60,
                session_anchor TEXT NOT NULL DEFAULT '00:00',
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            );

            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                slug TEXT NOT NULL,
                order_index INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at INTEGER NOT NULL DEFAULT (unixepoch()),
                UNIQUE(board_id, slug)
            );

            CREATE TABLE IF NOT EXISTS anon_users (
                id TEXT PRIMARY KEY,
                nickname TEXT NOT NULL,
                display_name TEXT,
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                last_seen_at INTEGER NOT NULL DEFAULT (unixepoch())
            );

            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                anon_user_id TEXT REFERENCES anon_users(id) ON DELETE SET NULL,
                type TEXT NOT NULL CHECK (type IN ('text', 'file', 'link')),
                text_md TEXT,
                file_path TEXT,
                file_mime TEXT,
                file_size INTEGER,
                file_original_name TEXT,
                link_url TEXT,
                link_title TEXT,
                link_desc TEXT,
                link_image TEXT,
                session_start INTEGER,
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            );

            CREATE TABLE IF NOT EXISTS board_members (
                board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                anon_user_id TEXT NOT NULL REFERENCES anon_users(id) ON DELETE CASCADE,
                joined_at INTEGER NOT NULL DEFAULT (unixepoch()),
                PRIMARY KEY (board_id, anon_user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_channels_board ON channels(board_id);
            CREATE INDEX IF NOT EXISTS idx_items_board ON items(board_id);
            CREATE INDEX IF NOT EXISTS idx_items_channel ON items(channel_id);
            CREATE INDEX IF NOT EXISTS idx_items_created ON items(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_items_session ON items(session_start);
            ",
        )?;
        Ok(())
    }
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Prefixed random id, e.g. `board_3f9c0a1b2d4e`.
pub fn new_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &raw[..12])
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn conflict_on_unique(err: rusqlite::Error, message: &str) -> PileError {
    if is_unique_violation(&err) {
        PileError::Conflict(message.to_string())
    } else {
        PileError::Database(err)
    }
}

// --- Models ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub default_channel_id: Option<String>,
    pub session_block_minutes: i64,
    pub session_anchor: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Board {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(
            Some(&self.session_anchor),
            Some(self.session_block_minutes as f64),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub board_id: String,
    pub name: String,
    pub slug: String,
    pub order_index: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonUser {
    pub id: String,
    pub nickname: String,
    pub display_name: Option<String>,
    pub created_at: i64,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    #[default]
    Text,
    Link,
    File,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Text => "text",
            ItemKind::Link => "link",
            ItemKind::File => "file",
        }
    }
}

impl ToSql for ItemKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ItemKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "text" => Ok(ItemKind::Text),
            "link" => Ok(ItemKind::Link),
            "file" => Ok(ItemKind::File),
            other => Err(FromSqlError::Other(
                format!("unknown item type {other:?}").into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub id: String,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorRef {
    pub id: String,
    pub nickname: String,
    pub display_name: Option<String>,
}

/// An item joined with its channel and author, as served to clients and
/// carried in `item.created` events.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub board_id: String,
    pub channel_id: String,
    #[serde(skip)]
    pub anon_user_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub text_md: Option<String>,
    pub file_path: Option<String>,
    pub file_mime: Option<String>,
    pub file_size: Option<i64>,
    pub file_original_name: Option<String>,
    pub link_url: Option<String>,
    pub link_title: Option<String>,
    pub link_desc: Option<String>,
    pub link_image: Option<String>,
    pub session_start: Option<i64>,
    pub created_at: i64,
    pub channel: Option<ChannelRef>,
    pub anon_user: Option<AuthorRef>,
}

#[derive(Debug, Clone, Default)]
pub struct NewItem {
    pub id: String,
    pub board_id: String,
    pub channel_id: String,
    pub anon_user_id: Option<String>,
    pub kind: ItemKind,
    pub text_md: Option<String>,
    pub file_path: Option<String>,
    pub file_mime: Option<String>,
    pub file_size: Option<i64>,
    pub file_original_name: Option<String>,
    pub link_url: Option<String>,
    pub link_title: Option<String>,
    pub link_desc: Option<String>,
    pub link_image: Option<String>,
    pub session_start: Option<i64>,
}

pub struct NewBoard<'a> {
    pub name: &'a str,
    pub slug: &'a str,
    pub description: Option<&'a str>,
    pub session_block_minutes: i64,
    pub session_anchor: &'a str,
}

#[derive(Default)]
pub struct BoardUpdate<'a> {
    pub name: Option<&'a str>,
    pub slug: Option<&'a str>,
    pub description: Option<&'a str>,
    pub session_block_minutes: Option<i64>,
    pub session_anchor: Option<&'a str>,
}

#[derive(Default)]
pub struct ChannelUpdate<'a> {
    pub name: Option<&'a str>,
    pub slug: Option<&'a str>,
    pub order_index: Option<i64>,
}

const DEFAULT_CHANNEL_NAME: &str = "Shared";
pub const DEFAULT_CHANNEL_SLUG: &str = "default";

const BOARD_COLUMNS: &str = "id, name, slug, description, default_channel_id, session_block_minutes, session_anchor, created_at, updated_at";
const CHANNEL_COLUMNS: &str = "id, board_id, name, slug, order_index, created_at, updated_at";
const ITEM_SELECT: &str = "SELECT i.id, i.board_id, i.channel_id, i.anon_user_id, i.type, i.text_md, i.file_path, i.file_mime, i.file_size, i.file_original_name, i.link_url, i.link_title, i.link_desc, i.link_image, i.session_start, i.created_at, c.name, c.slug, a.nickname, a.display_name FROM items i LEFT JOIN channels c ON c.id = i.channel_id LEFT JOIN anon_users a ON a.id = i.anon_user_id";

fn board_from_row(row: &Row) -> rusqlite::Result<Board> {
    Ok(Board {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        default_channel_id: row.get(4)?,
        session_block_minutes: row.get(5)?,
        session_anchor: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn channel_from_row(row: &Row) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        board_id: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        order_index: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn item_from_row(row: &Row) -> rusqlite::Result<Item> {
    let channel_id: String = row.get(2)?;
    let anon_user_id: Option<String> = row.get(3)?;
    let channel = match (row.get::<_, Option<String>>(16)?, row.get::<_, Option<String>>(17)?) {
        (Some(name), Some(slug)) => Some(ChannelRef {
            id: channel_id.clone(),
            name,
            slug,
        }),
        _ => None,
    };
    let anon_user = match (&anon_user_id, row.get::<_, Option<String>>(18)?) {
        (Some(id), Some(nickname)) => Some(AuthorRef {
            id: id.clone(),
            nickname,
            display_name: row.get(19)?,
        }),
        _ => None,
    };

    Ok(Item {
        id: row.get(0)?,
        board_id: row.get(1)?,
        channel_id,
        anon_user_id,
        kind: row.get(4)?,
        text_md: row.get(5)?,
        file_path: row.get(6)?,
        file_mime: row.get(7)?,
        file_size: row.get(8)?,
        file_original_name: row.get(9)?,
        link_url: row.get(10)?,
        link_title: row.get(11)?,
        link_desc: row.get(12)?,
        link_image: row.get(13)?,
        session_start: row.get(14)?,
        created_at: row.get(15)?,
        channel,
        anon_user,
    })
}

// --- Board operations ---

/// Creates a board together with its default channel in one transaction.
pub fn create_board(db: &Db, new: &NewBoard) -> Result<(Board, Channel)> {
    let board_id = new_id("board");
    let channel_id = new_id("chan");
    let now = now_unix();

    let mut conn = db.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO boards (id, name, slug, description, session_block_minutes, session_anchor, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![board_id, new.name, new.slug, new.description, new.session_block_minutes, new.session_anchor, now],
    )
    .map_err(|e| conflict_on_unique(e, "Board slug is already in use"))?;
    tx.execute(
        "INSERT INTO channels (id, board_id, name, slug, order_index, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
        params![channel_id, board_id, DEFAULT_CHANNEL_NAME, DEFAULT_CHANNEL_SLUG, now],
    )?;
    tx.execute(
        "UPDATE boards SET default_channel_id = ?1 WHERE id = ?2",
        params![channel_id, board_id],
    )?;

    let board = tx.query_row(
        &format!("SELECT {} FROM boards WHERE id = ?1", BOARD_COLUMNS),
        params![board_id],
        board_from_row,
    )?;
    let channel = tx.query_row(
        &format!("SELECT {} FROM channels WHERE id = ?1", CHANNEL_COLUMNS),
        params![channel_id],
        channel_from_row,
    )?;
    tx.commit()?;
    Ok((board, channel))
}

pub fn get_board_by_slug(db: &Db, slug: &str) -> Result<Option<Board>> {
    let conn = db.conn()?;
    let board = conn
        .query_row(
            &format!("SELECT {} FROM boards WHERE slug = ?1", BOARD_COLUMNS),
            params![slug],
            board_from_row,
        )
        .optional()?;
    Ok(board)
}

pub fn get_board(db: &Db, id: &str) -> Result<Option<Board>> {
    let conn = db.conn()?;
    let board = conn
        .query_row(
            &format!("SELECT {} FROM boards WHERE id = ?1", BOARD_COLUMNS),
            params![id],
            board_from_row,
        )
        .optional()?;
    Ok(board)
}

pub fn list_boards(db: &Db) -> Result<Vec<Board>> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM boards ORDER BY created_at ASC, rowid ASC",
        BOARD_COLUMNS
    ))?;
    let boards = stmt
        .query_map([], board_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(boards)
}

pub fn update_board(db: &Db, id: &str, update: &BoardUpdate) -> Result<bool> {
    let conn = db.conn()?;
    let mut sets = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(n) = update.name {
        sets.push("name = ?");
        values.push(Box::new(n.to_string()));
    }
    if let Some(s) = update.slug {
        sets.push("slug = ?");
        values.push(Box::new(s.to_string()));
    }
    if let Some(d) = update.description {
        sets.push("description = ?");
        values.push(Box::new(d.to_string()));
    }
    if let Some(b) = update.session_block_minutes {
        sets.push("session_block_minutes = ?");
        values.push(Box::new(b));
    }
    if let Some(a) = update.session_anchor {
        sets.push("session_anchor = ?");
        values.push(Box::new(a.to_string()));
    }

    if sets.is_empty() {
        return Ok(false);
    }

    sets.push("updated_at = ?");
    values.push(Box::new(now_unix()));
    let sql = format!("UPDATE boards SET {} WHERE id = ?", sets.join(", "));
    values.push(Box::new(id.to_string()));

    let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let rows = conn
        .execute(&sql, params.as_slice())
        .map_err(|e| conflict_on_unique(e, "Board slug is already in use"))?;
    Ok(rows > 0)
}

pub fn count_board_members(db: &Db, board_id: &str) -> Result<i64> {
    let conn = db.conn()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM board_members WHERE board_id = ?1",
        params![board_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// --- Channel operations ---

pub fn list_channels(db: &Db, board_id: &str) -> Result<Vec<Channel>> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM channels WHERE board_id = ?1 ORDER BY order_index ASC, created_at ASC",
        CHANNEL_COLUMNS
    ))?;
    let channels = stmt
        .query_map(params![board_id], channel_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(channels)
}

pub fn get_channel_by_slug(db: &Db, board_id: &str, slug: &str) -> Result<Option<Channel>> {
    let conn = db.conn()?;
    let channel = conn
        .query_row(
            &format!(
                "SELECT {} FROM channels WHERE board_id = ?1 AND slug = ?2",
                CHANNEL_COLUMNS
            ),
            params![board_id, slug],
            channel_from_row,
        )
        .optional()?;
    Ok(channel)
}

/// Finds a board's channel from a client hint (id first, then slug), falling
/// back to the board's default channel and then to its first channel.
pub fn resolve_channel(db: &Db, board: &Board, hint: Option<&str>) -> Result<Option<Channel>> {
    let channels = list_channels(db, &board.id)?;
    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        if let Some(c) = channels.iter().find(|c| c.id == hint || c.slug == hint) {
            return Ok(Some(c.clone()));
        }
    }
    let default = board
        .default_channel_id
        .as_deref()
        .and_then(|id| channels.iter().find(|c| c.id == id));
    Ok(default.or(channels.first()).cloned())
}

pub fn create_channel(db: &Db, board_id: &str, name: &str, slug: &str) -> Result<Channel> {
    let id = new_id("chan");
    let now = now_unix();
    let conn = db.conn()?;
    let max_order: i64 = conn.query_row(
        "SELECT IFNULL(MAX(order_index), 0) FROM channels WHERE board_id = ?1",
        params![board_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO channels (id, board_id, name, slug, order_index, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![id, board_id, name, slug, max_order + 1, now],
    )
    .map_err(|e| conflict_on_unique(e, "Channel slug is already in use"))?;

    let channel = conn.query_row(
        &format!("SELECT {} FROM channels WHERE id = ?1", CHANNEL_COLUMNS),
        params![id],
        channel_from_row,
    )?;
    Ok(channel)
}

pub fn update_channel(db: &Db, id: &str, update: &ChannelUpdate) -> Result<Option<Channel>> {
    let conn = db.conn()?;
    let mut sets = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(n) = update.name {
        sets.push("name = ?");
        values.push(Box::new(n.to_string()));
    }
    if let Some(s) = update.slug {
        sets.push("slug = ?");
        values.push(Box::new(s.to_string()));
    }
    if let Some(o) = update.order_index {
        sets.push("order_index = ?");
        values.push(Box::new(o));
    }

    if !sets.is_empty() {
        sets.push("updated_at = ?");
        values.push(Box::new(now_unix()));
        let sql = format!("UPDATE channels SET {} WHERE id = ?", sets.join(", "));
        values.push(Box::new(id.to_string()));

        let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        conn.execute(&sql, params.as_slice())
            .map_err(|e| conflict_on_unique(e, "Channel slug is already in use"))?;
    }

    let channel = conn
        .query_row(
            &format!("SELECT {} FROM channels WHERE id = ?1", CHANNEL_COLUMNS),
            params![id],
            channel_from_row,
        )
        .optional()?;
    Ok(channel)
}

// --- Item operations ---

/// Inserts an item, records the poster as a board member and returns the
/// joined row.
pub fn insert_item(db: &Db, new: &NewItem) -> Result<Item> {
    let now = now_unix();
    let mut conn = db.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO items (id, board_id, channel_id, anon_user_id, type, text_md, file_path, file_mime, file_size, file_original_name, link_url, link_title, link_desc, link_image, session_start, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
        params![
            new.id,
            new.board_id,
            new.channel_id,
            new.anon_user_id,
            new.kind,
            new.text_md,
            new.file_path,
            new.file_mime,
            new.file_size,
            new.file_original_name,
            new.link_url,
            new.link_title,
            new.link_desc,
            new.link_image,
            new.session_start,
            now,
        ],
    )?;
    if let Some(anon_id) = &new.anon_user_id {
        tx.execute(
            "INSERT INTO board_members (board_id, anon_user_id, joined_at) VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
            params![new.board_id, anon_id, now],
        )?;
    }
    let item = tx.query_row(
        &format!("{} WHERE i.id = ?1", ITEM_SELECT),
        params![new.id],
        item_from_row,
    )?;
    tx.commit()?;
    Ok(item)
}

pub fn get_item(db: &Db, id: &str) -> Result<Option<Item>> {
    let conn = db.conn()?;
    let item = conn
        .query_row(
            &format!("{} WHERE i.id = ?1", ITEM_SELECT),
            params![id],
            item_from_row,
        )
        .optional()?;
    Ok(item)
}

/// Newest items of a board, optionally limited to one channel and to items
/// created strictly before `before`.
pub fn list_items(
    db: &Db,
    board_id: &str,
    channel_id: Option<&str>,
    before: Option<i64>,
    limit: i64,
) -> Result<Vec<Item>> {
    let conn = db.conn()?;
    let sql = format!(
        "{} WHERE i.board_id = ?1 AND (?2 IS NULL OR i.channel_id = ?2) AND (?3 IS NULL OR i.created_at < ?3) ORDER BY i.created_at DESC, i.rowid DESC LIMIT ?4",
        ITEM_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![board_id, channel_id, before, limit], item_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

/// All items of one channel in session order: newest bucket first, then
/// newest item first.
pub fn list_channel_items(db: &Db, board_id: &str, channel_id: &str) -> Result<Vec<Item>> {
    let conn = db.conn()?;
    let sql = format!(
        "{} WHERE i.board_id = ?1 AND i.channel_id = ?2 ORDER BY i.session_start DESC, i.created_at DESC, i.rowid DESC",
        ITEM_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![board_id, channel_id], item_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

pub fn delete_item(db: &Db, id: &str) -> Result<bool> {
    let conn = db.conn()?;
    let rows = conn.execute("DELETE FROM items WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

// --- Anonymous user operations ---

pub fn get_anon_user(db: &Db, id: &str) -> Result<Option<AnonUser>> {
    let conn = db.conn()?;
    let user = conn
        .query_row(
            "SELECT id, nickname, display_name, created_at, last_seen_at FROM anon_users WHERE id = ?1",
            params![id],
            |row| {
                Ok(AnonUser {
                    id: row.get(0)?,
                    nickname: row.get(1)?,
                    display_name: row.get(2)?,
                    created_at: row.get(3)?,
                    last_seen_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

pub fn create_anon_user(db: &Db, id: &str, nickname: &str) -> Result<AnonUser> {
    let now = now_unix();
    {
        let conn = db.conn()?;
        conn.execute(
            "INSERT INTO anon_users (id, nickname, created_at, last_seen_at) VALUES (?1, ?2, ?3, ?3) ON CONFLICT(id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
            params![id, nickname, now],
        )?;
    }
    get_anon_user(db, id)?.ok_or(PileError::NotFound("Anonymous user"))
}

pub fn touch_anon_user(db: &Db, id: &str) -> Result<bool> {
    let conn = db.conn()?;
    let rows = conn.execute(
        "UPDATE anon_users SET last_seen_at = ?1 WHERE id = ?2",
        params![now_unix(), id],
    )?;
    Ok(rows > 0)
}

pub fn set_display_name(db: &Db, id: &str, display_name: Option<&str>) -> Result<Option<AnonUser>> {
    {
        let conn = db.conn()?;
        conn.execute(
            "UPDATE anon_users SET display_name = ?1, last_seen_at = ?2 WHERE id = ?3",
            params![display_name, now_unix(), id],
        )?;
    }
    get_anon_user(db, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(db: &Db, slug: &str, block: i64) -> (Board, Channel) {
        create_board(
            db,
            &NewBoard {
                name: "Test",
                slug,
                description: None,
                session_block_minutes: block,
                session_anchor: "09:00",
            },
        )
        .unwrap()
    }

    #[test]
    fn board_creation_sets_default_channel() {
        let db = Db::open(":memory:").unwrap();
        let (b, c) = board(&db, "lab", 60);
        assert_eq!(b.default_channel_id.as_deref(), Some(c.id.as_str()));
        assert_eq!(c.slug, DEFAULT_CHANNEL_SLUG);
        assert!(b.id.starts_with("board_"));
    }

    #[test]
    fn duplicate_board_slug_is_a_conflict() {
        let db = Db::open(":memory:").unwrap();
        board(&db, "lab", 60);
        let err = create_board(
            &db,
            &NewBoard {
                name: "Again",
                slug: "lab",
                description: None,
                session_block_minutes: 60,
                session_anchor: "00:00",
            },
        )
        .unwrap_err();
        assert!(matches!(err, PileError::Conflict(_)));
        assert_eq!(list_boards(&db).unwrap().len(), 1);
    }

    #[test]
    fn channels_append_in_order_and_resolve_by_hint() {
        let db = Db::open(":memory:").unwrap();
        let (b, default) = board(&db, "lab", 60);
        let notes = create_channel(&db, &b.id, "Notes", "notes").unwrap();
        let links = create_channel(&db, &b.id, "Links", "links").unwrap();
        assert_eq!((notes.order_index, links.order_index), (1, 2));

        let by_slug = resolve_channel(&db, &b, Some("links")).unwrap().unwrap();
        assert_eq!(by_slug.id, links.id);
        let by_id = resolve_channel(&db, &b, Some(&notes.id)).unwrap().unwrap();
        assert_eq!(by_id.id, notes.id);
        let fallback = resolve_channel(&db, &b, Some("missing")).unwrap().unwrap();
        assert_eq!(fallback.id, default.id);
    }

    #[test]
    fn items_join_channel_and_author_and_record_membership() {
        let db = Db::open(":memory:").unwrap();
        let (b, c) = board(&db, "lab", 60);
        create_anon_user(&db, "anon_1", "BlueWhale-11").unwrap();

        let item = insert_item(
            &db,
            &NewItem {
                id: new_id("item"),
                board_id: b.id.clone(),
                channel_id: c.id.clone(),
                anon_user_id: Some("anon_1".into()),
                kind: ItemKind::Text,
                text_md: Some("hello".into()),
                session_start: Some(1_700_000_000),
                ..NewItem::default()
            },
        )
        .unwrap();

        assert_eq!(item.channel.as_ref().unwrap().slug, DEFAULT_CHANNEL_SLUG);
        assert_eq!(item.anon_user.as_ref().unwrap().nickname, "BlueWhale-11");
        assert_eq!(count_board_members(&db, &b.id).unwrap(), 1);

        assert!(delete_item(&db, &item.id).unwrap());
        assert!(!delete_item(&db, &item.id).unwrap());
    }
}
