//! Session buckets: fixed-length windows anchored to a daily time-of-day.
//!
//! Boundaries sit at `anchor + k * block` and the anchor recurs every 24
//! hours, so a bucket can straddle midnight. The resolver is total: any
//! malformed board setting is normalized here instead of failing a write.

use std::fmt;
use std::num::NonZeroU32;

use chrono::{DateTime, Duration, FixedOffset, LocalResult, NaiveTime, Offset, TimeZone, Utc};
use serde::Serialize;

use crate::db::Item;

pub const DEFAULT_BLOCK_MINUTES: u32 = 60;
const NO_SESSION_LABEL: &str = "No session";

/// Daily time-of-day at which the first session boundary falls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Anchor {
    hour: u32,
    minute: u32,
}

impl Anchor {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Anchor { hour, minute })
    }

    /// Strict `HH:MM` on a 24-hour clock. Leading/trailing whitespace is ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let (h, m) = raw.trim().split_once(':')?;
        if h.len() != 2 || m.len() != 2 {
            return None;
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        Anchor::new(h.parse().ok()?, m.parse().ok()?)
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    fn time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or_default()
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionBlock {
    /// Bucketing switched off for the board; items carry no session.
    Disabled,
    Minutes(NonZeroU32),
}

impl SessionBlock {
    /// Normalizes a raw block length. Only an exact zero disables bucketing;
    /// anything else that is not a usable positive length becomes the default.
    pub fn from_raw(raw: Option<f64>) -> Self {
        let default = SessionBlock::Minutes(default_block());
        let Some(raw) = raw else {
            return default;
        };
        if raw == 0.0 {
            return SessionBlock::Disabled;
        }
        if !raw.is_finite() || raw < 0.0 {
            return default;
        }
        let whole = raw.trunc().min(u32::MAX as f64) as u32;
        NonZeroU32::new(whole).map_or(default, SessionBlock::Minutes)
    }

    pub fn minutes(&self) -> Option<u32> {
        match self {
            SessionBlock::Disabled => None,
            SessionBlock::Minutes(m) => Some(m.get()),
        }
    }
}

fn default_block() -> NonZeroU32 {
    NonZeroU32::new(DEFAULT_BLOCK_MINUTES).unwrap_or(NonZeroU32::MIN)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub anchor: Anchor,
    pub block: SessionBlock,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            anchor: Anchor::default(),
            block: SessionBlock::Minutes(default_block()),
        }
    }
}

impl SessionConfig {
    pub fn new(anchor: Option<&str>, block_minutes: Option<f64>) -> Self {
        SessionConfig {
            anchor: anchor.and_then(Anchor::parse).unwrap_or_default(),
            block: SessionBlock::from_raw(block_minutes),
        }
    }
}

/// Start of the bucket containing `now`, in `now`'s own time zone.
///
/// Returns `None` only when the board has bucketing disabled. Near the ends
/// of chrono's range, where the previous anchor is not representable, the
/// bucket collapses to `now` itself.
pub fn resolve_session_start<Tz: TimeZone>(
    config: &SessionConfig,
    now: &DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    let minutes = config.block.minutes()?;
    let block = Duration::minutes(i64::from(minutes));
    Some(bucket_start(config.anchor, block, now).unwrap_or_else(|| now.clone()))
}

fn bucket_start<Tz: TimeZone>(
    anchor: Anchor,
    block: Duration,
    now: &DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    let mut anchor = anchor_occurrence(anchor, now)?;
    // DST days are not always 24h long, hence the loop.
    while anchor > *now {
        anchor = anchor.checked_sub_signed(Duration::days(1))?;
    }

    let elapsed = now.clone().signed_duration_since(anchor.clone());
    let block_ms = block.num_milliseconds();
    let blocks = elapsed.num_milliseconds() / block_ms;
    let mut start = anchor.checked_add_signed(Duration::milliseconds(blocks * block_ms))?;
    if start > *now {
        start = start.checked_sub_signed(block)?;
    }
    Some(start)
}

/// [`resolve_session_start`] evaluated at the current time in `offset`.
pub fn session_start_now(
    config: &SessionConfig,
    offset: FixedOffset,
) -> Option<DateTime<FixedOffset>> {
    resolve_session_start(config, &Utc::now().with_timezone(&offset))
}

fn anchor_occurrence<Tz: TimeZone>(anchor: Anchor, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let local = now.date_naive().and_time(anchor.time());
    let tz = now.timezone();
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        // Anchor falls in a DST gap: keep the wall clock, use now's offset.
        LocalResult::None => {
            let shift = i64::from(now.offset().fix().local_minus_utc());
            let utc = local.checked_sub_signed(Duration::seconds(shift))?;
            Some(tz.from_utc_datetime(&utc))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGroup {
    pub session_start: Option<i64>,
    pub label: String,
    pub items: Vec<Item>,
}

/// Groups items for display: newest session first, the no-session group last,
/// newest item first within a group.
pub fn group_by_session(mut items: Vec<Item>, offset: FixedOffset) -> Vec<SessionGroup> {
    items.sort_by(|a, b| {
        // None < Some, so reversing puts buckets first and no-session last.
        b.session_start
            .cmp(&a.session_start)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });

    let mut groups: Vec<SessionGroup> = Vec::new();
    for item in items {
        match groups.last_mut() {
            Some(group) if group.session_start == item.session_start => group.items.push(item),
            _ => groups.push(SessionGroup {
                session_start: item.session_start,
                label: session_label(item.session_start, offset),
                items: vec![item],
            }),
        }
    }
    groups
}

pub fn session_label(session_start: Option<i64>, offset: FixedOffset) -> String {
    session_start
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|t| t.with_timezone(&offset).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| NO_SESSION_LABEL.to_string())
}
