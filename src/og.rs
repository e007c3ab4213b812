//! Open Graph link previews for link items.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;
use serde::Serialize;

const FETCH_TIMEOUT: Duration = Duration::from_secs(7);
const MAX_HTML_BYTES: usize = 200_000;
const MAX_FIELD_CHARS: usize = 600;
const USER_AGENT: &str = concat!("pile-bot/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
}

/// Parses a user-supplied link, accepting only absolute http(s) URLs.
pub fn parse_link(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    matches!(url.scheme(), "http" | "https")
        .then_some(url)
        .filter(|u| u.host_str().is_some())
}

pub struct LinkFetcher {
    client: Option<reqwest::Client>,
}

impl LinkFetcher {
    pub fn new(enabled: bool) -> Self {
        let client = if enabled {
            match reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .user_agent(USER_AGENT)
                .build()
            {
                Ok(client) => Some(client),
                Err(e) => {
                    tracing::warn!(error = %e, "link previews disabled: HTTP client unavailable");
                    None
                }
            }
        } else {
            None
        };
        LinkFetcher { client }
    }

    pub fn enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Best-effort metadata for `url`. Every failure yields empty metadata.
    pub async fn fetch(&self, url: &Url) -> LinkMetadata {
        let Some(client) = &self.client else {
            return LinkMetadata::default();
        };
        match self.fetch_html(client, url).await {
            Ok(Some(html)) => extract_metadata(&html, url),
            Ok(None) => LinkMetadata::default(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "link preview fetch failed");
                LinkMetadata::default()
            }
        }
    }

    async fn fetch_html(
        &self,
        client: &reqwest::Client,
        url: &Url,
    ) -> Result<Option<String>, reqwest::Error> {
        let mut response = client.get(url.clone()).send().await?.error_for_status()?;
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"));
        if !is_html {
            return Ok(None);
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let room = MAX_HTML_BYTES - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= MAX_HTML_BYTES {
                break;
            }
        }
        Ok(Some(String::from_utf8_lossy(&body).into_owned()))
    }
}

static META_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").unwrap());
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z_:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});
static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

/// Collects `<meta>` tags keyed by their lowercased `property` or `name`.
fn meta_tags(html: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for tag in META_TAG.find_iter(html) {
        let mut key = None;
        let mut content = None;
        for cap in ATTRIBUTE.captures_iter(tag.as_str()) {
            let value = cap.get(2).or_else(|| cap.get(3)).map_or("", |m| m.as_str());
            match cap[1].to_ascii_lowercase().as_str() {
                "property" | "name" if key.is_none() => key = Some(value.to_ascii_lowercase()),
                "content" => content = Some(value.to_string()),
                _ => {}
            }
        }
        if let (Some(key), Some(content)) = (key, content) {
            tags.entry(key).or_insert(content);
        }
    }
    tags
}

pub fn extract_metadata(html: &str, base: &Url) -> LinkMetadata {
    let tags = meta_tags(html);
    let title = tags
        .get("og:title")
        .cloned()
        .or_else(|| TITLE.captures(html).map(|c| c[1].to_string()))
        .and_then(|t| clean(&t));
    let description = tags
        .get("og:description")
        .or_else(|| tags.get("description"))
        .and_then(|d| clean(d));
    let image = tags
        .get("og:image")
        .and_then(|i| clean(i))
        .and_then(|i| base.join(&i).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(String::from);

    LinkMetadata {
        title,
        description,
        image,
    }
}

/// Decodes entities, collapses whitespace and caps the length.
fn clean(raw: &str) -> Option<String> {
    let decoded = decode_entities(raw);
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(MAX_FIELD_CHARS).collect())
}

fn decode_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &rest[1..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
