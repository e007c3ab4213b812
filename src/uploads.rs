//! File storage for dropped uploads under `<data dir>/uploads/YYYY/MM/`.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use rocket::fs::{NamedFile, TempFile};
use rocket::http::Header;
use rocket::Responder;

use crate::db::new_id;
use crate::error::{PileError, Result};

const ALLOWED_MIME_PREFIXES: [&str; 6] = [
    "image/",
    "application/pdf",
    "application/msword",
    "application/vnd",
    "text/plain",
    "application/zip",
];
const MAX_NAME_LEN: usize = 255;

pub struct StoredUpload {
    /// Path relative to the uploads root, always `/`-separated.
    pub relative_path: String,
    pub size: u64,
    pub mime: String,
    pub original_name: String,
}

pub fn is_allowed_mime(mime: &str) -> bool {
    let mime = mime.to_ascii_lowercase();
    ALLOWED_MIME_PREFIXES.iter().any(|p| mime.starts_with(p))
}

/// Lowercased extension with a leading dot, or empty if the name has no
/// plausible one.
pub fn safe_extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 10 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

pub fn dated_path(now: DateTime<Utc>, file_name: &str) -> String {
    format!("{:04}/{:02}/{}", now.year(), now.month(), file_name)
}

/// Joins `relative` onto `root` only if it cannot escape it.
pub fn resolve_within(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let clean = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    (clean && relative.components().next().is_some()).then(|| root.join(relative))
}

pub async fn save_upload(
    file: &mut TempFile<'_>,
    uploads_root: &Path,
    max_bytes: u64,
) -> Result<StoredUpload> {
    let size = file.len();
    if size == 0 {
        return Err(PileError::Upload("file is empty".into()));
    }
    if size > max_bytes {
        return Err(PileError::Upload(format!(
            "file exceeds the {} MB limit",
            max_bytes / (1024 * 1024)
        )));
    }

    let mime = file
        .content_type()
        .map(|ct| format!("{}/{}", ct.top(), ct.sub()))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    if !is_allowed_mime(&mime) {
        return Err(PileError::Upload(format!("{} files are not accepted", mime)));
    }

    let original_name: String = file
        .raw_name()
        .map(|n| n.dangerous_unsafe_unsanitized_raw().as_str().to_string())
        .or_else(|| file.name().map(str::to_string))
        .unwrap_or_else(|| "upload".to_string())
        .chars()
        .take(MAX_NAME_LEN)
        .collect();

    let mut ext = safe_extension(&original_name);
    if ext.is_empty() {
        if let Some(e) = file.content_type().and_then(|ct| ct.extension()) {
            ext = format!(".{}", e.as_str());
        }
    }

    let relative_path = dated_path(Utc::now(), &format!("{}{}", new_id("file"), ext));
    let target = uploads_root.join(&relative_path);
    if let Some(parent) = target.parent() {
        rocket::tokio::fs::create_dir_all(parent).await?;
    }
    file.copy_to(&target).await?;

    Ok(StoredUpload {
        relative_path,
        size,
        mime,
        original_name,
    })
}

/// Removes a stored upload. Missing files and paths outside the root are
/// ignored.
pub async fn remove_upload(uploads_root: &Path, relative: &str) {
    let Some(path) = resolve_within(uploads_root, relative) else {
        tracing::warn!(path = relative, "refusing to delete upload outside root");
        return;
    };
    if let Err(e) = rocket::tokio::fs::remove_file(&path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete upload");
        }
    }
}

/// A served upload. Stored names are unique, so responses never change.
#[derive(Responder)]
pub struct CachedFile(NamedFile, Header<'static>);

impl CachedFile {
    pub async fn open(uploads_root: &Path, relative: &Path) -> Option<Self> {
        let path = resolve_within(uploads_root, relative.to_str()?)?;
        let file = NamedFile::open(path).await.ok()?;
        Some(CachedFile(
            file,
            Header::new("Cache-Control", "public, max-age=31536000, immutable"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn mime_allow_list() {
        assert!(is_allowed_mime("image/png"));
        assert!(is_allowed_mime("application/vnd.ms-excel"));
        assert!(is_allowed_mime("TEXT/PLAIN"));
        assert!(!is_allowed_mime("application/x-msdownload"));
        assert!(!is_allowed_mime("text/html"));
    }

    #[test]
    fn extensions_are_sanitized() {
        assert_eq!(safe_extension("Photo.JPG"), ".jpg");
        assert_eq!(safe_extension("archive.tar.gz"), ".gz");
        assert_eq!(safe_extension("noext"), "");
        assert_eq!(safe_extension("evil.p h p"), "");
    }

    #[test]
    fn dated_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(dated_path(at, "file_x.png"), "2024/03/file_x.png");
    }

    #[test]
    fn paths_cannot_escape_root() {
        let root = Path::new("/srv/uploads");
        assert_eq!(
            resolve_within(root, "2024/03/a.png"),
            Some(root.join("2024/03/a.png"))
        );
        assert_eq!(resolve_within(root, "../secret"), None);
        assert_eq!(resolve_within(root, "/etc/passwd"), None);
        assert!(resolve_within(root, "2024/./a.png").is_some());
        assert_eq!(resolve_within(root, ""), None);
    }
}
