pub use self::fs::write_atomic;
pub use self::handle::extract_handle;
pub use self::time::is_fresh;

/// Account handle helpers
pub mod handle {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static PROFILE_URL: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(?:https?://)?(?:www\.|mobile\.)?(?:x|twitter)\.com/([A-Za-z0-9_]+)")
            .expect("valid profile url regex")
    });

    static BARE_HANDLE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^@?([A-Za-z0-9_]+)$").expect("valid handle regex"));

    /// Extract the handle from a profile URL (`https://x.com/name?lang=uk`)
    /// or a bare handle (`name`, `@name`).
    pub fn extract_handle(input: &str) -> Option<String> {
        let input = input.trim();
        PROFILE_URL
            .captures(input)
            .or_else(|| BARE_HANDLE.captures(input))
            .map(|caps| caps[1].to_string())
    }
}

/// Time utilities for the polling cycle
pub mod time {
    use chrono::{DateTime, Utc};
    use interfaces::Post;

    /// Same-day freshness: a post counts only if it was created on or after
    /// the date `now` falls on (UTC).
    pub fn is_fresh(post: &Post, now: DateTime<Utc>) -> bool {
        post.created_on() >= now.date_naive()
    }
}

/// Filesystem helpers
pub mod fs {
    use std::path::Path;
    use tokio::io::AsyncWriteExt;

    /// Write `bytes` to a sibling temp file, flush it to disk, then rename it
    /// over `path`. Readers see either the old or the new content.
    pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, path).await
    }
}
