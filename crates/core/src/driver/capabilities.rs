//! Per-driver capability value.

use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};

bitflags! {
    /// Behaviors a backend requires or offers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapabilityFlags: u8 {
        /// Content must be served through the application, never by direct URL.
        const PROXY_REQUIRED = 1 << 0;
        /// Objects are files on this machine and can be opened directly.
        const LOCAL_READ = 1 << 1;
        /// Uploads need a cleanup task in case the client never completes them.
        const UPLOAD_SENTINEL_REQUIRED = 1 << 2;
    }
}

/// Immutable description of what a driver instance can do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Flag set.
    pub flags: CapabilityFlags,
    /// Shortest expiry a source URL may have.
    pub min_source_expire: Duration,
    /// Longest expiry a source URL may have; zero means unbounded.
    pub max_source_expire: Duration,
    /// Extensions the backend can render thumbnails for.
    pub thumb_supported_exts: Vec<String>,
    /// Largest file the backend renders a thumbnail for; zero means unbounded.
    pub thumb_max_size: u64,
    /// Thumbnails must be proxied through the application.
    pub thumb_proxy: bool,
    /// Extensions the backend can extract media metadata from.
    pub media_meta_supported_exts: Vec<String>,
    /// Metadata extraction must read through the application.
    pub media_meta_proxy: bool,
}

impl Capabilities {
    /// Capabilities with the given flags and no limits.
    #[must_use]
    pub fn new(flags: CapabilityFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    /// Set the source URL expiry window.
    #[must_use]
    pub fn with_source_expire(mut self, min: Duration, max: Duration) -> Self {
        self.min_source_expire = min;
        self.max_source_expire = max;
        self
    }

    /// Set thumbnail support.
    #[must_use]
    pub fn with_thumb(mut self, exts: &[&str], max_size: u64, proxy: bool) -> Self {
        self.thumb_supported_exts = exts.iter().map(|e| (*e).to_string()).collect();
        self.thumb_max_size = max_size;
        self.thumb_proxy = proxy;
        self
    }

    /// Set media metadata support.
    #[must_use]
    pub fn with_media_meta(mut self, exts: &[&str], proxy: bool) -> Self {
        self.media_meta_supported_exts = exts.iter().map(|e| (*e).to_string()).collect();
        self.media_meta_proxy = proxy;
        self
    }

    /// Whether every flag in `flag` is set.
    #[must_use]
    pub const fn has(&self, flag: CapabilityFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Whether a thumbnail can be produced for `ext` at `size` bytes.
    #[must_use]
    pub fn supports_thumb(&self, ext: &str, size: u64) -> bool {
        let ext_ok = self
            .thumb_supported_exts
            .iter()
            .any(|e| e.eq_ignore_ascii_case(ext));
        ext_ok && (self.thumb_max_size == 0 || size <= self.thumb_max_size)
    }

    /// Whether media metadata can be extracted for `ext`.
    #[must_use]
    pub fn supports_media_meta(&self, ext: &str) -> bool {
        self.media_meta_supported_exts
            .iter()
            .any(|e| e.eq_ignore_ascii_case(ext))
    }

    /// Clamp a requested URL expiry into the backend's window, relative to `now`.
    ///
    /// No expiry asks for the longest allowed; a zero maximum leaves it unbounded.
    #[must_use]
    pub fn clamp_expire(
        &self,
        expire: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let max = chrono::Duration::from_std(self.max_source_expire).ok();
        let min = chrono::Duration::from_std(self.min_source_expire).unwrap_or(chrono::Duration::zero());
        let max = max.filter(|m| *m > chrono::Duration::zero());

        let Some(expire) = expire else {
            return max.map(|m| now + m);
        };

        let mut clamped = expire;
        if clamped - now < min {
            clamped = now + min;
        }
        if let Some(max) = max {
            if clamped - now > max {
                clamped = now + max;
            }
        }
        Some(clamped)
    }
}
