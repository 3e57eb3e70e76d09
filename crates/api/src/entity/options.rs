//! Per-request options for an entity source.

use chrono::{DateTime, Utc};

/// Options that shape how an entity is linked or served.
///
/// Options are merged with [`EntitySourceOptions::merge`]: values set on the
/// incoming bag win, unset ones keep what was there.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitySourceOptions {
    /// Bytes per second; zero is unlimited.
    pub speed: Option<u64>,
    /// Expiry of generated URLs.
    pub expire: Option<DateTime<Utc>>,
    /// Serve as an attachment.
    pub is_download: Option<bool>,
    /// Use the backend URL even when the policy prefers the internal proxy.
    pub no_internal_proxy: Option<bool>,
    /// File name presented to the client.
    pub display_name: Option<String>,
    /// Serve the thumbnail instead of the content.
    pub is_thumb: Option<bool>,
}

impl EntitySourceOptions {
    /// Empty option bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit download speed.
    #[must_use]
    pub fn with_speed_limit(mut self, bytes_per_sec: u64) -> Self {
        self.speed = Some(bytes_per_sec);
        self
    }

    /// Set URL expiry.
    #[must_use]
    pub fn with_expire(mut self, expire: DateTime<Utc>) -> Self {
        self.expire = Some(expire);
        self
    }

    /// Serve as an attachment.
    #[must_use]
    pub fn with_download(mut self, download: bool) -> Self {
        self.is_download = Some(download);
        self
    }

    /// Opt out of the internal proxy.
    #[must_use]
    pub fn with_no_internal_proxy(mut self, no_proxy: bool) -> Self {
        self.no_internal_proxy = Some(no_proxy);
        self
    }

    /// Set the presented file name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Serve the thumbnail.
    #[must_use]
    pub fn with_thumb(mut self, thumb: bool) -> Self {
        self.is_thumb = Some(thumb);
        self
    }

    /// Overlay `other` onto `self`.
    pub fn merge(&mut self, other: Self) {
        if other.speed.is_some() {
            self.speed = other.speed;
        }
        if other.expire.is_some() {
            self.expire = other.expire;
        }
        if other.is_download.is_some() {
            self.is_download = other.is_download;
        }
        if other.no_internal_proxy.is_some() {
            self.no_internal_proxy = other.no_internal_proxy;
        }
        if other.display_name.is_some() {
            self.display_name = other.display_name;
        }
        if other.is_thumb.is_some() {
            self.is_thumb = other.is_thumb;
        }
    }

    pub(crate) fn speed(&self) -> u64 {
        self.speed.unwrap_or(0)
    }

    pub(crate) fn download(&self) -> bool {
        self.is_download.unwrap_or(false)
    }

    pub(crate) fn thumb(&self) -> bool {
        self.is_thumb.unwrap_or(false)
    }
}
