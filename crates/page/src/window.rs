//! The window of a page: location and the global event-target role.
//! Timers live on the page's scheduler; the window only carries the
//! state JS can read back.

use url::Url;

#[derive(Default)]
pub struct Window {
    /// `window.location`; tracks the canonical (post-redirect) URL.
    pub location: Option<Url>,
    /// `window.name`, settable by frames.
    pub name: String,
}

impl Window {
    pub fn new() -> Self {
        Self::default()
    }

    /// `location.href`, or `about:blank` before any navigation.
    pub fn href(&self) -> &str {
        self.location.as_ref().map_or("about:blank", Url::as_str)
    }
}
