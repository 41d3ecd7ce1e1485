//! noctua: a headless page runtime.
//!
//! A [`Session`] owns the shared HTTP transport, the notification bus
//! and the engine factory, and mints [`Page`]s with unique ids. Pages
//! do the actual work; see the `page` crate.

pub use dom;
pub use html;
pub use js;
pub use net;
pub use page;

pub mod session;

pub use page::{LoadState, Page, PageConfig, PageEvent};
pub use session::Session;
