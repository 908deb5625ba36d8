//! Cadence - scheduled publishing to social platforms
//!
//! This library holds the publishing core: encrypted account tokens,
//! platform adapters, the due-post poller and dispatcher, retries with
//! dead-lettering, and periodic analytics refresh. The `cadence-send` worker
//! and the `cadence-queue` operator tool are thin shells around it.

pub mod accounts;
pub mod analytics;
pub mod cache;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod lock;
pub mod logging;
pub mod platforms;
pub mod poller;
pub mod refresh;
pub mod retry;
pub mod types;
pub mod vault;

// Re-export commonly used types
pub use accounts::AccountRepository;
pub use config::Config;
pub use db::Database;
pub use dispatcher::Dispatcher;
pub use error::{CadenceError, Result};
pub use platforms::{Adapters, PlatformAdapter};
pub use poller::Poller;
pub use types::{Platform, Post, PostStatus, SocialAccount};
pub use vault::Vault;
