//! Plural proxy - resolution and dispatch engine for plural Discord accounts
//!
//! A user's message is matched against their personas' proxy tags and
//! autoproxy settings, then reposted under the chosen persona's name and avatar
//! while the original is deleted.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Gateway event stream (SQLite queue)         │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Ingest                            │
//! │  MessageCreate │ MessageUpdate │ Reaction │ Webhooks │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │     Resolver  →  Dispatcher (userproxy │ webhook)    │
//! │   tags │ autoproxy │ permissions │ emoji │ replies   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │        Discord REST  │  entity cache  │  records     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod discord;
pub mod dispatch;
pub mod emoji;
pub mod error;
pub mod ingest;
pub mod permissions;
pub mod proxy;
pub mod worker;

pub use cache::EntityCache;
pub use config::Config;
pub use db::{DbConn, DbPool};
pub use dispatch::{Dispatcher, ProxyOutcome};
pub use error::{Error, Result};
pub use ingest::{GatewayEvent, Ingest};
pub use proxy::{ResolvedProxy, Resolver};
pub use worker::Worker;
