//! SIA-Scout Core Library
//!
//! This crate provides the core functionality for the SIA-Scout agent:
//! - Bearer token lifecycle (load from disk, login, persist)
//! - Authenticated API gateway with typed response classification
//! - CIDR decomposition into fixed-size units of work
//! - Durable, deduplicated SQLite storage with a scan-completion cache
//! - The concurrent producer/worker scanning pipeline
//! - Tabular reporting over stored results
//!
//! # Example
//!
//! ```no_run
//! use siascout_core::{api, auth, config, scan, store};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = config::load_config()?;
//!     let creds = config::Credentials::from_env()?;
//!
//!     // Authenticate (reuses the persisted token when still valid)
//!     let http = reqwest::Client::new();
//!     let token = auth::obtain(&http, &cfg, &creds).await?;
//!
//!     // One shared session for the whole scan
//!     let client = Arc::new(api::ApiClient::new(&cfg.api_url, &token)?);
//!     let store = store::Store::open(&cfg.db_path)?;
//!
//!     let query = api::Query {
//!         dataset: cfg.dataset.clone(),
//!         mode: cfg.mode.clone(),
//!         limit: cfg.limit,
//!         kind: api::ScanKind::Live,
//!     };
//!     let collector = scan::Collector::new(
//!         client,
//!         store,
//!         query,
//!         cfg.target_file.clone(),
//!         cfg.concurrency,
//!     );
//!     let summary = collector.run().await?;
//!     println!("Stored {} listings", summary.hits_stored);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod expand;
pub mod report;
pub mod scan;
pub mod store;

// Re-export commonly used types
pub use api::{ApiClient, Listing, ListingSource, Outcome, Query, ScanKind};
pub use auth::{AuthError, AuthToken};
pub use config::{Config, ConfigSource, Credentials};
pub use scan::{Collector, ScanError, ScanSummary};
pub use store::{HitTable, Store};
