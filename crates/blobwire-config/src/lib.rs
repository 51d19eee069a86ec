#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Read-only configuration snapshots for the blobwire transport.
//!
//! Layout: `map.rs` (multi-valued git/OS key maps and loaders), `url_config.rs`
//! (git's `http.<url>.<key>` matching rules), `settings.rs` (typed transport
//! settings), `writer.rs` (persisted repository-local overrides).

mod defaults;
pub mod error;
pub mod map;
pub mod settings;
pub mod url_config;
pub mod writer;

pub use error::{ConfigError, ConfigResult};
pub use map::{ConfigMap, parse_bool};
pub use settings::{TransportSettings, activity_timeout};
pub use url_config::UrlConfig;
pub use writer::{ConfigWriter, GitConfigWriter, MemoryConfigWriter};
