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

//! Endpoint resolution and access-mode bookkeeping for the blobwire transport.
//!
//! Layout: `endpoint.rs` (endpoint model and URL classifiers), `finder.rs`
//! (remote/alias resolution), `access.rs` (per-URL authentication scheme cache).

pub mod access;
pub mod endpoint;
pub mod error;
pub mod finder;

pub use access::{Access, AccessCache, AccessMode, url_without_auth};
pub use endpoint::{Endpoint, Operation, SshMetadata, URL_UNKNOWN, rewrite_local_path};
pub use error::{EndpointError, EndpointResult};
pub use finder::{DEFAULT_REMOTE, EndpointFinder, validate_remote_url};
