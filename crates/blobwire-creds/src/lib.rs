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

//! Credential sources for authenticated transport requests.
//!
//! Layout: `creds.rs` (the credential map and its wire format), `helper.rs`
//! (the `CredentialHelper` trait), one module per helper (`command.rs`,
//! `askpass.rs`, `cache.rs`, `netrc.rs`), `chain.rs` (ordered fallback), and
//! `context.rs` (assembling the default chain from configuration).

pub mod askpass;
pub mod cache;
pub mod chain;
pub mod command;
pub mod context;
pub mod creds;
pub mod error;
pub mod helper;
pub mod netrc;

pub use askpass::AskPassCredentialHelper;
pub use cache::CredentialCacher;
pub use chain::CredentialHelpers;
pub use command::CommandCredentialHelper;
pub use context::{CredentialHelperContext, HelperSelection};
pub use creds::Creds;
pub use error::{CredsError, CredsResult};
pub use helper::{CredentialHelper, Disposition, NullCredentialHelper};
pub use netrc::{Netrc, NetrcCredentialHelper, NetrcFinder, NetrcMachine};
