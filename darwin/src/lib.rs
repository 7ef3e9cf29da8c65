#![allow(
    clippy::new_without_default,
    clippy::too_many_arguments,
)]
//! # Darwin - Automatic Schema Migration
//!
//! Darwin brings the schema of a relational database to the version a running
//! application expects, without anyone applying scripts by hand. It is safe to
//! run from every member of a cluster at once.
//!
//! ## Key Features
//!
//! - **Versioned components**: each component of an application migrates on its own
//! - **Script conventions**: `create.sql`, `patch_<version>.sql` and `guess_<version>.sql`
//!   per platform directory
//! - **Resumable patches**: every statement is recorded, a failed patch resumes at
//!   the statement that failed
//! - **Version guessing**: schemas that were never tracked are recognized by guess scripts
//! - **Out of order patches**: patches merged from parallel branches still run
//! - **Cluster safety**: a lease based lock in the database serializes migrations,
//!   renewed in the background while a migration runs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use darwin::darwin::Darwin;
//! use darwin::resource::DirectoryResourceProvider;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // db/shop/sqlite/create.sql, db/shop/sqlite/patch_1.1.sql, ...
//! let darwin = Darwin::builder()
//!     .component("shop", Arc::new(DirectoryResourceProvider::new("db/shop")))
//!     .open_path("shop.db")?;
//!
//! darwin.migrate("shop", "1.1")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`common`] - Constants, time helpers and the renewal scheduler
//! - [`darwin`] - The migration orchestrator
//! - [`darwin_builder`] - Builder for opening Darwin
//! - [`darwin_config`] - Darwin configuration
//! - [`errors`] - Error types and result definitions
//! - [`executor`] - Statement level, resumable patch execution
//! - [`lock`] - Lease based distributed lock
//! - [`patch`] - Patches and statement records
//! - [`probe`] - Version detection with guess scripts
//! - [`resource`] - Script naming conventions and script sources
//! - [`script`] - Splitting scripts into statements
//! - [`store`] - Bookkeeping storage and database access
//! - [`version`] - Version parsing and ordering

pub mod common;
pub mod darwin;
pub mod darwin_builder;
pub mod darwin_config;
pub mod errors;
pub mod executor;
pub mod lock;
pub mod patch;
pub mod probe;
pub mod resource;
pub mod script;
pub mod store;
pub mod version;

pub use crate::darwin::Darwin;
pub use crate::darwin_builder::DarwinBuilder;
pub use crate::darwin_config::DarwinConfig;
pub use crate::errors::{DarwinError, DarwinResult, ErrorKind};
pub use crate::version::VersionDescriptor;
