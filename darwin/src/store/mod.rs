//! Storage of migration bookkeeping.
//!
//! This module provides the database access layer Darwin runs on.
//!
//! # Database
//!
//! [`Database`] wraps one connection and offers:
//! - statement execution for migration scripts
//! - transaction scopes with after-rollback hooks
//! - the database clock, used to normalize lease times
//!
//! # Dialects
//!
//! Every platform specific statement is resolved through a [`SqlDialect`].
//! [`SqliteDialect`] covers SQLite.
//!
//! # Bookkeeping
//!
//! [`MigrationStore`] is the contract for recording component versions,
//! patches and statements. [`SqliteMigrationStore`] implements it on four
//! tables:
//! - `darwin`: one row per component with its recorded version
//! - `darwin_patch`: one row per applied patch
//! - `darwin_sql`: one row per statement of a persisted patch
//! - `darwin_lock`: migration leases
mod bookkeeping;
mod database;
mod dialect;
mod migration_store;
pub mod sqlite;

pub use bookkeeping::*;
pub use database::*;
pub use dialect::*;
pub use migration_store::*;
pub use sqlite::SqliteMigrationStore;

/// Table holding one version row per component.
pub const COMPONENT_TABLE: &str = "darwin";
