//! forge-manager: the package database and resolver.
//!
//! The database is a SQLite file mapping package paths to installed
//! versions and their metadata (hash, group number, dependency ranges,
//! optional overridden source directory). The resolver turns unresolved
//! references into concrete package ids, materializing missing packages
//! into content-addressed storage through a downloader.

pub mod database;
pub mod resolver;

pub use database::{DataSource, DatabaseError, PackagesDatabase};
pub use resolver::{DownloadError, Downloader, InstalledPackages, ResolveError, Resolver};
