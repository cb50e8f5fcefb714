//! The persistent package database.
//!
//! Schema (one SQLite file per storage root):
//! - `package(package_id, path)`: canonical names, looked up case-insensitively
//! - `package_version(...)`: per-version metadata (hash, flags, group number,
//!   storage prefix, optional overriding source dir)
//! - `package_dependency(...)`: declared dependency ranges per version
//! - `data_source(url, flags)`: remote sources packages are fetched from
//!
//! Writes serialize through the internal mutex and run in immediate
//! transactions; concurrent readers rely on the 60 second busy timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, trace};

use forge_support::lock::{FileLock, LockError, LockMode};
use forge_support::{PackageData, PackageId, PackagePath, UnresolvedPackage, Version, VersionRange};

const BUSY_TIMEOUT_SECS: u64 = 60;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS package (
  package_id INTEGER PRIMARY KEY AUTOINCREMENT,
  path TEXT NOT NULL UNIQUE COLLATE NOCASE
);
CREATE TABLE IF NOT EXISTS package_version (
  package_version_id INTEGER PRIMARY KEY AUTOINCREMENT,
  package_id INTEGER NOT NULL REFERENCES package(package_id) ON DELETE CASCADE,
  version TEXT NOT NULL,
  hash TEXT NOT NULL,
  flags INTEGER NOT NULL DEFAULT 0,
  group_number INTEGER NOT NULL DEFAULT 0,
  prefix INTEGER NOT NULL DEFAULT 2,
  sdir TEXT,
  archive_version INTEGER NOT NULL DEFAULT 1,
  updated TEXT NOT NULL DEFAULT '',
  UNIQUE(package_id, version)
);
CREATE TABLE IF NOT EXISTS package_dependency (
  package_version_id INTEGER NOT NULL REFERENCES package_version(package_version_id) ON DELETE CASCADE,
  package_id INTEGER NOT NULL REFERENCES package(package_id),
  version_range TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS data_source (
  url TEXT NOT NULL,
  flags INTEGER NOT NULL DEFAULT 0
);
"#;

/// Errors surfaced by the package database.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
  #[error("no such package in db: {0}")]
  UnknownPackage(PackageId),

  #[error("no such package path in db: {0}")]
  UnknownPath(PackagePath),

  #[error("no such package group: {0}")]
  UnknownGroup(i64),

  #[error("zero group number")]
  ZeroGroup,

  #[error("no data sources available")]
  NoDataSources,

  #[error("invalid stored value: {0}")]
  Corrupt(String),

  #[error("failed to create database directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("database error: {0}")]
  Sql(#[from] rusqlite::Error),
}

/// A remote source packages can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
  pub url: String,
  pub flags: u64,
}

impl DataSource {
  pub const FLAG_DISABLED: u64 = 1;

  pub fn is_disabled(&self) -> bool {
    self.flags & Self::FLAG_DISABLED != 0
  }
}

/// The packages database. Cheap to share behind an `Arc`.
pub struct PackagesDatabase {
  conn: Mutex<Connection>,
}

impl PackagesDatabase {
  /// Open (creating if necessary) the database at `path`.
  ///
  /// First creation is guarded by a file lock so that concurrent processes
  /// do not race on schema setup.
  pub fn open(path: &Path) -> Result<Self, DatabaseError> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(DatabaseError::CreateDir)?;
    }
    if !path.exists() {
      let lock_path = path.with_extension("lock");
      let _lock = FileLock::acquire(&lock_path, LockMode::Exclusive, "db-create")?;
      // Re-check under the lock; another process may have won the race.
      let conn = Connection::open(path)?;
      Self::configure(&conn)?;
      return Ok(Self { conn: Mutex::new(conn) });
    }

    let conn = Connection::open(path)?;
    Self::configure(&conn)?;
    Ok(Self { conn: Mutex::new(conn) })
  }

  /// An in-memory database, used by tests and dry runs.
  pub fn in_memory() -> Result<Self, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    Self::configure(&conn)?;
    Ok(Self { conn: Mutex::new(conn) })
  }

  fn configure(conn: &Connection) -> Result<(), DatabaseError> {
    conn.busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
  }

  fn conn(&self) -> MutexGuard<'_, Connection> {
    self.conn.lock().unwrap()
  }

  /// Resolve each reference to its maximum satisfying installed version.
  ///
  /// References whose path is unknown or whose range no installed version
  /// satisfies land in the returned unresolved set instead of failing the
  /// whole call.
  #[allow(clippy::type_complexity)]
  pub fn resolve(
    &self,
    unresolved: &BTreeSet<UnresolvedPackage>,
  ) -> Result<(BTreeMap<UnresolvedPackage, PackageId>, BTreeSet<UnresolvedPackage>), DatabaseError> {
    let conn = self.conn();
    let mut resolved = BTreeMap::new();
    let mut unmet = BTreeSet::new();

    for upkg in unresolved {
      let Some(package_id) = Self::package_row_id(&conn, &upkg.path)? else {
        trace!(package = %upkg, "path not in db");
        unmet.insert(upkg.clone());
        continue;
      };

      let versions = Self::versions_for_row(&conn, package_id)?;
      match upkg.range.max_satisfying(&versions) {
        Some(v) => {
          resolved.insert(upkg.clone(), PackageId::new(upkg.path.clone(), v));
        }
        None => {
          trace!(package = %upkg, "no satisfying version");
          unmet.insert(upkg.clone());
        }
      }
    }

    debug!(resolved = resolved.len(), unresolved = unmet.len(), "db resolve");
    Ok((resolved, unmet))
  }

  /// Full metadata record of an installed package version.
  pub fn get_package_data(&self, id: &PackageId) -> Result<PackageData, DatabaseError> {
    let conn = self.conn();
    let package_id =
      Self::package_row_id(&conn, id.path())?.ok_or_else(|| DatabaseError::UnknownPackage(id.clone()))?;

    let row = conn
      .query_row(
        "SELECT package_version_id, hash, flags, group_number, prefix, sdir \
         FROM package_version WHERE package_id = ?1 AND version = ?2",
        params![package_id, id.version().to_string()],
        |row| {
          Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, Option<String>>(5)?,
          ))
        },
      )
      .optional()?
      .ok_or_else(|| DatabaseError::UnknownPackage(id.clone()))?;

    let (version_id, hash, flags, group_number, prefix, sdir) = row;

    let mut dependencies = BTreeMap::new();
    let mut stmt = conn.prepare(
      "SELECT p.path, d.version_range \
       FROM package_dependency d JOIN package p ON d.package_id = p.package_id \
       WHERE d.package_version_id = ?1",
    )?;
    let mut rows = stmt.query(params![version_id])?;
    while let Some(row) = rows.next()? {
      let path: String = row.get(0)?;
      let range: String = row.get(1)?;
      let path: PackagePath = path.parse().map_err(|_| DatabaseError::Corrupt(path.clone()))?;
      let range: VersionRange = range.parse().map_err(|_| DatabaseError::Corrupt(range.clone()))?;
      dependencies.insert(path, range);
    }

    Ok(PackageData {
      hash,
      flags: flags as u64,
      group_number,
      prefix: prefix as i32,
      sdir: sdir.map(PathBuf::from),
      dependencies,
    })
  }

  /// Register an installed package version. Transactional: either the
  /// version row and all its dependency rows land, or nothing does.
  pub fn install_package(&self, id: &PackageId, data: &PackageData) -> Result<(), DatabaseError> {
    let mut conn = self.conn();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let package_id = Self::ensure_package_row(&tx, id.path())?;

    // A reinstall replaces the previous record for this exact version.
    tx.execute(
      "DELETE FROM package_version WHERE package_id = ?1 AND version = ?2",
      params![package_id, id.version().to_string()],
    )?;

    tx.execute(
      "INSERT INTO package_version (package_id, version, hash, flags, group_number, prefix, sdir, archive_version, updated) \
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, '')",
      params![
        package_id,
        id.version().to_string(),
        data.hash,
        data.flags as i64,
        data.group_number,
        data.prefix as i64,
        data.sdir.as_ref().map(|p| p.to_string_lossy().into_owned()),
      ],
    )?;
    let version_id = tx.last_insert_rowid();

    for (dep_path, range) in &data.dependencies {
      let dep_package_id = Self::ensure_package_row(&tx, dep_path)?;
      tx.execute(
        "INSERT INTO package_dependency (package_version_id, package_id, version_range) VALUES (?1, ?2, ?3)",
        params![version_id, dep_package_id, range.to_string()],
      )?;
    }

    tx.commit()?;
    debug!(package = %id, "installed into db");
    Ok(())
  }

  /// A package is installed when its version row exists and the stored hash
  /// matches the expected one.
  pub fn is_installed(&self, id: &PackageId, data: &PackageData) -> Result<bool, DatabaseError> {
    let conn = self.conn();
    let Some(hash) = Self::installed_hash(&conn, id)? else {
      return Ok(false);
    };
    Ok(hash == data.hash)
  }

  pub fn set_group_number(&self, id: &PackageId, group_number: i64) -> Result<(), DatabaseError> {
    let conn = self.conn();
    let version_id =
      Self::version_row_id(&conn, id)?.ok_or_else(|| DatabaseError::UnknownPackage(id.clone()))?;
    conn.execute(
      "UPDATE package_version SET group_number = ?1 WHERE package_version_id = ?2",
      params![group_number, version_id],
    )?;
    Ok(())
  }

  /// The first version installed within a group (ordered by row id).
  pub fn group_leader(&self, group_number: i64) -> Result<PackageId, DatabaseError> {
    if group_number == 0 {
      return Err(DatabaseError::ZeroGroup);
    }
    let conn = self.conn();
    let row = conn
      .query_row(
        "SELECT p.path, v.version \
         FROM package_version v JOIN package p ON v.package_id = p.package_id \
         WHERE v.group_number = ?1 ORDER BY v.package_version_id ASC LIMIT 1",
        params![group_number],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
      )
      .optional()?
      .ok_or(DatabaseError::UnknownGroup(group_number))?;

    let path: PackagePath = row.0.parse().map_err(|_| DatabaseError::Corrupt(row.0.clone()))?;
    let version: Version = row.1.parse().map_err(|_| DatabaseError::Corrupt(row.1.clone()))?;
    Ok(PackageId::new(path, version))
  }

  /// All package versions whose source directory is overridden.
  pub fn overridden_packages(&self) -> Result<Vec<PackageId>, DatabaseError> {
    let conn = self.conn();
    let mut stmt = conn.prepare(
      "SELECT p.path, v.version \
       FROM package_version v JOIN package p ON v.package_id = p.package_id \
       WHERE v.sdir IS NOT NULL ORDER BY v.package_version_id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
      let path: String = row.get(0)?;
      let version: String = row.get(1)?;
      let path: PackagePath = path.parse().map_err(|_| DatabaseError::Corrupt(path.clone()))?;
      let version: Version = version.parse().map_err(|_| DatabaseError::Corrupt(version.clone()))?;
      out.push(PackageId::new(path, version));
    }
    Ok(out)
  }

  /// The overriding source directory of a package, if any.
  pub fn overridden_dir(&self, id: &PackageId) -> Result<Option<PathBuf>, DatabaseError> {
    let conn = self.conn();
    let Some(package_id) = Self::package_row_id(&conn, id.path())? else {
      return Ok(None);
    };
    let sdir: Option<Option<String>> = conn
      .query_row(
        "SELECT sdir FROM package_version WHERE package_id = ?1 AND version = ?2",
        params![package_id, id.version().to_string()],
        |row| row.get(0),
      )
      .optional()?;
    Ok(sdir.flatten().map(PathBuf::from))
  }

  /// Drop the source-dir override of a package, keeping the version row.
  pub fn delete_package(&self, id: &PackageId) -> Result<(), DatabaseError> {
    let conn = self.conn();
    let Some(package_id) = Self::package_row_id(&conn, id.path())? else {
      return Ok(());
    };
    conn.execute(
      "UPDATE package_version SET sdir = NULL WHERE package_id = ?1 AND version = ?2",
      params![package_id, id.version().to_string()],
    )?;
    Ok(())
  }

  /// Remove every version row whose override points at `sdir`.
  pub fn delete_overridden_package_dir(&self, sdir: &Path) -> Result<usize, DatabaseError> {
    let conn = self.conn();
    let removed = conn.execute(
      "DELETE FROM package_version WHERE sdir = ?1",
      params![sdir.to_string_lossy().into_owned()],
    )?;
    Ok(removed)
  }

  /// Paths matching a substring, case-insensitively. An empty query lists
  /// everything.
  pub fn matching_packages(&self, name: &str) -> Result<Vec<PackagePath>, DatabaseError> {
    let conn = self.conn();
    let mut stmt = conn.prepare("SELECT path FROM package WHERE path LIKE ?1 ORDER BY path COLLATE NOCASE")?;
    let pattern = format!("%{name}%");
    let mut rows = stmt.query(params![pattern])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
      let path: String = row.get(0)?;
      out.push(path.parse().map_err(|_| DatabaseError::Corrupt(path.clone()))?);
    }
    Ok(out)
  }

  /// All installed versions of a path.
  pub fn versions_for_package(&self, path: &PackagePath) -> Result<Vec<Version>, DatabaseError> {
    let conn = self.conn();
    let Some(package_id) = Self::package_row_id(&conn, path)? else {
      return Err(DatabaseError::UnknownPath(path.clone()));
    };
    Self::versions_for_row(&conn, package_id)
  }

  /// Enabled data sources. At least one must exist.
  pub fn data_sources(&self) -> Result<Vec<DataSource>, DatabaseError> {
    let conn = self.conn();
    let mut stmt = conn.prepare("SELECT url, flags FROM data_source")?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
      let ds = DataSource {
        url: row.get(0)?,
        flags: row.get::<_, i64>(1)? as u64,
      };
      if ds.is_disabled() {
        continue;
      }
      out.push(ds);
    }
    if out.is_empty() {
      return Err(DatabaseError::NoDataSources);
    }
    Ok(out)
  }

  pub fn add_data_source(&self, url: &str, flags: u64) -> Result<(), DatabaseError> {
    let conn = self.conn();
    conn.execute(
      "INSERT INTO data_source (url, flags) VALUES (?1, ?2)",
      params![url, flags as i64],
    )?;
    Ok(())
  }

  fn package_row_id(conn: &Connection, path: &PackagePath) -> Result<Option<i64>, DatabaseError> {
    let id = conn
      .query_row(
        "SELECT package_id FROM package WHERE path = ?1 COLLATE NOCASE",
        params![path.to_string()],
        |row| row.get(0),
      )
      .optional()?;
    Ok(id)
  }

  fn ensure_package_row(conn: &Connection, path: &PackagePath) -> Result<i64, DatabaseError> {
    if let Some(id) = Self::package_row_id(conn, path)? {
      return Ok(id);
    }
    conn.execute("INSERT INTO package (path) VALUES (?1)", params![path.to_string()])?;
    Ok(conn.last_insert_rowid())
  }

  fn version_row_id(conn: &Connection, id: &PackageId) -> Result<Option<i64>, DatabaseError> {
    let Some(package_id) = Self::package_row_id(conn, id.path())? else {
      return Ok(None);
    };
    let vid = conn
      .query_row(
        "SELECT package_version_id FROM package_version WHERE package_id = ?1 AND version = ?2",
        params![package_id, id.version().to_string()],
        |row| row.get(0),
      )
      .optional()?;
    Ok(vid)
  }

  fn installed_hash(conn: &Connection, id: &PackageId) -> Result<Option<String>, DatabaseError> {
    let Some(package_id) = Self::package_row_id(conn, id.path())? else {
      return Ok(None);
    };
    let hash = conn
      .query_row(
        "SELECT hash FROM package_version WHERE package_id = ?1 AND version = ?2",
        params![package_id, id.version().to_string()],
        |row| row.get(0),
      )
      .optional()?;
    Ok(hash)
  }

  fn versions_for_row(conn: &Connection, package_id: i64) -> Result<Vec<Version>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT version FROM package_version WHERE package_id = ?1")?;
    let mut rows = stmt.query(params![package_id])?;
    let mut versions = Vec::new();
    while let Some(row) = rows.next()? {
      let v: String = row.get(0)?;
      versions.push(v.parse().map_err(|_| DatabaseError::Corrupt(v.clone()))?);
    }
    Ok(versions)
  }
}
