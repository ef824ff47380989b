use std::path::{Path, PathBuf};
use std::time::Duration;

use driftfix_common::{Error, Result};
use driftfix_migrate::{Scope, ScopeProvider};
use rusqlite::{Connection, OpenFlags, params};
use tracing::info;

use crate::SiteStore;
use crate::schema::{check_prefix, network_tables_sql, quote_ident, site_tables_sql};

/// Connection settings shared by every site store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
    /// Migration locks not refreshed for this long are considered abandoned.
    pub lock_stale_after: Duration,
    /// Inspect an existing database only: the file is never created, no
    /// tables are installed and the journal mode is left alone.
    pub read_only: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            lock_stale_after: Duration::from_secs(15 * 60),
            read_only: false,
        }
    }
}

/// Open `path` with the given options, creating it unless read-only.
pub(crate) fn connect(path: &Path, options: &StoreOptions) -> Result<Connection> {
    let conn = if options.read_only {
        // Read-write without create: a read-only handle cannot always map
        // the WAL index of a database another process is migrating.
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            Error::Database(format!("failed to open existing database {}: {e}", path.display()))
        })?
    } else {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        conn
    };
    conn.busy_timeout(options.busy_timeout)
        .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
    Ok(conn)
}

/// A site database file: one site, or a multisite network whose sites are
/// listed in `{base_prefix}blogs`.
pub struct SiteDatabase {
    path: PathBuf,
    base_prefix: String,
    multisite: bool,
    options: StoreOptions,
}

impl SiteDatabase {
    pub fn new(
        path: impl Into<PathBuf>,
        base_prefix: impl Into<String>,
        multisite: bool,
        options: StoreOptions,
    ) -> Result<Self> {
        let base_prefix = base_prefix.into();
        check_prefix(&base_prefix)?;
        Ok(Self {
            path: path.into(),
            base_prefix,
            multisite,
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_multisite(&self) -> bool {
        self.multisite
    }

    /// Table prefix of a site: the main site uses the base prefix, others
    /// append their blog id.
    pub fn prefix_for(&self, blog_id: i64) -> String {
        if blog_id <= 1 {
            self.base_prefix.clone()
        } else {
            format!("{}{}_", self.base_prefix, blog_id)
        }
    }

    pub fn scope_for(&self, blog_id: i64) -> Scope {
        Scope::new(blog_id.to_string(), self.prefix_for(blog_id))
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    fn connect(&self) -> Result<Connection> {
        connect(&self.path, &self.options)
    }

    fn writable(&self, what: &str) -> Result<()> {
        if self.options.read_only {
            return Err(Error::Database(format!(
                "cannot {what}: {} is opened read-only",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Create the network tables and the main site's tables if missing.
    pub fn install(&self) -> Result<()> {
        self.writable("install tables")?;
        let conn = self.connect()?;
        conn.execute_batch(&network_tables_sql(&self.base_prefix))
            .and_then(|_| conn.execute_batch(&site_tables_sql(&self.base_prefix)))
            .map_err(|e| Error::Database(format!("failed to install tables: {e}")))?;

        if self.multisite {
            let blogs = quote_ident(&format!("{}blogs", self.base_prefix));
            conn.execute(
                &format!("INSERT OR IGNORE INTO {blogs} (blog_id, domain, path) VALUES (1, '', '/')"),
                [],
            )
            .map_err(|e| Error::Database(format!("failed to register main site: {e}")))?;
        }

        info!("site database installed at {}", self.path.display());
        Ok(())
    }

    /// Register another site of a multisite network and install its tables.
    pub fn add_site(&self, domain: &str, path: &str) -> Result<Scope> {
        self.writable("add a site")?;
        if !self.multisite {
            return Err(Error::Database(
                "cannot add a site to a single-site database".into(),
            ));
        }
        let conn = self.connect()?;
        let blogs = quote_ident(&format!("{}blogs", self.base_prefix));
        conn.execute(
            &format!("INSERT INTO {blogs} (domain, path) VALUES (?1, ?2)"),
            params![domain, path],
        )
        .map_err(|e| Error::Database(format!("failed to add site: {e}")))?;

        let scope = self.scope_for(conn.last_insert_rowid());
        conn.execute_batch(&site_tables_sql(&scope.table_prefix))
            .map_err(|e| Error::Database(format!("failed to install site tables: {e}")))?;
        info!("added site {} with prefix {}", scope.id, scope.table_prefix);
        Ok(scope)
    }

    /// Find a scope by its id among the known scopes.
    pub fn find_scope(&self, id: &str) -> Result<Scope> {
        self.scopes()?
            .into_iter()
            .find(|scope| scope.id == id)
            .ok_or_else(|| Error::NotFound(format!("site {id}")))
    }
}

impl ScopeProvider for SiteDatabase {
    type Store = SiteStore;

    fn scopes(&self) -> Result<Vec<Scope>> {
        if !self.multisite {
            return Ok(vec![self.scope_for(1)]);
        }

        let conn = self.connect()?;
        let blogs = quote_ident(&format!("{}blogs", self.base_prefix));
        let mut stmt = conn
            .prepare(&format!(
                "SELECT blog_id FROM {blogs} WHERE deleted = 0 ORDER BY blog_id"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(|e| Error::Database(format!("failed to list sites: {e}")))?;

        let mut scopes = Vec::new();
        for id in ids {
            let id = id.map_err(|e| Error::Database(format!("failed to read site row: {e}")))?;
            scopes.push(self.scope_for(id));
        }
        Ok(scopes)
    }

    fn open(&self, scope: &Scope) -> Result<SiteStore> {
        SiteStore::open(&self.path, scope.clone(), &self.base_prefix, &self.options)
    }
}

#[cfg(test)]
mod tests {
    use driftfix_migrate::ScopeStore;

    use super::*;

    fn database(dir: &tempfile::TempDir, multisite: bool) -> SiteDatabase {
        let db = SiteDatabase::new(
            dir.path().join("data").join("site.db"),
            "wp_",
            multisite,
            StoreOptions::default(),
        )
        .unwrap();
        db.install().unwrap();
        db
    }

    #[test]
    fn single_site_has_one_scope_with_base_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir, false);
        assert_eq!(db.scopes().unwrap(), vec![Scope::new("1", "wp_")]);
        assert!(db.add_site("b.example", "/").is_err());
    }

    #[test]
    fn multisite_lists_every_site_with_its_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir, true);
        let second = db.add_site("b.example", "/").unwrap();
        let third = db.add_site("c.example", "/").unwrap();
        assert_eq!(second, Scope::new("2", "wp_2_"));
        assert_eq!(third.table_prefix, "wp_3_");

        let scopes = db.scopes().unwrap();
        let ids: Vec<_> = scopes.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert_eq!(db.find_scope("3").unwrap(), third);
        assert!(db.find_scope("9").is_err());
    }

    #[test]
    fn each_site_keeps_its_own_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir, true);
        let second = db.add_site("b.example", "/").unwrap();

        let main = db.open(&db.scope_for(1)).unwrap();
        let other = db.open(&second).unwrap();
        main.record_applied(&"0.33.0".parse().unwrap()).unwrap();

        assert!(main.applied_version().unwrap().is_some());
        assert_eq!(other.applied_version().unwrap(), None);
    }

    #[test]
    fn read_only_database_never_creates_or_installs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let options = StoreOptions {
            read_only: true,
            ..StoreOptions::default()
        };
        let db = SiteDatabase::new(&path, "wp_", true, options.clone()).unwrap();

        assert!(db.install().is_err());
        assert!(db.add_site("b.example", "/").is_err());
        assert!(db.scopes().is_err());
        assert!(db.open(&db.scope_for(1)).is_err());
        assert!(!path.exists());

        let installed = database(&dir, false);
        let inspect = SiteDatabase::new(installed.path(), "wp_", false, options).unwrap();
        let store = inspect.open(&inspect.scope_for(1)).unwrap();
        assert_eq!(store.applied_version().unwrap(), None);
    }

    #[test]
    fn lock_is_shared_across_connections_to_the_same_site() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir, false);
        let scope = db.scope_for(1);
        let first = db.open(&scope).unwrap();
        let second = db.open(&scope).unwrap();

        assert!(first.try_lock("cli").unwrap());
        assert!(!second.try_lock("http").unwrap());
        first.unlock("cli").unwrap();
        assert!(second.try_lock("http").unwrap());
    }
}
