use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use driftfix_common::{Error, Result};
use driftfix_migrate::{SchemaVersion, Scope, ScopeStore};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::database::{StoreOptions, connect};
use crate::schema::{check_prefix, network_tables_sql, quote_ident, site_tables_sql};

/// Option holding the scope's applied schema version.
pub const WATERMARK_OPTION: &str = "driftfix_last_version";

/// Option whose presence marks a migration run in progress.
pub const LOCK_OPTION: &str = "driftfix_migration_lock";

/// One site's view of the database: its prefixed tables plus the shared
/// network tables.
///
/// A store is used by one run at a time; concurrent runs on the same site
/// are serialized through the lock option, not through this type.
pub struct SiteStore {
    conn: Mutex<Connection>,
    scope: Scope,
    base_prefix: String,
    lock_stale_after: Duration,
    /// Holder of the migration lock taken through this store, if any.
    held: Mutex<Option<String>>,
}

/// Outcome of [`SiteStore::rename_option`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionRename {
    Renamed,
    /// The source option does not exist (already renamed, or never set).
    Missing,
    /// Both names exist; nothing was changed.
    TargetExists,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    holder: String,
    acquired_at: DateTime<Utc>,
    /// Last heartbeat from the holder; absent until the first refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refreshed_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    fn new(holder: &str) -> Self {
        Self {
            holder: holder.to_string(),
            acquired_at: Utc::now(),
            refreshed_at: None,
        }
    }

    fn is_stale(&self, stale_after: Duration) -> bool {
        let seen = self.refreshed_at.unwrap_or(self.acquired_at);
        (Utc::now() - seen).to_std().unwrap_or_default() >= stale_after
    }
}

fn read_lock(conn: &Connection, options: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        &format!("SELECT option_value FROM {options} WHERE option_name = ?1"),
        params![LOCK_OPTION],
        |row| row.get(0),
    )
    .optional()
}

impl SiteStore {
    pub fn open(
        db_path: &Path,
        scope: Scope,
        base_prefix: &str,
        options: &StoreOptions,
    ) -> Result<Self> {
        check_prefix(&scope.table_prefix)?;
        check_prefix(base_prefix)?;
        debug!("opening site store for scope {} at {}", scope, db_path.display());

        let conn = connect(db_path, options)?;

        Ok(Self {
            conn: Mutex::new(conn),
            scope,
            base_prefix: base_prefix.to_string(),
            lock_stale_after: options.lock_stale_after,
            held: Mutex::new(None),
        })
    }

    /// A single-site store backed by a fresh in-memory database with the
    /// site and network tables installed.
    pub fn in_memory(scope: Scope) -> Result<Self> {
        check_prefix(&scope.table_prefix)?;
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch(&network_tables_sql(&scope.table_prefix))
            .and_then(|_| conn.execute_batch(&site_tables_sql(&scope.table_prefix)))
            .map_err(|e| Error::Database(format!("failed to install tables: {e}")))?;

        let base_prefix = scope.table_prefix.clone();
        Ok(Self {
            conn: Mutex::new(conn),
            scope,
            base_prefix,
            lock_stale_after: StoreOptions::default().lock_stale_after,
            held: Mutex::new(None),
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn prefix(&self) -> &str {
        &self.scope.table_prefix
    }

    /// Quoted name of a per-site table, e.g. `"wp_3_posts"`.
    pub fn table(&self, name: &str) -> String {
        quote_ident(&format!("{}{}", self.scope.table_prefix, name))
    }

    /// Quoted name of a network-wide table, e.g. `"wp_usermeta"`.
    pub fn global_table(&self, name: &str) -> String {
        quote_ident(&format!("{}{}", self.base_prefix, name))
    }

    /// Keep the migration lock held through this store alive. Long steps
    /// call this between units of work; it does nothing when no lock is
    /// held here.
    ///
    /// # Errors
    ///
    /// `Error::Migration` when another run has taken the lock over, in
    /// which case the step must stop writing.
    pub fn heartbeat(&self) -> Result<()> {
        let Some(holder) = self.held_by()? else {
            return Ok(());
        };
        if self.refresh_lock(&holder)? {
            return Ok(());
        }
        Err(Error::Migration(format!(
            "migration lock for scope {} was taken over from {holder}",
            self.scope.id
        )))
    }

    fn held_by(&self) -> Result<Option<String>> {
        self.held
            .lock()
            .map(|held| held.clone())
            .map_err(|_| Error::Database("lock holder poisoned".into()))
    }

    fn set_held(&self, holder: Option<&str>) {
        if let Ok(mut held) = self.held.lock() {
            *held = holder.map(str::to_string);
        }
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("site store lock poisoned".into()))
    }

    /// Run `f` against the connection; failures become `Error::Database`
    /// naming `what` was being done.
    pub fn with_connection<T>(
        &self,
        what: &str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.connection()?;
        f(&conn).map_err(|e| Error::Database(format!("failed to {what}: {e}")))
    }

    /// Whether the per-site table `name` (without prefix) exists.
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let full = format!("{}{}", self.scope.table_prefix, name);
        self.with_connection("check table", |conn| {
            conn.query_row(
                "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![full],
                |row| row.get(0),
            )
        })
    }

    /// Rename a per-site table when the old one exists and the new one does
    /// not. Returns whether a rename happened.
    pub fn rename_table(&self, from: &str, to: &str) -> Result<bool> {
        if !self.table_exists(from)? {
            debug!("table {}{} absent, nothing to rename", self.prefix(), from);
            return Ok(false);
        }
        if self.table_exists(to)? {
            warn!(
                "both {p}{from} and {p}{to} exist in scope {}; leaving them alone",
                self.scope.id,
                p = self.prefix()
            );
            return Ok(false);
        }

        let sql = format!(
            "ALTER TABLE {} RENAME TO {}",
            self.table(from),
            self.table(to)
        );
        self.with_connection("rename table", |conn| conn.execute_batch(&sql))?;
        info!("renamed table {p}{from} to {p}{to}", p = self.prefix());
        Ok(true)
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.table(name));
        self.with_connection("drop table", |conn| conn.execute_batch(&sql))
    }

    pub fn get_option(&self, name: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT option_value FROM {} WHERE option_name = ?1",
            self.table("options")
        );
        self.with_connection("read option", |conn| {
            conn.query_row(&sql, params![name], |row| row.get(0))
                .optional()
        })
    }

    pub fn update_option(&self, name: &str, value: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (option_name, option_value, autoload) VALUES (?1, ?2, 'yes')
             ON CONFLICT(option_name) DO UPDATE SET option_value = excluded.option_value",
            self.table("options")
        );
        self.with_connection("write option", |conn| {
            conn.execute(&sql, params![name, value]).map(|_| ())
        })
    }

    /// Returns whether the option existed.
    pub fn delete_option(&self, name: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE option_name = ?1", self.table("options"));
        self.with_connection("delete option", |conn| {
            conn.execute(&sql, params![name]).map(|n| n > 0)
        })
    }

    pub fn rename_option(&self, from: &str, to: &str) -> Result<OptionRename> {
        let options = self.table("options");
        self.with_connection("rename option", |conn| {
            let exists = |name: &str| -> rusqlite::Result<bool> {
                conn.query_row(
                    &format!("SELECT count(*) > 0 FROM {options} WHERE option_name = ?1"),
                    params![name],
                    |row| row.get(0),
                )
            };

            if !exists(from)? {
                return Ok(OptionRename::Missing);
            }
            if exists(to)? {
                return Ok(OptionRename::TargetExists);
            }
            conn.execute(
                &format!("UPDATE {options} SET option_name = ?1 WHERE option_name = ?2"),
                params![to, from],
            )?;
            Ok(OptionRename::Renamed)
        })
    }
}

impl ScopeStore for SiteStore {
    fn applied_version(&self) -> Result<Option<SchemaVersion>> {
        match self.get_option(WATERMARK_OPTION)? {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                Error::Database(format!(
                    "scope {} has an unreadable {WATERMARK_OPTION}: {raw:?}",
                    self.scope.id
                ))
            }),
        }
    }

    fn record_applied(&self, version: &SchemaVersion) -> Result<()> {
        self.update_option(WATERMARK_OPTION, &version.to_string())
    }

    fn clear_applied(&self) -> Result<()> {
        self.delete_option(WATERMARK_OPTION).map(|_| ())
    }

    fn try_lock(&self, holder: &str) -> Result<bool> {
        let record = serde_json::to_string(&LockRecord::new(holder))?;
        let options = self.table("options");
        let stale_after = self.lock_stale_after;

        let taken = self.with_connection("take migration lock", |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {options} (option_name, option_value, autoload)
                     VALUES (?1, ?2, 'no')"
                ),
                params![LOCK_OPTION, record],
            )?;
            if inserted == 1 {
                return Ok(true);
            }

            let Some(existing) = read_lock(conn, &options)? else {
                // Released between the insert and the read; the caller polls again.
                return Ok(false);
            };

            let stale = serde_json::from_str::<LockRecord>(&existing)
                .map_or(true, |lock| lock.is_stale(stale_after));
            if !stale {
                return Ok(false);
            }

            let taken = conn.execute(
                &format!(
                    "UPDATE {options} SET option_value = ?1
                     WHERE option_name = ?2 AND option_value = ?3"
                ),
                params![record, LOCK_OPTION, existing],
            )?;
            if taken == 1 {
                warn!("took over stale migration lock: {existing}");
            }
            Ok(taken == 1)
        })?;

        if taken {
            self.set_held(Some(holder));
        }
        Ok(taken)
    }

    fn refresh_lock(&self, holder: &str) -> Result<bool> {
        let options = self.table("options");
        self.with_connection("refresh migration lock", |conn| {
            let Some(existing) = read_lock(conn, &options)? else {
                return Ok(false);
            };
            let Some(mut lock) = serde_json::from_str::<LockRecord>(&existing)
                .ok()
                .filter(|lock| lock.holder == holder)
            else {
                return Ok(false);
            };

            lock.refreshed_at = Some(Utc::now());
            let record = serde_json::to_string(&lock)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            let refreshed = conn.execute(
                &format!(
                    "UPDATE {options} SET option_value = ?1
                     WHERE option_name = ?2 AND option_value = ?3"
                ),
                params![record, LOCK_OPTION, existing],
            )?;
            Ok(refreshed == 1)
        })
    }

    fn unlock(&self, holder: &str) -> Result<()> {
        let options = self.table("options");
        let released = self.with_connection("release migration lock", |conn| {
            let existing = read_lock(conn, &options)?;

            let owned = existing.as_deref().and_then(|raw| {
                serde_json::from_str::<LockRecord>(raw)
                    .ok()
                    .filter(|lock| lock.holder == holder)
                    .map(|_| raw)
            });
            if let Some(raw) = owned {
                conn.execute(
                    &format!("DELETE FROM {options} WHERE option_name = ?1 AND option_value = ?2"),
                    params![LOCK_OPTION, raw],
                )?;
            }
            Ok(())
        });
        if self.held_by().ok().flatten().as_deref() == Some(holder) {
            self.set_held(None);
        }
        released
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(self.get_option(LOCK_OPTION)?.is_some())
    }

    fn transaction(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.with_connection("begin transaction", |conn| {
            conn.execute_batch("BEGIN IMMEDIATE")
        })?;

        match work() {
            Ok(()) => {
                if let Err(e) = self.with_connection("commit", |conn| conn.execute_batch("COMMIT")) {
                    self.rollback();
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }
}

impl SiteStore {
    fn rollback(&self) {
        if let Err(e) = self.with_connection("roll back", |conn| conn.execute_batch("ROLLBACK")) {
            warn!("rollback failed for scope {}: {e}", self.scope.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SiteStore {
        SiteStore::in_memory(Scope::new("1", "wp_")).unwrap()
    }

    #[test]
    fn watermark_round_trip() {
        let store = store();
        assert_eq!(store.applied_version().unwrap(), None);

        store.record_applied(&SchemaVersion::new(0, 30, 0)).unwrap();
        assert_eq!(
            store.applied_version().unwrap(),
            Some(SchemaVersion::new(0, 30, 0))
        );
        assert_eq!(
            store.get_option(WATERMARK_OPTION).unwrap().as_deref(),
            Some("0.30.0")
        );

        store.clear_applied().unwrap();
        assert_eq!(store.applied_version().unwrap(), None);
    }

    #[test]
    fn unreadable_watermark_is_an_error() {
        let store = store();
        store.update_option(WATERMARK_OPTION, "not-a-version").unwrap();
        let err = store.applied_version().unwrap_err();
        assert!(err.to_string().contains("unreadable"));
    }

    #[test]
    fn lock_is_exclusive_until_released_by_its_holder() {
        let store = store();
        assert!(store.try_lock("run-a").unwrap());
        assert!(!store.try_lock("run-b").unwrap());
        assert!(store.is_locked().unwrap());

        store.unlock("run-b").unwrap();
        assert!(store.is_locked().unwrap());

        store.unlock("run-a").unwrap();
        assert!(!store.is_locked().unwrap());
        assert!(store.try_lock("run-b").unwrap());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let store = store();
        let old = serde_json::json!({
            "holder": "crashed-run",
            "acquired_at": (Utc::now() - chrono::Duration::hours(2)).to_rfc3339(),
        });
        store.update_option(LOCK_OPTION, &old.to_string()).unwrap();

        assert!(store.try_lock("fresh-run").unwrap());
        assert!(!store.try_lock("another-run").unwrap());
        store.unlock("fresh-run").unwrap();
        assert!(!store.is_locked().unwrap());
    }

    /// Two stores on one file, as two concurrent runs would see it.
    fn shared_stores(dir: &tempfile::TempDir, stale_after: Duration) -> (SiteStore, SiteStore) {
        use driftfix_migrate::ScopeProvider;

        let options = StoreOptions {
            lock_stale_after: stale_after,
            ..StoreOptions::default()
        };
        let database =
            crate::SiteDatabase::new(dir.path().join("site.db"), "wp_", false, options).unwrap();
        database.install().unwrap();
        let scope = database.scope_for(1);
        (database.open(&scope).unwrap(), database.open(&scope).unwrap())
    }

    #[test]
    fn refreshed_lock_is_not_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let (long_run, concurrent) = shared_stores(&dir, Duration::from_millis(300));
        assert!(long_run.try_lock("long-run").unwrap());

        for _ in 0..2 {
            std::thread::sleep(Duration::from_millis(200));
            long_run.heartbeat().unwrap();
        }
        assert!(!concurrent.try_lock("concurrent-run").unwrap());

        long_run.unlock("long-run").unwrap();
        assert!(concurrent.try_lock("concurrent-run").unwrap());
    }

    #[test]
    fn silent_holder_loses_the_lock_and_its_heartbeat_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (crashed, concurrent) = shared_stores(&dir, Duration::from_millis(100));
        assert!(crashed.try_lock("crashed-run").unwrap());

        std::thread::sleep(Duration::from_millis(150));
        assert!(concurrent.try_lock("concurrent-run").unwrap());

        assert!(!crashed.refresh_lock("crashed-run").unwrap());
        let err = crashed.heartbeat().unwrap_err();
        assert!(err.to_string().contains("taken over"));
        // The old holder's release leaves the new lock in place.
        crashed.unlock("crashed-run").unwrap();
        assert!(concurrent.is_locked().unwrap());
        concurrent.heartbeat().unwrap();
    }

    #[test]
    fn heartbeat_without_a_lock_does_nothing() {
        let store = store();
        store.heartbeat().unwrap();
        assert!(!store.is_locked().unwrap());

        assert!(store.try_lock("run").unwrap());
        store.unlock("run").unwrap();
        store.heartbeat().unwrap();
        assert!(!store.is_locked().unwrap());
    }

    #[test]
    fn garbage_lock_value_is_treated_as_stale() {
        let store = store();
        store.update_option(LOCK_OPTION, "???").unwrap();
        assert!(store.try_lock("run").unwrap());
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = store();
        let err = store
            .transaction(&mut || {
                store.update_option("gatherpress_x", "1")?;
                Err(Error::Other("boom".into()))
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(store.get_option("gatherpress_x").unwrap(), None);

        store
            .transaction(&mut || store.update_option("gatherpress_x", "2"))
            .unwrap();
        assert_eq!(store.get_option("gatherpress_x").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn rename_table_detects_state_first() {
        let store = store();
        store
            .with_connection("create", |conn| {
                conn.execute_batch("CREATE TABLE wp_gp_events (post_id INTEGER PRIMARY KEY)")
            })
            .unwrap();

        assert!(store.rename_table("gp_events", "gatherpress_events").unwrap());
        assert!(!store.rename_table("gp_events", "gatherpress_events").unwrap());
        assert!(store.table_exists("gatherpress_events").unwrap());
        assert!(!store.table_exists("gp_events").unwrap());
    }

    #[test]
    fn rename_option_reports_outcome() {
        let store = store();
        assert_eq!(store.rename_option("a", "b").unwrap(), OptionRename::Missing);

        store.update_option("a", "1").unwrap();
        assert_eq!(store.rename_option("a", "b").unwrap(), OptionRename::Renamed);
        assert_eq!(store.get_option("b").unwrap().as_deref(), Some("1"));

        store.update_option("a", "2").unwrap();
        assert_eq!(store.rename_option("a", "b").unwrap(), OptionRename::TargetExists);
        assert_eq!(store.get_option("b").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn rejects_unsafe_prefix() {
        assert!(SiteStore::in_memory(Scope::new("1", "wp\"; --")).is_err());
    }
}
