use driftfix_common::{Error, Result};
use driftfix_db::SiteStore;
use driftfix_migrate::{SchemaVersion, Step};
use rusqlite::{OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::timezone::SiteTimezone;

const LEGACY_TABLE: &str = "gatherpress_rsvps";
pub const RSVP_COMMENT_TYPE: &str = "gatherpress_rsvp";

/// One row of the legacy RSVP table.
#[derive(Debug, Clone, PartialEq)]
struct LegacyRsvp {
    post_id: i64,
    user_id: i64,
    timestamp: String,
    status: String,
    guests: i64,
    anonymous: bool,
}

/// Moves rows from the legacy `gatherpress_rsvps` table into RSVP comments,
/// then drops the table.
pub struct MoveRsvpsToComments {
    version: SchemaVersion,
}

impl MoveRsvpsToComments {
    pub fn new(version: SchemaVersion) -> Self {
        Self { version }
    }
}

impl Step<SiteStore> for MoveRsvpsToComments {
    fn name(&self) -> &str {
        "move-rsvps-to-comments"
    }

    fn version(&self) -> &SchemaVersion {
        &self.version
    }

    fn apply(&self, store: &SiteStore) -> Result<()> {
        if !store.table_exists(LEGACY_TABLE)? {
            debug!("no legacy rsvp table in scope {}", store.scope().id);
            return Ok(());
        }

        let tz = SiteTimezone::load(store)?;
        let rows = legacy_rows(store)?;
        let mut moved = 0;

        for row in &rows {
            if rsvp_comment_exists(store, row.post_id, row.user_id)? {
                debug!(
                    "post {} user {} already has an rsvp comment",
                    row.post_id, row.user_id
                );
                continue;
            }
            insert_rsvp_comment(store, &tz, row)?;
            moved += 1;
        }

        store.drop_table(LEGACY_TABLE)?;
        info!(
            "moved {moved} of {} rsvps to comments in scope {}",
            rows.len(),
            store.scope().id
        );
        Ok(())
    }
}

fn legacy_rows(store: &SiteStore) -> Result<Vec<LegacyRsvp>> {
    let sql = format!(
        "SELECT post_id, user_id, timestamp, status, guests, anonymous FROM {} ORDER BY post_id, user_id",
        store.table(LEGACY_TABLE)
    );
    store.with_connection("read legacy rsvps", |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(LegacyRsvp {
                post_id: row.get(0)?,
                user_id: row.get(1)?,
                timestamp: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                status: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                guests: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                anonymous: row.get::<_, Option<i64>>(5)?.unwrap_or(0) != 0,
            })
        })?;
        rows.collect()
    })
}

fn rsvp_comment_exists(store: &SiteStore, post_id: i64, user_id: i64) -> Result<bool> {
    let sql = format!(
        "SELECT comment_ID FROM {} WHERE comment_post_ID = ?1 AND user_id = ?2 AND comment_type = ?3 LIMIT 1",
        store.table("comments")
    );
    let found: Option<i64> = store.with_connection("look up rsvp comment", |conn| {
        conn.query_row(&sql, params![post_id, user_id, RSVP_COMMENT_TYPE], |row| row.get(0))
            .optional()
    })?;
    Ok(found.is_some())
}

fn insert_rsvp_comment(store: &SiteStore, tz: &SiteTimezone, row: &LegacyRsvp) -> Result<()> {
    if row.timestamp.is_empty() {
        return Err(Error::Content(format!(
            "rsvp for post {} user {} has no timestamp",
            row.post_id, row.user_id
        )));
    }
    let gmt = tz.gmt_string(&row.timestamp).unwrap_or_else(|| {
        warn!(
            "cannot convert rsvp time {:?} to GMT; storing it unchanged",
            row.timestamp
        );
        row.timestamp.clone()
    });

    let comments = store.table("comments");
    let commentmeta = store.table("commentmeta");
    store.with_connection("insert rsvp comment", |conn| {
        conn.execute(
            &format!(
                "INSERT INTO {comments}
                    (comment_post_ID, comment_date, comment_date_gmt, comment_approved, comment_type, user_id)
                 VALUES (?1, ?2, ?3, '1', ?4, ?5)"
            ),
            params![row.post_id, row.timestamp, gmt, RSVP_COMMENT_TYPE, row.user_id],
        )?;
        let comment_id = conn.last_insert_rowid();

        let meta = [
            ("gatherpress_rsvp_status", row.status.clone()),
            ("gatherpress_rsvp_guests", row.guests.to_string()),
            ("gatherpress_rsvp_anonymous", u8::from(row.anonymous).to_string()),
        ];
        for (key, value) in meta {
            conn.execute(
                &format!(
                    "INSERT INTO {commentmeta} (comment_id, meta_key, meta_value) VALUES (?1, ?2, ?3)"
                ),
                params![comment_id, key, value],
            )?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use driftfix_migrate::Scope;

    use super::*;

    fn store_with_legacy_table() -> SiteStore {
        let store = SiteStore::in_memory(Scope::new("1", "wp_")).unwrap();
        store.update_option("timezone_string", "Europe/Berlin").unwrap();
        store
            .with_connection("seed", |conn| {
                conn.execute_batch(
                    "CREATE TABLE wp_gatherpress_rsvps (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        post_id INTEGER, user_id INTEGER, timestamp TEXT,
                        status TEXT, guests INTEGER, anonymous INTEGER
                     );
                     INSERT INTO wp_gatherpress_rsvps (post_id, user_id, timestamp, status, guests, anonymous) VALUES
                        (10, 1, '2024-06-01 12:00:00', 'attending', 2, 0),
                        (10, 2, '2024-06-02 09:15:00', 'not_attending', 0, 1),
                        (11, 1, '2024-01-10 20:00:00', 'waiting_list', 0, 0);
                     INSERT INTO wp_comments (comment_post_ID, user_id, comment_type) VALUES (11, 1, 'gatherpress_rsvp');",
                )
            })
            .unwrap();
        store
    }

    fn query<T: rusqlite::types::FromSql>(store: &SiteStore, sql: &str) -> T {
        store
            .with_connection("query", |conn| conn.query_row(sql, [], |row| row.get(0)))
            .unwrap()
    }

    #[test]
    fn moves_rows_and_drops_the_table() {
        let store = store_with_legacy_table();
        let step = MoveRsvpsToComments::new(SchemaVersion::new(0, 30, 0));
        step.apply(&store).unwrap();

        assert!(!store.table_exists(LEGACY_TABLE).unwrap());
        let count: i64 = query(
            &store,
            "SELECT count(*) FROM wp_comments WHERE comment_type = 'gatherpress_rsvp'",
        );
        assert_eq!(count, 3);

        let gmt: String = query(
            &store,
            "SELECT comment_date_gmt FROM wp_comments WHERE comment_post_ID = 10 AND user_id = 1",
        );
        assert_eq!(gmt, "2024-06-01 10:00:00");

        let status: String = query(
            &store,
            "SELECT m.meta_value FROM wp_commentmeta m JOIN wp_comments c ON c.comment_ID = m.comment_id
             WHERE c.comment_post_ID = 10 AND c.user_id = 2 AND m.meta_key = 'gatherpress_rsvp_status'",
        );
        assert_eq!(status, "not_attending");
        let anonymous: String = query(
            &store,
            "SELECT m.meta_value FROM wp_commentmeta m JOIN wp_comments c ON c.comment_ID = m.comment_id
             WHERE c.comment_post_ID = 10 AND c.user_id = 2 AND m.meta_key = 'gatherpress_rsvp_anonymous'",
        );
        assert_eq!(anonymous, "1");
    }

    #[test]
    fn second_run_finds_nothing_to_do() {
        let store = store_with_legacy_table();
        let step = MoveRsvpsToComments::new(SchemaVersion::new(0, 30, 0));
        step.apply(&store).unwrap();
        step.apply(&store).unwrap();

        let count: i64 = query(&store, "SELECT count(*) FROM wp_comments");
        assert_eq!(count, 3);
    }
}
