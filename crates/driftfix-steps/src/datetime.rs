use driftfix_common::Result;
use driftfix_db::SiteStore;
use driftfix_migrate::{SchemaVersion, Step};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, warn};

use crate::batch::{BatchProgress, BatchStep, drain};
use crate::timezone::SiteTimezone;

pub const DATETIME_META_KEY: &str = "gatherpress_datetime";
const EVENTS_TABLE: &str = "gatherpress_events";
const ZERO_DATETIME: &str = "0000-00-00 00:00:00";

#[derive(Debug, Default)]
struct EventRow {
    start: String,
    start_gmt: String,
    end: String,
    end_gmt: String,
    timezone: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DatetimeMeta<'a> {
    date_time_start: &'a str,
    date_time_end: &'a str,
    timezone: &'a str,
}

fn blank(value: &str) -> bool {
    value.is_empty() || value == ZERO_DATETIME
}

/// Writes the `gatherpress_datetime` meta for events that lack it, from the
/// events table, and fills any missing GMT columns on the way.
///
/// The meta row is written last and doubles as the per-event "done" marker.
pub struct EventDatetimeBackfill {
    version: SchemaVersion,
    batch_size: usize,
}

impl EventDatetimeBackfill {
    pub fn new(version: SchemaVersion, batch_size: usize) -> Self {
        Self {
            version,
            batch_size: batch_size.max(1),
        }
    }

    fn backfill_event(&self, store: &SiteStore, site_tz: &SiteTimezone, post_id: i64) -> Result<bool> {
        let events = store.table(EVENTS_TABLE);
        let row = store.with_connection("read event datetimes", |conn| {
            conn.query_row(
                &format!(
                    "SELECT datetime_start, datetime_start_gmt, datetime_end, datetime_end_gmt, timezone
                     FROM {events} WHERE post_id = ?1"
                ),
                params![post_id],
                |row| {
                    let text = |i: usize| row.get::<_, Option<String>>(i).map(Option::unwrap_or_default);
                    Ok(EventRow {
                        start: text(0)?,
                        start_gmt: text(1)?,
                        end: text(2)?,
                        end_gmt: text(3)?,
                        timezone: text(4)?,
                    })
                },
            )
            .optional()
        })?;
        let Some(row) = row else {
            debug!("event {post_id} has no datetime row");
            return Ok(false);
        };

        let tz = match SiteTimezone::parse(&row.timezone) {
            Some(tz) => tz,
            None => {
                if !row.timezone.is_empty() {
                    warn!(
                        "event {post_id} has unknown timezone {:?}; using the site timezone",
                        row.timezone
                    );
                }
                *site_tz
            }
        };
        let timezone = if row.timezone.is_empty() {
            tz.identifier()
        } else {
            row.timezone.clone()
        };

        let fill = |local: &str, gmt: &str| -> Option<String> {
            if !blank(gmt) || blank(local) {
                return None;
            }
            tz.gmt_string(local)
        };
        let start_gmt = fill(&row.start, &row.start_gmt);
        let end_gmt = fill(&row.end, &row.end_gmt);

        let meta = serde_json::to_string(&DatetimeMeta {
            date_time_start: &row.start,
            date_time_end: &row.end,
            timezone: &timezone,
        })?;
        let postmeta = store.table("postmeta");

        store.with_connection("write event datetimes", |conn| {
            if start_gmt.is_some() || end_gmt.is_some() {
                conn.execute(
                    &format!(
                        "UPDATE {events} SET
                            datetime_start_gmt = COALESCE(?1, datetime_start_gmt),
                            datetime_end_gmt = COALESCE(?2, datetime_end_gmt)
                         WHERE post_id = ?3"
                    ),
                    params![start_gmt, end_gmt, post_id],
                )?;
            }
            conn.execute(
                &format!("INSERT INTO {postmeta} (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)"),
                params![post_id, DATETIME_META_KEY, meta],
            )
            .map(|_| ())
        })?;
        Ok(true)
    }
}

impl BatchStep for EventDatetimeBackfill {
    fn label(&self) -> &str {
        "event datetime backfill"
    }

    fn process_batch(&self, store: &SiteStore, after: i64) -> Result<BatchProgress> {
        if !store.table_exists(EVENTS_TABLE)? {
            debug!("no events table in scope {}", store.scope().id);
            return Ok(BatchProgress::default());
        }
        let site_tz = SiteTimezone::load(store)?;

        let posts = store.table("posts");
        let postmeta = store.table("postmeta");
        let ids: Vec<i64> = store.with_connection("list events without datetime meta", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT p.ID FROM {posts} p
                 WHERE p.post_type = 'gatherpress_event' AND p.ID > ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM {postmeta} m
                       WHERE m.post_id = p.ID AND m.meta_key = ?2 AND m.meta_value <> ''
                   )
                 ORDER BY p.ID LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![after, DATETIME_META_KEY, self.batch_size as i64],
                |row| row.get(0),
            )?;
            rows.collect()
        })?;

        let mut progress = BatchProgress {
            last_id: ids.last().copied(),
            scanned: ids.len(),
            ..Default::default()
        };
        for post_id in ids {
            if self.backfill_event(store, &site_tz, post_id)? {
                progress.updated += 1;
            } else {
                progress.skipped += 1;
            }
        }
        Ok(progress)
    }
}

impl Step<SiteStore> for EventDatetimeBackfill {
    fn name(&self) -> &str {
        "backfill-event-datetime"
    }

    fn version(&self) -> &SchemaVersion {
        &self.version
    }

    fn transactional(&self) -> bool {
        false
    }

    fn apply(&self, store: &SiteStore) -> Result<()> {
        drain(self, store).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use driftfix_migrate::Scope;

    use super::*;

    fn store() -> SiteStore {
        let store = SiteStore::in_memory(Scope::new("1", "wp_")).unwrap();
        store.update_option("timezone_string", "America/New_York").unwrap();
        store
            .with_connection("seed", |conn| {
                conn.execute_batch(
                    "CREATE TABLE wp_gatherpress_events (
                        post_id INTEGER PRIMARY KEY,
                        datetime_start TEXT, datetime_start_gmt TEXT,
                        datetime_end TEXT, datetime_end_gmt TEXT,
                        timezone TEXT
                     );
                     INSERT INTO wp_posts (ID, post_type) VALUES
                        (1, 'gatherpress_event'), (2, 'gatherpress_event'),
                        (3, 'post'), (4, 'gatherpress_event'), (5, 'gatherpress_event');
                     INSERT INTO wp_gatherpress_events VALUES
                        (1, '2024-07-04 18:00:00', '', '2024-07-04 20:00:00', '0000-00-00 00:00:00', 'Europe/Berlin'),
                        (2, '2024-01-10 09:00:00', '2024-01-10 14:00:00', '2024-01-10 10:00:00', '2024-01-10 15:00:00', ''),
                        (4, '2024-02-01 12:00:00', '', '2024-02-01 13:00:00', '', '+05:30');",
                )
            })
            .unwrap();
        store
    }

    fn meta(store: &SiteStore, post_id: i64) -> Option<serde_json::Value> {
        store
            .with_connection("read", |conn| {
                conn.query_row(
                    "SELECT meta_value FROM wp_postmeta WHERE post_id = ?1 AND meta_key = 'gatherpress_datetime'",
                    params![post_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    fn gmt(store: &SiteStore, post_id: i64) -> (String, String) {
        store
            .with_connection("read", |conn| {
                conn.query_row(
                    "SELECT datetime_start_gmt, datetime_end_gmt FROM wp_gatherpress_events WHERE post_id = ?1",
                    params![post_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .unwrap()
    }

    #[test]
    fn writes_meta_and_fills_missing_gmt() {
        let store = store();
        let step = EventDatetimeBackfill::new(SchemaVersion::new(0, 31, 0), 100);
        let progress = drain(&step, &store).unwrap();
        assert_eq!(progress.updated, 3);
        assert_eq!(progress.skipped, 1);

        let first = meta(&store, 1).unwrap();
        assert_eq!(first["dateTimeStart"], "2024-07-04 18:00:00");
        assert_eq!(first["dateTimeEnd"], "2024-07-04 20:00:00");
        assert_eq!(first["timezone"], "Europe/Berlin");
        assert_eq!(
            gmt(&store, 1),
            ("2024-07-04 16:00:00".to_string(), "2024-07-04 18:00:00".to_string())
        );

        // Existing GMT values are kept; an empty timezone takes the site's.
        assert_eq!(meta(&store, 2).unwrap()["timezone"], "America/New_York");
        assert_eq!(gmt(&store, 2).0, "2024-01-10 14:00:00");

        assert_eq!(gmt(&store, 4).0, "2024-02-01 06:30:00");
        assert!(meta(&store, 3).is_none());
        assert!(meta(&store, 5).is_none());
    }

    #[test]
    fn interrupted_backfill_only_touches_remaining_events() {
        let store = store();
        let step = EventDatetimeBackfill::new(SchemaVersion::new(0, 31, 0), 1);

        let first = step.process_batch(&store, 0).unwrap();
        assert_eq!(first.last_id, Some(1));
        assert_eq!(first.updated, 1);

        // Simulate an edit made after the first batch; a re-run must not
        // rewrite event 1 again.
        store
            .with_connection("edit", |conn| {
                conn.execute(
                    "UPDATE wp_postmeta SET meta_value = '{\"edited\":true}' WHERE post_id = 1",
                    [],
                )
            })
            .unwrap();

        let rest = drain(&step, &store).unwrap();
        assert_eq!(rest.updated, 2);
        assert_eq!(meta(&store, 1).unwrap()["edited"], true);
        assert!(meta(&store, 4).is_some());
    }

    #[test]
    fn missing_events_table_is_a_no_op() {
        let store = SiteStore::in_memory(Scope::new("1", "wp_")).unwrap();
        let step = EventDatetimeBackfill::new(SchemaVersion::new(0, 31, 0), 100);
        step.apply(&store).unwrap();
    }
}
