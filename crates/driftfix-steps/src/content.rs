//! Post content rewrites: block-marker expansion and CSS class renames.
//!
//! Both rewrites are replace-style, so re-running them over already
//! rewritten content changes nothing. A row is only written when its
//! content actually changed, and only if nobody edited it since it was read.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::LazyLock;

use driftfix_common::Result;
use driftfix_db::SiteStore;
use driftfix_migrate::{SchemaVersion, Step};
use regex::{Captures, Regex};
use rusqlite::ToSql;
use tracing::debug;

use crate::batch::{BatchProgress, BatchStep, drain};

pub const RSVP_TEMPLATE: &str = include_str!("../templates/rsvp-0.32.0.html");
pub const RSVP_RESPONSE_TEMPLATE: &str = include_str!("../templates/rsvp-response-0.32.0.html");
pub const ADD_TO_CALENDAR_TEMPLATE: &str = include_str!("../templates/add-to-calendar-0.33.0.html");

/// Class names renamed in 0.33.0.
pub const CLASS_RENAMES: &[(&str, &str)] = &[
    ("gatherpress--open-modal", "gatherpress-modal--trigger-open"),
    ("gatherpress--close-modal", "gatherpress-modal--trigger-close"),
    ("gatherpress--is-rsvp-modal", "gatherpress-modal--rsvp"),
    ("gatherpress--is-login-modal", "gatherpress-modal--login"),
    ("gatherpress--is-not-visible", "gatherpress--is-hidden"),
    ("gatherpress-field-type-checkbox", "gatherpress-field--checkbox"),
    ("gatherpress-field-type-radio", "gatherpress-field--radio"),
    ("gatherpress-field-type-text", "gatherpress-field--text"),
    ("gatherpress-field-type-email", "gatherpress-field--email"),
    ("gatherpress-field-type-textarea", "gatherpress-field--textarea"),
    ("gatherpress-field-type-number", "gatherpress-field--number"),
    ("gatherpress-field-type-url", "gatherpress-field--url"),
    ("gatherpress-field-type-tel", "gatherpress-field--tel"),
    ("gatherpress-field-type-select", "gatherpress-field--select"),
    ("gatherpress-field-type-hidden", "gatherpress-field--hidden"),
    ("gatherpress--rsvp-attending", "gatherpress--is-attending"),
    ("gatherpress--rsvp-waiting-list", "gatherpress--is-waiting-list"),
    ("gatherpress--rsvp-not-attending", "gatherpress--is-not-attending"),
    ("gatherpress--empty-rsvp", "gatherpress--is-empty"),
    ("gatherpress--update-rsvp", "gatherpress--has-rsvp-update"),
];

static CLASS_MAP: LazyLock<HashMap<&'static str, &'static str>> =
    LazyLock::new(|| CLASS_RENAMES.iter().copied().collect());

/// `class="…"`, `class='…'` and their `className=` forms.
static HTML_CLASS_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?P<lead>\s)(?P<attr>class|className)=(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)')"#)
        .expect("class attribute pattern is valid")
});

/// `"className":"…"` inside block comment attributes.
static BLOCK_CLASS_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?P<key>"className"\s*:\s*)"(?P<value>(?:[^"\\]|\\.)*)""#)
        .expect("block className pattern is valid")
});

const EVENT_POST_TYPES: &[&str] = &["gatherpress_event"];
const CLASS_POST_TYPES: &[&str] = &["gatherpress_event", "page", "post", "wp_block"];

/// Rename whole tokens of a space-separated class list.
fn rename_tokens(list: &str, map: &HashMap<&str, &str>) -> String {
    list.split(' ')
        .map(|token| map.get(token).copied().unwrap_or(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Characters block serialization writes as unicode escapes inside comment
/// attributes, so the JSON can never close the HTML comment.
const BLOCK_JSON_ESCAPES: &[(&str, &str)] = &[
    ("\\\"", "\\u0022"),
    ("--", "\\u002d\\u002d"),
    ("<", "\\u003c"),
    (">", "\\u003e"),
    ("&", "\\u0026"),
];

/// Rename tokens of a JSON-escaped `className` value. Returns `None` when
/// nothing changed or the value does not decode.
fn rename_block_tokens(escaped: &str, map: &HashMap<&str, &str>) -> Option<String> {
    let decoded: String = serde_json::from_str(&format!("\"{escaped}\"")).ok()?;
    let renamed = rename_tokens(&decoded, map);
    if renamed == decoded {
        return None;
    }

    let encoded = serde_json::to_string(&renamed).ok()?;
    let mut value = encoded[1..encoded.len() - 1].to_string();
    for &(raw, escape) in BLOCK_JSON_ESCAPES {
        value = value.replace(raw, escape);
    }
    Some(value)
}

/// Rename class tokens inside every class list in `content`. Tokens that
/// merely contain an old name (e.g. `gatherpress--open-modal-x`) are kept.
pub fn rename_classes<'a>(content: &'a str, map: &HashMap<&str, &str>) -> Cow<'a, str> {
    let html = HTML_CLASS_ATTR.replace_all(content, |caps: &Captures| {
        let (quote, list) = match (caps.name("dq"), caps.name("sq")) {
            (Some(list), _) => ('"', list.as_str()),
            (None, Some(list)) => ('\'', list.as_str()),
            (None, None) => return caps[0].to_string(),
        };
        format!(
            "{}{}={quote}{}{quote}",
            &caps["lead"],
            &caps["attr"],
            rename_tokens(list, map)
        )
    });

    if let Cow::Owned(rewritten) = BLOCK_CLASS_ATTR.replace_all(&html, |caps: &Captures| {
        match rename_block_tokens(&caps["value"], map) {
            Some(value) => format!("{}\"{value}\"", &caps["key"]),
            None => caps[0].to_string(),
        }
    }) {
        return Cow::Owned(rewritten);
    }
    html
}

/// Replace each exact marker with its template.
pub fn expand_markers<'a>(content: &'a str, replacements: &[(&str, &str)]) -> Cow<'a, str> {
    let mut out = Cow::Borrowed(content);
    for &(marker, template) in replacements {
        if out.contains(marker) {
            out = Cow::Owned(out.replace(marker, template.trim_end()));
        }
    }
    out
}

/// Apply `rewrite` to the next batch of posts of the given types.
fn rewrite_posts<F>(
    store: &SiteStore,
    post_types: &[&str],
    after: i64,
    batch_size: usize,
    rewrite: F,
) -> Result<BatchProgress>
where
    F: for<'c> Fn(&'c str) -> Cow<'c, str>,
{
    let posts = store.table("posts");
    let placeholders = (0..post_types.len())
        .map(|i| format!("?{}", i + 3))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT ID, post_content FROM {posts}
         WHERE ID > ?1 AND post_type IN ({placeholders})
         ORDER BY ID LIMIT ?2"
    );
    let limit = batch_size as i64;

    let rows: Vec<(i64, String)> = store.with_connection("read post content", |conn| {
        let mut args: Vec<&dyn ToSql> = vec![&after, &limit];
        args.extend(post_types.iter().map(|t| t as &dyn ToSql));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    })?;

    let mut progress = BatchProgress {
        last_id: rows.last().map(|(id, _)| *id),
        scanned: rows.len(),
        ..Default::default()
    };

    for (id, content) in &rows {
        let Cow::Owned(updated) = rewrite(content.as_str()) else {
            continue;
        };
        if updated == *content {
            continue;
        }
        let written = store.with_connection("write post content", |conn| {
            conn.execute(
                &format!("UPDATE {posts} SET post_content = ?1 WHERE ID = ?2 AND post_content = ?3"),
                rusqlite::params![updated, id, content],
            )
        })?;
        if written == 1 {
            progress.updated += 1;
        } else {
            debug!("post {id} changed while being rewritten; leaving it");
            progress.skipped += 1;
        }
    }
    Ok(progress)
}

/// Expands self-closing block markers in event content into full templates.
pub struct BlockExpansion {
    name: &'static str,
    version: SchemaVersion,
    replacements: Vec<(&'static str, &'static str)>,
    batch_size: usize,
}

impl BlockExpansion {
    pub fn new(
        name: &'static str,
        version: SchemaVersion,
        replacements: Vec<(&'static str, &'static str)>,
        batch_size: usize,
    ) -> Self {
        Self {
            name,
            version,
            replacements,
            batch_size: batch_size.max(1),
        }
    }

    pub fn rsvp(version: SchemaVersion, batch_size: usize) -> Self {
        Self::new(
            "expand-rsvp-blocks",
            version,
            vec![
                ("<!-- wp:gatherpress/rsvp /-->", RSVP_TEMPLATE),
                ("<!-- wp:gatherpress/rsvp-response /-->", RSVP_RESPONSE_TEMPLATE),
            ],
            batch_size,
        )
    }

    pub fn add_to_calendar(version: SchemaVersion, batch_size: usize) -> Self {
        Self::new(
            "expand-add-to-calendar-block",
            version,
            vec![("<!-- wp:gatherpress/add-to-calendar /-->", ADD_TO_CALENDAR_TEMPLATE)],
            batch_size,
        )
    }
}

impl BatchStep for BlockExpansion {
    fn label(&self) -> &str {
        self.name
    }

    fn process_batch(&self, store: &SiteStore, after: i64) -> Result<BatchProgress> {
        rewrite_posts(store, EVENT_POST_TYPES, after, self.batch_size, |content| {
            expand_markers(content, &self.replacements)
        })
    }
}

impl Step<SiteStore> for BlockExpansion {
    fn name(&self) -> &str {
        self.name
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

/// Renames 0.33.0 CSS classes in events, pages, posts and reusable blocks.
pub struct ClassRename {
    version: SchemaVersion,
    batch_size: usize,
}

impl ClassRename {
    pub fn new(version: SchemaVersion, batch_size: usize) -> Self {
        Self {
            version,
            batch_size: batch_size.max(1),
        }
    }
}

impl BatchStep for ClassRename {
    fn label(&self) -> &str {
        "css class rename"
    }

    fn process_batch(&self, store: &SiteStore, after: i64) -> Result<BatchProgress> {
        rewrite_posts(store, CLASS_POST_TYPES, after, self.batch_size, |content| {
            rename_classes(content, &CLASS_MAP)
        })
    }
}

impl Step<SiteStore> for ClassRename {
    fn name(&self) -> &str {
        "rename-css-classes"
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
