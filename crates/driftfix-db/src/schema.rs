//! Table layout of a site database.
//!
//! Per-site tables carry the site prefix (`wp_`, `wp_2_`, ...); network
//! tables (`usermeta`, `blogs`) always use the base prefix.

use driftfix_common::{Error, Result};

/// Quote a table name for interpolation into SQL. Table names are built from
/// validated prefixes and fixed suffixes, never from request data.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A table prefix may only contain ASCII letters, digits and underscores.
pub fn check_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Database(format!("invalid table prefix: {prefix:?}")));
    }
    Ok(())
}

pub(crate) fn site_tables_sql(prefix: &str) -> String {
    let t = |name: &str| quote_ident(&format!("{prefix}{name}"));
    format!(
        "CREATE TABLE IF NOT EXISTS {posts} (
            ID INTEGER PRIMARY KEY AUTOINCREMENT,
            post_author INTEGER NOT NULL DEFAULT 0,
            post_date TEXT NOT NULL DEFAULT (datetime('now')),
            post_title TEXT NOT NULL DEFAULT '',
            post_content TEXT NOT NULL DEFAULT '',
            post_status TEXT NOT NULL DEFAULT 'publish',
            post_type TEXT NOT NULL DEFAULT 'post'
        );
        CREATE INDEX IF NOT EXISTS {posts_type_idx} ON {posts}(post_type, ID);

        CREATE TABLE IF NOT EXISTS {postmeta} (
            meta_id INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id INTEGER NOT NULL DEFAULT 0,
            meta_key TEXT,
            meta_value TEXT
        );
        CREATE INDEX IF NOT EXISTS {postmeta_key_idx} ON {postmeta}(meta_key, post_id);

        CREATE TABLE IF NOT EXISTS {options} (
            option_id INTEGER PRIMARY KEY AUTOINCREMENT,
            option_name TEXT NOT NULL UNIQUE,
            option_value TEXT NOT NULL DEFAULT '',
            autoload TEXT NOT NULL DEFAULT 'yes'
        );

        CREATE TABLE IF NOT EXISTS {term_taxonomy} (
            term_taxonomy_id INTEGER PRIMARY KEY AUTOINCREMENT,
            term_id INTEGER NOT NULL DEFAULT 0,
            taxonomy TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            parent INTEGER NOT NULL DEFAULT 0,
            count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS {comments} (
            comment_ID INTEGER PRIMARY KEY AUTOINCREMENT,
            comment_post_ID INTEGER NOT NULL DEFAULT 0,
            comment_author TEXT NOT NULL DEFAULT '',
            comment_date TEXT NOT NULL DEFAULT (datetime('now')),
            comment_date_gmt TEXT NOT NULL DEFAULT (datetime('now')),
            comment_content TEXT NOT NULL DEFAULT '',
            comment_approved TEXT NOT NULL DEFAULT '1',
            comment_type TEXT NOT NULL DEFAULT 'comment',
            user_id INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS {commentmeta} (
            meta_id INTEGER PRIMARY KEY AUTOINCREMENT,
            comment_id INTEGER NOT NULL DEFAULT 0,
            meta_key TEXT,
            meta_value TEXT
        );",
        posts = t("posts"),
        posts_type_idx = quote_ident(&format!("{prefix}posts_type_idx")),
        postmeta = t("postmeta"),
        postmeta_key_idx = quote_ident(&format!("{prefix}postmeta_key_idx")),
        options = t("options"),
        term_taxonomy = t("term_taxonomy"),
        comments = t("comments"),
        commentmeta = t("commentmeta"),
    )
}

pub(crate) fn network_tables_sql(base_prefix: &str) -> String {
    let t = |name: &str| quote_ident(&format!("{base_prefix}{name}"));
    format!(
        "CREATE TABLE IF NOT EXISTS {usermeta} (
            umeta_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL DEFAULT 0,
            meta_key TEXT,
            meta_value TEXT
        );

        CREATE TABLE IF NOT EXISTS {blogs} (
            blog_id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain TEXT NOT NULL DEFAULT '',
            path TEXT NOT NULL DEFAULT '/',
            deleted INTEGER NOT NULL DEFAULT 0
        );",
        usermeta = t("usermeta"),
        blogs = t("blogs"),
    )
}
