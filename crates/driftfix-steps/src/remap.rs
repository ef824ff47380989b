//! Renames of tables, slugs, meta keys and options.
//!
//! Every operation matches on the old name only, so a second pass finds
//! nothing left to change.

use driftfix_common::Result;
use driftfix_db::SiteStore;
use driftfix_db::site_store::OptionRename;
use driftfix_migrate::{SchemaVersion, Step};
use rusqlite::params;
use tracing::{debug, info, warn};

/// A single rename or removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemapOp {
    Table { from: &'static str, to: &'static str },
    PostType { from: &'static str, to: &'static str },
    PostMetaKey { from: &'static str, to: &'static str },
    Taxonomy { from: &'static str, to: &'static str },
    UserMetaKey { from: &'static str, to: &'static str },
    /// Rename every option starting with `from` to start with `to`.
    OptionPrefix { from: &'static str, to: &'static str },
    Option { from: &'static str, to: &'static str },
    DeleteOption(&'static str),
}

/// A transactional step made of an ordered list of [`RemapOp`]s.
pub struct RemapStep {
    name: &'static str,
    version: SchemaVersion,
    ops: Vec<RemapOp>,
}

impl RemapStep {
    pub fn new(name: &'static str, version: SchemaVersion, ops: Vec<RemapOp>) -> Self {
        Self { name, version, ops }
    }

    pub fn ops(&self) -> &[RemapOp] {
        &self.ops
    }
}

impl Step<SiteStore> for RemapStep {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &SchemaVersion {
        &self.version
    }

    fn apply(&self, store: &SiteStore) -> Result<()> {
        for op in &self.ops {
            let changed = apply_op(store, op)?;
            if changed > 0 {
                info!("{:?}: {} rows changed in scope {}", op, changed, store.scope().id);
            } else {
                debug!("{:?}: nothing to change in scope {}", op, store.scope().id);
            }
        }
        Ok(())
    }
}

fn apply_op(store: &SiteStore, op: &RemapOp) -> Result<usize> {
    match *op {
        RemapOp::Table { from, to } => store.rename_table(from, to).map(usize::from),
        RemapOp::PostType { from, to } => {
            let sql = format!(
                "UPDATE {} SET post_type = ?1 WHERE post_type = ?2",
                store.table("posts")
            );
            store.with_connection("remap post type", |conn| conn.execute(&sql, params![to, from]))
        }
        RemapOp::Taxonomy { from, to } => {
            let sql = format!(
                "UPDATE {} SET taxonomy = ?1 WHERE taxonomy = ?2",
                store.table("term_taxonomy")
            );
            store.with_connection("remap taxonomy", |conn| conn.execute(&sql, params![to, from]))
        }
        RemapOp::PostMetaKey { from, to } => {
            rename_meta_key(store, &store.table("postmeta"), "post_id", from, to)
        }
        RemapOp::UserMetaKey { from, to } => {
            rename_meta_key(store, &store.global_table("usermeta"), "user_id", from, to)
        }
        RemapOp::OptionPrefix { from, to } => rename_option_prefix(store, from, to),
        RemapOp::Option { from, to } => rename_option(store, from, to).map(usize::from),
        RemapOp::DeleteOption(name) => store.delete_option(name).map(usize::from),
    }
}

/// Rename a meta key, except for owners that already carry the new key.
fn rename_meta_key(
    store: &SiteStore,
    table: &str,
    owner: &str,
    from: &str,
    to: &str,
) -> Result<usize> {
    let sql = format!(
        "UPDATE {table} SET meta_key = ?1
         WHERE meta_key = ?2
           AND {owner} NOT IN (SELECT {owner} FROM {table} WHERE meta_key = ?1)"
    );
    store.with_connection("rename meta key", |conn| conn.execute(&sql, params![to, from]))
}

fn rename_option(store: &SiteStore, from: &str, to: &str) -> Result<bool> {
    match store.rename_option(from, to)? {
        OptionRename::Renamed => Ok(true),
        OptionRename::Missing => Ok(false),
        OptionRename::TargetExists => {
            warn!(
                "option {to} already exists in scope {}; keeping {from} as is",
                store.scope().id
            );
            Ok(false)
        }
    }
}

fn rename_option_prefix(store: &SiteStore, from: &str, to: &str) -> Result<usize> {
    let sql = format!(
        "SELECT option_name FROM {} WHERE substr(option_name, 1, ?1) = ?2 ORDER BY option_id",
        store.table("options")
    );
    let names: Vec<String> = store.with_connection("list prefixed options", |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![from.len() as i64, from], |row| row.get(0))?;
        rows.collect()
    })?;

    let mut renamed = 0;
    for name in names {
        let target = format!("{to}{}", &name[from.len()..]);
        if rename_option(store, &name, &target)? {
            renamed += 1;
        }
    }
    Ok(renamed)
}
