//! SQLite provider. Simple, synchronous, one connection behind a mutex.

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use tracing::debug;
use unistore_core::{KeyPattern, ResourceKey, Version, WatchEventType};

use crate::{check_expected, maybe_compress, maybe_decompress, now_ts, Commit, Mutation, MutationKind, Provider, ProviderOptions, Row};

const ROW_COLUMNS: &str = "h.grp, h.resource, h.namespace, h.name, h.rv, h.action, h.ts, h.value";

pub struct SqliteProvider {
    db: Mutex<rusqlite::Connection>,
    opts: ProviderOptions,
}

impl SqliteProvider {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("UNISTORE_DB_PATH").unwrap_or_else(|_| crate::default_db_path());
        Self::open(&path, ProviderOptions::from_env())
    }

    pub fn open(path: &str, opts: ProviderOptions) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        let me = Self { db: Mutex::new(db), opts };
        me.init()?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory(opts: ProviderOptions) -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        let me = Self { db: Mutex::new(db), opts };
        me.init()?;
        Ok(me)
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }
}

fn action_code(a: WatchEventType) -> i64 {
    match a {
        WatchEventType::Added => 1,
        WatchEventType::Modified => 2,
        WatchEventType::Deleted => 3,
    }
}

fn action_from(code: i64) -> rusqlite::Result<WatchEventType> {
    match code {
        1 => Ok(WatchEventType::Added),
        2 => Ok(WatchEventType::Modified),
        3 => Ok(WatchEventType::Deleted),
        other => Err(rusqlite::Error::IntegralValueOutOfRange(5, other)),
    }
}

fn read_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok(Row {
        key: ResourceKey {
            group: r.get(0)?,
            resource: r.get(1)?,
            namespace: r.get(2)?,
            name: r.get(3)?,
        },
        resource_version: r.get(4)?,
        action: action_from(r.get(5)?)?,
        ts: r.get(6)?,
        value: maybe_decompress(r.get(7)?),
    })
}

fn key_args(key: &ResourceKey) -> [Value; 4] {
    [
        Value::Text(key.group.clone()),
        Value::Text(key.resource.clone()),
        Value::Text(key.namespace.clone()),
        Value::Text(key.name.clone()),
    ]
}

/// Append `AND col = ?` for every bound pattern segment.
fn push_pattern(sql: &mut String, args: &mut Vec<Value>, pattern: &KeyPattern, alias: &str) {
    let segs = [
        ("grp", &pattern.group),
        ("resource", &pattern.resource),
        ("namespace", &pattern.namespace),
        ("name", &pattern.name),
    ];
    for (col, seg) in segs {
        if let Some(v) = seg {
            sql.push_str(&format!(" AND {}{} = ?", alias, col));
            args.push(Value::Text(v.clone()));
        }
    }
}

impl Provider for SqliteProvider {
    fn init(&self) -> Result<()> {
        let db = self.lock()?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS resource_history (
                rv        INTEGER PRIMARY KEY,
                grp       TEXT NOT NULL,
                resource  TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                action    INTEGER NOT NULL,
                ts        INTEGER NOT NULL,
                value     BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_key ON resource_history(grp, resource, namespace, name, rv);
            CREATE TABLE IF NOT EXISTS resource (
                grp       TEXT NOT NULL,
                resource  TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                rv        INTEGER NOT NULL,
                PRIMARY KEY (grp, resource, namespace, name)
            );",
        )
        .context("creating resource tables")?;
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        let db = self.lock()?;
        db.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)).context("pinging sqlite")?;
        Ok(())
    }

    fn current_version(&self) -> Result<Version> {
        let db = self.lock()?;
        let rv = db.query_row("SELECT COALESCE(MAX(rv), 0) FROM resource_history", [], |r| r.get(0))?;
        Ok(rv)
    }

    fn latest(&self, key: &ResourceKey) -> Result<Option<Row>> {
        let db = self.lock()?;
        let sql = format!(
            "SELECT {} FROM resource r JOIN resource_history h ON h.rv = r.rv
             WHERE r.grp = ?1 AND r.resource = ?2 AND r.namespace = ?3 AND r.name = ?4",
            ROW_COLUMNS
        );
        let row = db.query_row(&sql, rusqlite::params_from_iter(key_args(key)), read_row).optional()?;
        Ok(row)
    }

    fn version(&self, key: &ResourceKey, rv: Version) -> Result<Option<Row>> {
        let db = self.lock()?;
        let sql = format!(
            "SELECT {} FROM resource_history h
             WHERE h.grp = ?1 AND h.resource = ?2 AND h.namespace = ?3 AND h.name = ?4 AND h.rv = ?5",
            ROW_COLUMNS
        );
        let mut args = key_args(key).to_vec();
        args.push(Value::Integer(rv));
        let row = db.query_row(&sql, rusqlite::params_from_iter(args), read_row).optional()?;
        Ok(row)
    }

    fn history(&self, key: &ResourceKey) -> Result<Vec<Row>> {
        let started = std::time::Instant::now();
        let db = self.lock()?;
        let sql = format!(
            "SELECT {} FROM resource_history h
             WHERE h.grp = ?1 AND h.resource = ?2 AND h.namespace = ?3 AND h.name = ?4
             ORDER BY h.rv ASC",
            ROW_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(key_args(key)), read_row)?
            .collect::<rusqlite::Result<Vec<Row>>>()?;
        histogram!("persist_history_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(rows)
    }

    fn list(&self, pattern: &KeyPattern, start_after: Option<&ResourceKey>, limit: usize) -> Result<Vec<Row>> {
        let started = std::time::Instant::now();
        let db = self.lock()?;
        let mut sql = format!("SELECT {} FROM resource r JOIN resource_history h ON h.rv = r.rv WHERE 1 = 1", ROW_COLUMNS);
        let mut args: Vec<Value> = Vec::new();
        push_pattern(&mut sql, &mut args, pattern, "r.");
        if let Some(k) = start_after {
            sql.push_str(" AND (r.grp, r.resource, r.namespace, r.name) > (?, ?, ?, ?)");
            args.extend(key_args(k));
        }
        sql.push_str(" ORDER BY r.grp, r.resource, r.namespace, r.name LIMIT ?");
        args.push(Value::Integer(limit as i64));
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), read_row)?
            .collect::<rusqlite::Result<Vec<Row>>>()
            .context("listing resources")?;
        histogram!("persist_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(rows)
    }

    fn changes_since(&self, since: Version, pattern: &KeyPattern, limit: usize) -> Result<Vec<Row>> {
        let db = self.lock()?;
        let mut sql = format!("SELECT {} FROM resource_history h WHERE h.rv > ?", ROW_COLUMNS);
        let mut args: Vec<Value> = vec![Value::Integer(since)];
        push_pattern(&mut sql, &mut args, pattern, "h.");
        sql.push_str(" ORDER BY h.rv ASC LIMIT ?");
        args.push(Value::Integer(limit as i64));
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), read_row)?
            .collect::<rusqlite::Result<Vec<Row>>>()
            .context("reading change log")?;
        Ok(rows)
    }

    fn commit(&self, m: &Mutation) -> Result<Commit> {
        let started = std::time::Instant::now();
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let live: Option<Version> = tx
            .query_row(
                "SELECT rv FROM resource WHERE grp = ?1 AND resource = ?2 AND namespace = ?3 AND name = ?4",
                rusqlite::params_from_iter(key_args(&m.key)),
                |r| r.get(0),
            )
            .optional()?;
        // Dropping `tx` on early return rolls back.
        if let Some(conflict) = check_expected(m.expected, live) {
            return Ok(conflict);
        }
        let (action, value) = match &m.kind {
            MutationKind::Upsert(v) => {
                let action = if live.is_some() { WatchEventType::Modified } else { WatchEventType::Added };
                (action, v.clone())
            }
            MutationKind::Delete => {
                let Some(rv) = live else { return Ok(Commit::Missing) };
                let last: Vec<u8> = tx.query_row("SELECT value FROM resource_history WHERE rv = ?1", [rv], |r| r.get(0))?;
                (WatchEventType::Deleted, maybe_decompress(last))
            }
        };
        let rv: Version = tx.query_row("SELECT COALESCE(MAX(rv), 0) + 1 FROM resource_history", [], |r| r.get(0))?;
        let ts = now_ts();
        tx.execute(
            "INSERT INTO resource_history(rv, grp, resource, namespace, name, action, ts, value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            (
                rv,
                &m.key.group,
                &m.key.resource,
                &m.key.namespace,
                &m.key.name,
                action_code(action),
                ts,
                maybe_compress(&value),
            ),
        )?;
        if action == WatchEventType::Deleted {
            tx.execute(
                "DELETE FROM resource WHERE grp = ?1 AND resource = ?2 AND namespace = ?3 AND name = ?4",
                rusqlite::params_from_iter(key_args(&m.key)),
            )?;
        } else {
            tx.execute(
                "INSERT INTO resource(grp, resource, namespace, name, rv) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(grp, resource, namespace, name) DO UPDATE SET rv = excluded.rv",
                (&m.key.group, &m.key.resource, &m.key.namespace, &m.key.name, rv),
            )?;
        }
        if let Some(keep) = self.opts.history_limit {
            // Keep newest N by rv per key; the live row is always among them.
            let pruned = tx.execute(
                "DELETE FROM resource_history
                 WHERE grp = ?1 AND resource = ?2 AND namespace = ?3 AND name = ?4
                   AND rv NOT IN (
                       SELECT rv FROM resource_history
                       WHERE grp = ?1 AND resource = ?2 AND namespace = ?3 AND name = ?4
                       ORDER BY rv DESC LIMIT ?5
                   )",
                (&m.key.group, &m.key.resource, &m.key.namespace, &m.key.name, keep.max(1) as i64),
            )?;
            if pruned > 0 {
                debug!(key = %m.key, pruned, "history retention pruned rows");
            }
        }
        tx.commit().context("committing resource mutation")?;
        histogram!("persist_commit_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_commit_total", 1u64);
        Ok(Commit::Applied(Row { key: m.key.clone(), resource_version: rv, action, ts, value }))
    }
}
