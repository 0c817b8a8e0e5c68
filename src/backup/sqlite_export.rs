// db-stream-backup/src/backup/sqlite_export.rs
use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportStats {
    pub tables: usize,
    pub rows: u64,
}

struct SchemaEntry {
    kind: String,
    name: String,
    sql: String,
}

/// Writes a logical SQL script that recreates the database at `path`.
///
/// The whole export runs inside one read transaction, so it is a consistent
/// snapshot even while other connections keep writing.
pub fn export_database<W: Write>(path: &Path, out: &mut W) -> Result<ExportStats> {
    let mut conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Deferred)
        .context("Failed to start read transaction")?;

    let schema = read_schema(&tx)?;
    let mut stats = ExportStats::default();

    writeln!(out, "PRAGMA foreign_keys=OFF;")?;
    writeln!(out, "BEGIN TRANSACTION;")?;

    let mut has_sequence = false;
    for entry in schema.iter().filter(|e| e.kind == "table") {
        if entry.name == "sqlite_sequence" {
            has_sequence = true;
            continue;
        }
        if entry.name.starts_with("sqlite_") {
            continue;
        }
        writeln!(out, "{};", entry.sql)?;
        stats.tables += 1;
        // Virtual table content lives in its shadow tables.
        if entry.sql.to_ascii_uppercase().starts_with("CREATE VIRTUAL TABLE") {
            continue;
        }
        stats.rows += export_rows(&tx, &entry.name, out)?;
    }

    if has_sequence {
        writeln!(out, "DELETE FROM sqlite_sequence;")?;
        stats.rows += export_rows(&tx, "sqlite_sequence", out)?;
    }

    for kind in ["index", "trigger", "view"] {
        for entry in schema.iter().filter(|e| e.kind == kind) {
            writeln!(out, "{};", entry.sql)?;
        }
    }
    writeln!(out, "COMMIT;")?;
    out.flush()?;
    Ok(stats)
}

fn read_schema(conn: &Connection) -> Result<Vec<SchemaEntry>> {
    let mut stmt = conn
        .prepare("SELECT type, name, sql FROM sqlite_master WHERE sql IS NOT NULL ORDER BY rowid")
        .context("Failed to read sqlite_master")?;
    let entries = stmt
        .query_map([], |row| {
            Ok(SchemaEntry {
                kind: row.get(0)?,
                name: row.get(1)?,
                sql: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read sqlite_master")?;
    Ok(entries)
}

/// Columns a restore can insert into: generated and hidden columns are
/// computed by SQLite and must not be supplied.
fn insertable_columns(conn: &Connection, ident: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_xinfo({})", ident))
        .with_context(|| format!("Failed to read columns of {}", ident))?;
    let columns = stmt
        .query_map([], |row| Ok((row.get::<_, String>("name")?, row.get::<_, i64>("hidden")?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .filter(|(_, hidden)| *hidden == 0)
        .map(|(name, _)| quote_identifier(&name))
        .collect();
    Ok(columns)
}

fn export_rows<W: Write>(conn: &Connection, table: &str, out: &mut W) -> Result<u64> {
    let ident = quote_identifier(table);
    let columns = insertable_columns(conn, &ident)?;
    if columns.is_empty() {
        return Ok(0);
    }
    let column_list = columns.join(",");
    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM {}", column_list, ident))
        .with_context(|| format!("Failed to read table {}", table))?;
    let mut rows = stmt.query([])?;
    let mut count = 0u64;
    let mut line = String::new();

    while let Some(row) = rows.next()? {
        line.clear();
        let _ = write!(line, "INSERT INTO {}({}) VALUES(", ident, column_list);
        for i in 0..columns.len() {
            if i > 0 {
                line.push(',');
            }
            push_value(&mut line, row.get_ref(i)?);
        }
        line.push_str(");\n");
        out.write_all(line.as_bytes())?;
        count += 1;
    }
    Ok(count)
}

fn push_value(line: &mut String, value: ValueRef<'_>) {
    match value {
        ValueRef::Null => line.push_str("NULL"),
        ValueRef::Integer(i) => {
            let _ = write!(line, "{}", i);
        }
        ValueRef::Real(f) if f.is_nan() => line.push_str("NULL"),
        ValueRef::Real(f) if f.is_infinite() => line.push_str(if f > 0.0 { "1e999" } else { "-1e999" }),
        ValueRef::Real(f) => {
            let _ = write!(line, "{:?}", f);
        }
        ValueRef::Text(t) => match std::str::from_utf8(t) {
            Ok(text) => {
                line.push('\'');
                line.push_str(&text.replace('\'', "''"));
                line.push('\'');
            }
            // Keep the stored bytes exactly, even when they are not UTF-8.
            Err(_) => {
                let _ = write!(line, "CAST(X'{}' AS TEXT)", hex::encode(t));
            }
        },
        ValueRef::Blob(b) => {
            line.push_str("X'");
            line.push_str(&hex::encode(b));
            line.push('\'');
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_db(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("test.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, score REAL, avatar BLOB);
             CREATE INDEX users_name ON users(name);
             CREATE VIEW high_scores AS SELECT name FROM users WHERE score > 10;
             INSERT INTO users (name, score, avatar) VALUES ('O''Brien', 12.5, X'00FF');
             INSERT INTO users (name, score, avatar) VALUES ('plain', NULL, NULL);
             CREATE TABLE \"odd \"\"name\"\"\" (v INTEGER);
             INSERT INTO \"odd \"\"name\"\"\" VALUES (7);",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_export_produces_restorable_script() {
        let dir = TempDir::new().unwrap();
        let path = sample_db(&dir);

        let mut script = Vec::new();
        let stats = export_database(&path, &mut script).unwrap();
        assert_eq!(stats.tables, 2);
        // Three data rows plus the sqlite_sequence entry.
        assert_eq!(stats.rows, 4);

        let script = String::from_utf8(script).unwrap();
        assert!(script.contains(
            "INSERT INTO \"users\"(\"id\",\"name\",\"score\",\"avatar\") VALUES(1,'O''Brien',12.5,X'00ff');"
        ));
        assert!(script.contains(
            "INSERT INTO \"users\"(\"id\",\"name\",\"score\",\"avatar\") VALUES(2,'plain',NULL,NULL);"
        ));
        assert!(script.ends_with("COMMIT;\n"));

        let restored = Connection::open_in_memory().unwrap();
        restored.execute_batch(&script).unwrap();
        let name: String = restored
            .query_row("SELECT name FROM high_scores", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "O'Brien");
        let seq: i64 = restored
            .query_row("SELECT seq FROM sqlite_sequence WHERE name = 'users'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(seq, 2);
        let odd: i64 = restored
            .query_row("SELECT v FROM \"odd \"\"name\"\"\"", [], |r| r.get(0))
            .unwrap();
        assert_eq!(odd, 7);
    }

    #[test]
    fn test_special_reals() {
        let mut line = String::new();
        push_value(&mut line, ValueRef::Real(f64::INFINITY));
        line.push(' ');
        push_value(&mut line, ValueRef::Real(1.0));
        assert_eq!(line, "1e999 1.0");
    }

    fn export_and_restore(path: &Path) -> Connection {
        let mut script = Vec::new();
        export_database(path, &mut script).unwrap();
        let restored = Connection::open_in_memory().unwrap();
        restored.execute_batch(&String::from_utf8(script).unwrap()).unwrap();
        restored
    }

    #[test]
    fn test_invalid_utf8_text_keeps_its_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bytes.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (v TEXT);
             INSERT INTO t VALUES (CAST(X'41FF42' AS TEXT));
             INSERT INTO t VALUES ('ok');",
        )
        .unwrap();
        drop(conn);

        let restored = export_and_restore(&path);
        let (kind, bytes): (String, Vec<u8>) = restored
            .query_row("SELECT typeof(v), CAST(v AS BLOB) FROM t WHERE rowid = 1", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(kind, "text");
        assert_eq!(bytes, vec![0x41, 0xFF, 0x42]);
        let plain: String = restored
            .query_row("SELECT v FROM t WHERE rowid = 2", [], |r| r.get(0))
            .unwrap();
        assert_eq!(plain, "ok");
    }

    #[test]
    fn test_generated_columns_are_not_inserted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("generated.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE g (a INTEGER, b INTEGER GENERATED ALWAYS AS (a * 2) VIRTUAL,
                             c INTEGER GENERATED ALWAYS AS (a + 1) STORED);
             INSERT INTO g (a) VALUES (3);",
        )
        .unwrap();
        drop(conn);

        let mut script = Vec::new();
        export_database(&path, &mut script).unwrap();
        let script = String::from_utf8(script).unwrap();
        assert!(script.contains("INSERT INTO \"g\"(\"a\") VALUES(3);"), "{script}");

        let restored = export_and_restore(&path);
        let (a, b, c): (i64, i64, i64) = restored
            .query_row("SELECT a, b, c FROM g", [], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap();
        assert_eq!((a, b, c), (3, 6, 4));
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let mut out = Vec::new();
        assert!(export_database(&dir.path().join("absent.db"), &mut out).is_err());
    }
}
