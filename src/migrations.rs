//! 数据库版本管理
//!
//! `schema_migrations` 记录已应用的版本。版本 1 是基线 schema，
//! 之后的结构变更按版本号追加到 `MIGRATIONS`。

use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use tracing::info;

use crate::schema;

/// 按版本号排列的迁移
const MIGRATIONS: &[(i64, &str, fn(&Connection) -> SqliteResult<()>)] =
    &[(1, "baseline schema", apply_baseline)];

/// 当前 schema 版本
pub const SCHEMA_VERSION: i64 = 1;

fn apply_baseline(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(&schema::full_schema())
}

/// 已应用的最高版本，空库为 0
pub fn current_version(conn: &Connection) -> SqliteResult<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

/// 执行所有待应用的迁移（单事务）
pub fn run_migrations(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current = current_version(conn)?;
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    for (version, name, apply) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        info!("Applying migration {}: {}", version, name);
        apply(&tx)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            [*version, crate::types::now_ms()],
        )?;
    }
    tx.commit()?;

    info!("Database schema at version {}", SCHEMA_VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn).unwrap_or(0), 0);

        run_migrations(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('sessions', 'conversation_events', 'approvals')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
