//! 路线历史库的 schema 生命周期
//!
//! - 迁移脚本在 migrations/ 下（V{n}__{name}.sql），编译期由 refinery 嵌入
//! - 打开顺序：读现有版本 → 拒绝比 SDK 新的库 → pragma → 迁移 → 核对路线表
//! - 版本比 SDK 新时不执行任何迁移，库保持原样

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

use rusqlite::Connection;
use tracing::info;

use crate::error::{FieldOpsError, Result};
use crate::version::SDK_DB_VERSION;

const HISTORY_TABLE: &str = "refinery_schema_history";

/// ETA 读写依赖的表
pub const ROUTE_TABLES: [&str; 2] = ["route_history", "route_stop"];

/// 打开后路线库所处的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaState {
    /// 新库，建到 `version`
    Created { version: i64 },
    /// 从 `from` 迁移到 `to`
    Upgraded { from: i64, to: i64 },
    /// 无需迁移
    Current { version: i64 },
}

impl SchemaState {
    pub fn version(&self) -> i64 {
        match *self {
            SchemaState::Created { version } | SchemaState::Current { version } => version,
            SchemaState::Upgraded { to, .. } => to,
        }
    }
}

/// 打开路线库：版本检查、迁移、建表核对
pub fn prepare_route_db(conn: &mut Connection) -> Result<SchemaState> {
    let before = schema_version(conn)?;
    if let Some(v) = before {
        if v > SDK_DB_VERSION {
            return Err(FieldOpsError::Database(format!(
                "路线库版本 {} 高于 SDK 支持的 {}，请升级 SDK",
                v, SDK_DB_VERSION
            )));
        }
    }

    // route_stop 依赖外键级联删除
    conn.pragma_update(None, "foreign_keys", true)
        .and_then(|_| conn.pragma_update(None, "synchronous", "NORMAL"))
        .map_err(|e| FieldOpsError::Database(format!("设置 PRAGMA 失败: {}", e)))?;
    // 内存库返回 "memory"，不影响
    let _: String = conn
        .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
        .map_err(|e| FieldOpsError::Database(format!("设置 journal_mode 失败: {}", e)))?;

    embedded::migrations::runner()
        .run(conn)
        .map_err(|e| FieldOpsError::Database(format!("路线库迁移失败: {}", e)))?;

    let after = schema_version(conn)?.unwrap_or(0);
    if let Some(missing) = missing_route_table(conn)? {
        return Err(FieldOpsError::Database(format!(
            "路线库缺少表 {} (schema 版本 {})",
            missing, after
        )));
    }

    let state = match before {
        None => SchemaState::Created { version: after },
        Some(from) if from < after => SchemaState::Upgraded { from, to: after },
        Some(version) => SchemaState::Current { version },
    };
    if !matches!(state, SchemaState::Current { .. }) {
        info!("路线库 schema: {:?}", state);
    }
    Ok(state)
}

/// 已应用的最高迁移版本；从未迁移过返回 None
fn schema_version(conn: &Connection) -> Result<Option<i64>> {
    if !table_exists(conn, HISTORY_TABLE)? {
        return Ok(None);
    }
    let version: Option<i64> = conn
        .query_row(&format!("SELECT MAX(version) FROM {}", HISTORY_TABLE), [], |row| row.get(0))
        .map_err(|e| FieldOpsError::Database(format!("读取路线库版本失败: {}", e)))?;
    Ok(version.filter(|&v| v > 0))
}

fn missing_route_table(conn: &Connection) -> Result<Option<&'static str>> {
    for table in ROUTE_TABLES {
        if !table_exists(conn, table)? {
            return Ok(Some(table));
        }
    }
    Ok(None)
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
        [name],
        |row| row.get(0),
    )
    .map_err(|e| FieldOpsError::Database(format!("查询表 {} 失败: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp_version(conn: &Connection, version: i64) {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (version INTEGER PRIMARY KEY, name TEXT, applied_on TEXT, checksum TEXT)",
                HISTORY_TABLE
            ),
            [],
        )
        .unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {} (version, name, applied_on, checksum) VALUES (?1, 'later', '', '0')",
                HISTORY_TABLE
            ),
            [version],
        )
        .unwrap();
    }

    #[test]
    fn test_fresh_db_gets_route_tables_at_sdk_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        let state = prepare_route_db(&mut conn).unwrap();

        assert_eq!(state, SchemaState::Created { version: SDK_DB_VERSION });
        for table in ROUTE_TABLES {
            assert!(table_exists(&conn, table).unwrap(), "missing {}", table);
        }
        let fk: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0)).unwrap();
        assert!(fk);
    }

    #[test]
    fn test_reopen_is_current_and_keeps_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        prepare_route_db(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO route_history (route_key, started_at, completed_at, created_at) VALUES ('r', 0, 1, 1)",
            [],
        )
        .unwrap();

        let state = prepare_route_db(&mut conn).unwrap();
        assert_eq!(state, SchemaState::Current { version: SDK_DB_VERSION });
        assert_eq!(state.version(), SDK_DB_VERSION);
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM route_history", [], |row| row.get(0)).unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_newer_db_is_rejected_before_migrating() {
        let mut conn = Connection::open_in_memory().unwrap();
        stamp_version(&conn, SDK_DB_VERSION + 1);

        assert!(matches!(prepare_route_db(&mut conn), Err(FieldOpsError::Database(_))));
        // 没有执行任何迁移
        for table in ROUTE_TABLES {
            assert!(!table_exists(&conn, table).unwrap());
        }
    }

    #[test]
    fn test_dropped_route_table_is_reported() {
        let mut conn = Connection::open_in_memory().unwrap();
        prepare_route_db(&mut conn).unwrap();
        conn.execute_batch("DROP TABLE route_stop").unwrap();

        match prepare_route_db(&mut conn) {
            Err(FieldOpsError::Database(msg)) => assert!(msg.contains("route_stop"), "{}", msg),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
