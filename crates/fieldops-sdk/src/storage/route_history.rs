//! 已完成路线归档（SQLite），ETA 模型从这里读取历史

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{FieldOpsError, Result};
use crate::location::LocationSample;
use crate::storage::migrate;

/// 单个停靠点的到达 / 作业完成时间
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTiming {
    pub reached_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl StopTiming {
    pub fn new(reached_at: i64, completed_at: i64) -> Self {
        Self {
            reached_at: Some(reached_at),
            completed_at: Some(completed_at),
        }
    }

    /// 停靠作业时长（毫秒），缺失或为负时返回 None
    pub fn dwell_ms(&self) -> Option<i64> {
        match (self.reached_at, self.completed_at) {
            (Some(reached), Some(done)) if done >= reached => Some(done - reached),
            _ => None,
        }
    }
}

/// 一条已完成的路线
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteHistoryEntry {
    pub stops: Vec<LocationSample>,
    pub started_at: i64,
    pub completed_at: i64,
    /// 与 stops 一一对应，可比 stops 短
    #[serde(default)]
    pub per_stop: Vec<StopTiming>,
}

impl RouteHistoryEntry {
    pub fn timing(&self, index: usize) -> StopTiming {
        self.per_stop.get(index).copied().unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct RouteHistoryStore {
    conn: Mutex<Connection>,
}

impl RouteHistoryStore {
    /// 打开 `<data_dir>/routes.db` 并执行迁移
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("routes.db");
        let mut conn = Connection::open(&path)?;
        let schema = migrate::prepare_route_db(&mut conn)?;
        info!("路线历史库已打开: {} (schema v{})", path.display(), schema.version());
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate::prepare_route_db(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// 归档一条路线；同一 route_key 重复写入会覆盖旧记录
    pub fn insert(&self, route_key: &str, entry: &RouteHistoryEntry, now_ms: i64) -> Result<()> {
        if entry.completed_at < entry.started_at {
            return Err(FieldOpsError::Validation(format!(
                "路线 {} 完成时间早于开始时间",
                route_key
            )));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM route_history WHERE route_key = ?1", params![route_key])?;
        tx.execute(
            "INSERT INTO route_history (route_key, started_at, completed_at, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![route_key, entry.started_at, entry.completed_at, now_ms],
        )?;
        let route_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO route_stop (route_id, seq, latitude, longitude, accuracy, speed, heading, timestamp, reached_at, stop_done_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for (seq, stop) in entry.stops.iter().enumerate() {
                let timing = entry.timing(seq);
                stmt.execute(params![
                    route_id,
                    seq as i64,
                    stop.latitude,
                    stop.longitude,
                    stop.accuracy,
                    stop.speed,
                    stop.heading,
                    stop.timestamp,
                    timing.reached_at,
                    timing.completed_at,
                ])?;
            }
        }
        tx.commit()?;

        debug!("路线已归档: key={} stops={}", route_key, entry.stops.len());
        Ok(())
    }

    /// 最近完成的 `limit` 条路线，按完成时间倒序
    pub fn list_recent(&self, limit: usize) -> Result<Vec<RouteHistoryEntry>> {
        let conn = self.conn.lock();
        let mut routes_stmt = conn.prepare(
            "SELECT id, started_at, completed_at FROM route_history ORDER BY completed_at DESC, id DESC LIMIT ?1",
        )?;
        let routes = routes_stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stops_stmt = conn.prepare(
            "SELECT latitude, longitude, accuracy, speed, heading, timestamp, reached_at, stop_done_at
             FROM route_stop WHERE route_id = ?1 ORDER BY seq ASC",
        )?;

        let mut entries = Vec::with_capacity(routes.len());
        for (route_id, started_at, completed_at) in routes {
            let rows = stops_stmt
                .query_map(params![route_id], |row| {
                    let sample = LocationSample {
                        latitude: row.get(0)?,
                        longitude: row.get(1)?,
                        accuracy: row.get(2)?,
                        speed: row.get(3)?,
                        heading: row.get(4)?,
                        timestamp: row.get(5)?,
                    };
                    let timing = StopTiming {
                        reached_at: row.get(6)?,
                        completed_at: row.get(7)?,
                    };
                    Ok((sample, timing))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let (stops, per_stop) = rows.into_iter().unzip();
            entries.push(RouteHistoryEntry {
                stops,
                started_at,
                completed_at,
                per_stop,
            });
        }
        Ok(entries)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: Option<i64> = conn
            .query_row("SELECT COUNT(*) FROM route_history", [], |row| row.get(0))
            .optional()?;
        Ok(count.unwrap_or(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(started_at: i64, completed_at: i64) -> RouteHistoryEntry {
        RouteHistoryEntry {
            stops: vec![
                LocationSample::new(28.7041, 77.1025, 5.0, started_at),
                LocationSample::new(28.7141, 77.1125, 5.0, completed_at),
            ],
            started_at,
            completed_at,
            per_stop: vec![
                StopTiming::new(started_at, started_at + 60_000),
                StopTiming {
                    reached_at: Some(completed_at - 60_000),
                    completed_at: None,
                },
            ],
        }
    }

    #[test]
    fn test_insert_and_list_recent() {
        let store = RouteHistoryStore::open_in_memory().unwrap();
        store.insert("route-a", &entry(0, 1_000_000), 1).unwrap();
        store.insert("route-b", &entry(2_000_000, 3_000_000), 2).unwrap();

        let recent = store.list_recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].completed_at, 3_000_000);
        assert_eq!(recent[1], entry(0, 1_000_000));

        assert_eq!(store.list_recent(1).unwrap().len(), 1);
    }

    #[test]
    fn test_insert_same_key_replaces() {
        let store = RouteHistoryStore::open_in_memory().unwrap();
        store.insert("route-a", &entry(0, 1_000), 1).unwrap();
        store.insert("route-a", &entry(0, 5_000), 2).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.list_recent(5).unwrap()[0].completed_at, 5_000);
    }

    #[test]
    fn test_inverted_route_is_rejected() {
        let store = RouteHistoryStore::open_in_memory().unwrap();
        assert!(matches!(
            store.insert("bad", &entry(10, 5), 1),
            Err(FieldOpsError::Validation(_))
        ));
    }

    #[test]
    fn test_history_persists_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = RouteHistoryStore::open(temp_dir.path()).unwrap();
            store.insert("route-a", &entry(0, 1_000), 1).unwrap();
        }
        let store = RouteHistoryStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }
}
