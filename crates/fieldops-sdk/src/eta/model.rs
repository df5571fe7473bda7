use serde::{Deserialize, Serialize};

use crate::location::distance_km;
use crate::storage::RouteHistoryEntry;

pub const DEFAULT_SPEED_KMH: f64 = 25.0;
pub const MIN_SPEED_KMH: f64 = 5.0;
pub const MAX_SPEED_KMH: f64 = 50.0;

pub const DEFAULT_STOP_MINUTES: f64 = 5.0;
pub const MIN_STOP_MINUTES: f64 = 2.0;
pub const MAX_STOP_MINUTES: f64 = 15.0;

const MS_PER_HOUR: f64 = 3_600_000.0;
const MS_PER_MINUTE: f64 = 60_000.0;

/// 从历史路线得到的 ETA 参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtaModel {
    pub avg_speed_kmh: f64,
    pub avg_stop_minutes: f64,
    /// 参与速度统计的路段数
    pub legs_used: usize,
    /// 参与停靠统计的停靠点数
    pub stops_used: usize,
}

impl Default for EtaModel {
    fn default() -> Self {
        Self {
            avg_speed_kmh: DEFAULT_SPEED_KMH,
            avg_stop_minutes: DEFAULT_STOP_MINUTES,
            legs_used: 0,
            stops_used: 0,
        }
    }
}

impl EtaModel {
    pub fn from_history(history: &[RouteHistoryEntry]) -> Self {
        let mut total_km = 0.0;
        let mut total_hours = 0.0;
        let mut legs_used = 0;
        let mut dwell_minutes = Vec::new();

        for route in history {
            for i in 1..route.stops.len() {
                let from = &route.stops[i - 1];
                let to = &route.stops[i];
                let km = distance_km(from.point(), to.point());

                // 优先用上一站作业完成到本站到达的时间，缺失时退回采样时间戳
                let duration_ms = match (route.timing(i - 1).completed_at, route.timing(i).reached_at) {
                    (Some(left), Some(arrived)) => arrived - left,
                    _ => to.timestamp - from.timestamp,
                };

                if km > 0.0 && km.is_finite() && duration_ms > 0 {
                    total_km += km;
                    total_hours += duration_ms as f64 / MS_PER_HOUR;
                    legs_used += 1;
                }
            }

            dwell_minutes.extend(
                route
                    .per_stop
                    .iter()
                    .filter_map(|timing| timing.dwell_ms())
                    .map(|ms| ms as f64 / MS_PER_MINUTE),
            );
        }

        let avg_speed_kmh = if total_hours > 0.0 {
            clamp_or_default(total_km / total_hours, MIN_SPEED_KMH, MAX_SPEED_KMH, DEFAULT_SPEED_KMH)
        } else {
            DEFAULT_SPEED_KMH
        };

        let avg_stop_minutes = if dwell_minutes.is_empty() {
            DEFAULT_STOP_MINUTES
        } else {
            let mean = dwell_minutes.iter().sum::<f64>() / dwell_minutes.len() as f64;
            clamp_or_default(mean, MIN_STOP_MINUTES, MAX_STOP_MINUTES, DEFAULT_STOP_MINUTES)
        };

        Self {
            avg_speed_kmh,
            avg_stop_minutes,
            legs_used,
            stops_used: dwell_minutes.len(),
        }
    }
}

fn clamp_or_default(value: f64, min: f64, max: f64, default: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        default
    }
}
