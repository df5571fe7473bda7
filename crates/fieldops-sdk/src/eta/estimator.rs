//! ETA 估算
//!
//! travel = distanceKm / avgSpeedKmh * 60，stop = 停靠数 * avgStopMinutes，
//! minutes = max(1, round(travel + stop))

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::eta::model::EtaModel;
use crate::location::{distance_km, GeoPoint};
use crate::storage::RouteHistoryEntry;
use crate::utils::Clock;

const MS_PER_MINUTE: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtaEstimate {
    pub minutes: u32,
    pub distance_km: f64,
    pub travel_time_minutes: f64,
    pub stop_time_minutes: f64,
    /// 预计到达时间（UTC 毫秒）
    pub arrival_at: i64,
    pub computed_at: i64,
}

/// 多站路线中某一站的累计 ETA
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStopEta {
    pub index: usize,
    pub stop: GeoPoint,
    pub leg_distance_km: f64,
    pub cumulative_distance_km: f64,
    pub cumulative_minutes: u32,
    pub arrival_at: i64,
}

fn to_minutes(raw: f64) -> u32 {
    let rounded = raw.round();
    if rounded.is_finite() && rounded >= 1.0 {
        rounded.min(u32::MAX as f64) as u32
    } else {
        1
    }
}

#[derive(Debug)]
pub struct EtaEstimator {
    model: RwLock<EtaModel>,
    clock: Arc<dyn Clock>,
}

impl EtaEstimator {
    pub fn new(model: EtaModel, clock: Arc<dyn Clock>) -> Self {
        Self {
            model: RwLock::new(model),
            clock,
        }
    }

    pub fn from_history(history: &[RouteHistoryEntry], clock: Arc<dyn Clock>) -> Self {
        Self::new(EtaModel::from_history(history), clock)
    }

    pub fn model(&self) -> EtaModel {
        *self.model.read()
    }

    /// 用新的历史数据重建模型参数
    pub fn refresh_model(&self, history: &[RouteHistoryEntry]) -> EtaModel {
        let model = EtaModel::from_history(history);
        *self.model.write() = model;
        debug!(
            "ETA 模型已刷新: speed={:.2} km/h stop={:.2} min (legs={}, stops={})",
            model.avg_speed_kmh, model.avg_stop_minutes, model.legs_used, model.stops_used
        );
        model
    }

    pub fn estimate(&self, current: GeoPoint, destination: GeoPoint, upcoming_stops: usize) -> EtaEstimate {
        let model = self.model();
        let distance_km = distance_km(current, destination);
        let travel_time_minutes = distance_km / model.avg_speed_kmh * 60.0;
        let stop_time_minutes = upcoming_stops as f64 * model.avg_stop_minutes;
        let minutes = to_minutes(travel_time_minutes + stop_time_minutes);

        let now = self.clock.now_ms();
        EtaEstimate {
            minutes,
            distance_km,
            travel_time_minutes,
            stop_time_minutes,
            arrival_at: now + minutes as i64 * MS_PER_MINUTE,
            computed_at: now,
        }
    }

    /// 依次经过 `stops` 的累计 ETA；停靠时间只计入两段之间
    pub fn estimate_chain(&self, current: GeoPoint, stops: &[GeoPoint]) -> Vec<ChainStopEta> {
        let model = self.model();
        let now = self.clock.now_ms();

        let mut previous = current;
        let mut cumulative_raw = 0.0;
        let mut cumulative_distance_km = 0.0;

        stops
            .iter()
            .enumerate()
            .map(|(index, &stop)| {
                if index > 0 {
                    cumulative_raw += model.avg_stop_minutes;
                }
                let leg_distance_km = distance_km(previous, stop);
                cumulative_raw += leg_distance_km / model.avg_speed_kmh * 60.0;
                cumulative_distance_km += leg_distance_km;
                previous = stop;

                let cumulative_minutes = to_minutes(cumulative_raw);
                ChainStopEta {
                    index,
                    stop,
                    leg_distance_km,
                    cumulative_distance_km,
                    cumulative_minutes,
                    arrival_at: now + cumulative_minutes as i64 * MS_PER_MINUTE,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eta::model::{DEFAULT_SPEED_KMH, DEFAULT_STOP_MINUTES};
    use crate::utils::ManualClock;

    fn estimator() -> EtaEstimator {
        EtaEstimator::new(EtaModel::default(), Arc::new(ManualClock::new(1_000)))
    }

    #[test]
    fn test_estimate_minimum_is_one_minute() {
        let here = GeoPoint::new(28.7041, 77.1025);
        let eta = estimator().estimate(here, here, 0);
        assert_eq!(eta.minutes, 1);
        assert_eq!(eta.distance_km, 0.0);
        assert_eq!(eta.arrival_at, 1_000 + 60_000);
    }

    #[test]
    fn test_estimate_adds_stop_time() {
        // 赤道上 0.1 度约 11.12 km，默认 25 km/h 约 26.7 分钟
        let eta = estimator().estimate(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 0.1), 2);
        assert!((eta.travel_time_minutes - 11.1195 / DEFAULT_SPEED_KMH * 60.0).abs() < 0.01);
        assert_eq!(eta.stop_time_minutes, 2.0 * DEFAULT_STOP_MINUTES);
        assert_eq!(eta.minutes, 37);
        assert_eq!(eta.computed_at, 1_000);
    }

    #[test]
    fn test_chain_inserts_stop_time_between_legs_only() {
        let estimator = estimator();
        let origin = GeoPoint::new(0.0, 0.0);
        let stops = [GeoPoint::new(0.0, 0.1), GeoPoint::new(0.0, 0.2), GeoPoint::new(0.0, 0.2)];
        let chain = estimator.estimate_chain(origin, &stops);
        assert_eq!(chain.len(), 3);

        let leg = 11.1195 / DEFAULT_SPEED_KMH * 60.0;
        assert_eq!(chain[0].cumulative_minutes, leg.round() as u32);
        assert_eq!(chain[1].cumulative_minutes, (2.0 * leg + DEFAULT_STOP_MINUTES).round() as u32);
        // 同一地点的第三站只增加停靠时间
        assert_eq!(chain[2].leg_distance_km, 0.0);
        assert_eq!(
            chain[2].cumulative_minutes,
            (2.0 * leg + 2.0 * DEFAULT_STOP_MINUTES).round() as u32
        );
        assert!((chain[2].cumulative_distance_km - 2.0 * 11.1195).abs() < 0.01);
        assert!(estimator.estimate_chain(origin, &[]).is_empty());
    }

    #[test]
    fn test_refresh_model_replaces_parameters() {
        use crate::location::LocationSample;

        let estimator = estimator();
        let route = RouteHistoryEntry {
            stops: vec![
                LocationSample::new(0.0, 0.0, 5.0, 0),
                LocationSample::new(0.0, 0.1, 5.0, 3_600_000),
            ],
            started_at: 0,
            completed_at: 3_600_000,
            per_stop: Vec::new(),
        };
        let model = estimator.refresh_model(&[route]);
        assert!(model.avg_speed_kmh < DEFAULT_SPEED_KMH);
        assert_eq!(estimator.model(), model);
    }
}
