use serde::{Deserialize, Serialize};

/// 地球平均半径（米）
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// 一次定位采样
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// 精度半径（米），越小越好
    pub accuracy: f64,
    /// 速度（米/秒）
    #[serde(default)]
    pub speed: Option<f64>,
    /// 航向（度，正北为 0）
    #[serde(default)]
    pub heading: Option<f64>,
    /// 采样时间（UTC 毫秒）
    pub timestamp: i64,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            speed: None,
            heading: None,
            timestamp,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    pub fn distance_m(&self, other: &LocationSample) -> f64 {
        distance_m(self.point(), other.point())
    }
}

/// 经纬度坐标点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl From<LocationSample> for GeoPoint {
    fn from(sample: LocationSample) -> Self {
        sample.point()
    }
}

/// Haversine 大圆距离（米）
pub fn distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    // 浮点误差可能让 h 略大于 1
    let c = 2.0 * h.sqrt().min(1.0).asin();
    EARTH_RADIUS_M * c
}

pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    distance_m(a, b) / 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_is_symmetric_and_zero_on_same_point() {
        let a = GeoPoint::new(28.7041, 77.1025);
        let b = GeoPoint::new(19.0760, 72.8777);
        assert_eq!(distance_m(a, a), 0.0);
        assert!((distance_m(a, b) - distance_m(b, a)).abs() < 1e-6);
    }

    #[test]
    fn test_short_hop_distance() {
        let a = GeoPoint::new(28.7041, 77.1025);
        let b = GeoPoint::new(28.7050, 77.1030);
        let km = distance_km(a, b);
        assert!(km > 0.0 && km < 0.2, "distance was {} km", km);
    }

    #[test]
    fn test_distance_grows_with_separation() {
        let origin = GeoPoint::new(0.0, 0.0);
        let mut last = 0.0;
        for step in 1..=18 {
            let d = distance_m(origin, GeoPoint::new(0.0, step as f64 * 10.0));
            assert!(d > last);
            last = d;
        }
        // 赤道上 180 度约为半个周长
        assert!((last - std::f64::consts::PI * EARTH_RADIUS_M).abs() < 1.0);
    }

    #[test]
    fn test_point_validation() {
        assert!(GeoPoint::new(28.7, 77.1).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, f64::NAN).is_valid());
    }
}
