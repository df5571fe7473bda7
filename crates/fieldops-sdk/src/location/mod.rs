//! 定位：采样、过滤与距离计算

pub mod sample;
pub mod sampler;
pub mod source;

pub use sample::{distance_km, distance_m, GeoPoint, LocationSample};
pub use sampler::{ErrorCallback, LocationSampler, SampleCallback, SubscriptionHandle};
pub use source::{GeolocationSource, Position, PositionOptions, PositionResult};
