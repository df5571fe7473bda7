//! ETA 估算：历史路线统计 + 大圆距离

pub mod estimator;
pub mod model;

pub use estimator::{ChainStopEta, EtaEstimate, EtaEstimator};
pub use model::EtaModel;
