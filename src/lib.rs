mod config;
mod estimator;
mod loss_statistics;
mod receiver_reports;
mod send_side_bandwidth_estimation;

pub use config::*;
pub use estimator::*;
pub use loss_statistics::*;
pub use receiver_reports::*;
pub use send_side_bandwidth_estimation::*;
