/// Anomaly detector and threshold rule definitions
pub mod anomaly_detector;
pub mod rules;

pub use anomaly_detector::AnomalyDetector;
pub use rules::{Comparator, ThresholdRule};
