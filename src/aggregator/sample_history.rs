//! Rolling per-metric sample buffer
//!
//! Keeps the most recent samples of every metric so a diagnosis request can
//! carry the readings that led up to an anomaly.

use crate::events::Sample;
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub struct SampleHistory {
    buffers: HashMap<String, VecDeque<Sample>>,
    /// Samples kept per metric
    max_per_metric: usize,
}

impl SampleHistory {
    pub fn new(max_per_metric: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            max_per_metric,
        }
    }

    pub fn record(&mut self, sample: Sample) {
        if self.max_per_metric == 0 {
            return;
        }
        let buffer = self
            .buffers
            .entry(sample.metric_name.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.max_per_metric));
        buffer.push_back(sample);
        while buffer.len() > self.max_per_metric {
            buffer.pop_front();
        }
    }

    /// Up to `limit` most recent samples of `metric_name`, oldest first
    pub fn recent(&self, metric_name: &str, limit: usize) -> Vec<Sample> {
        self.buffers
            .get(metric_name)
            .map(|buffer| {
                let skip = buffer.len().saturating_sub(limit);
                buffer.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Every retained sample of `metric_name`, oldest first
    pub fn all(&self, metric_name: &str) -> Vec<Sample> {
        self.recent(metric_name, self.max_per_metric)
    }

    pub fn len(&self, metric_name: &str) -> usize {
        self.buffers.get(metric_name).map(VecDeque::len).unwrap_or(0)
    }

    pub fn metric_count(&self) -> usize {
        self.buffers.len()
    }
}
