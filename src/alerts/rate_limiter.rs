use crate::events::Timestamp;
use chrono::{Duration, Utc};
use std::collections::VecDeque;

/// Sliding-window limit on outbound notifications
///
/// Keeps the send times that fall inside the window; a send is allowed while
/// fewer than `max_per_window` remain.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    sent: VecDeque<Timestamp>,
}

impl RateLimiter {
    pub fn per_minute(max_per_minute: usize) -> Self {
        Self::new(max_per_minute, Duration::minutes(1))
    }

    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            sent: VecDeque::new(),
        }
    }

    pub fn can_send(&mut self) -> bool {
        self.can_send_at(Utc::now())
    }

    pub fn can_send_at(&mut self, now: Timestamp) -> bool {
        self.expire(now);
        self.sent.len() < self.max_per_window
    }

    pub fn record(&mut self) {
        self.record_at(Utc::now());
    }

    pub fn record_at(&mut self, at: Timestamp) {
        self.sent.push_back(at);
    }

    /// Sends still inside the window ending at `now`
    pub fn count_at(&mut self, now: Timestamp) -> usize {
        self.expire(now);
        self.sent.len()
    }

    fn expire(&mut self, now: Timestamp) {
        let cutoff = now - self.window;
        // Recorded times may arrive out of order, so scan everything.
        self.sent.retain(|&at| at > cutoff);
    }
}
