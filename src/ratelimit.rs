//! Sliding one-hour request window.
//!
//! The ceiling comes from, in order of precedence: an explicit
//! per-connection override, a value calibrated from the first response the
//! connection receives, or the configured global default. No rolling hour
//! ever sees more requests than the ceiling in force.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::client::HttpResponse;
use crate::clock::Clock;

/// Reads a per-hour request ceiling from a response, typically from vendor
/// rate-limit headers.
pub type Calibration = Arc<dyn Fn(&HttpResponse) -> Option<u32> + Send + Sync>;

fn window() -> chrono::Duration {
    chrono::Duration::hours(1)
}

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    calibration: Option<Calibration>,
    state: Mutex<WindowState>,
}

struct WindowState {
    limit: u32,
    /// Set once the limit came from an override or a calibration.
    settled: bool,
    sent: VecDeque<DateTime<Utc>>,
}

impl RateLimiter {
    /// `override_per_hour` wins over calibration; `default_per_hour` applies
    /// until (and unless) calibration supplies a value.
    pub fn new(
        clock: Arc<dyn Clock>,
        default_per_hour: u32,
        override_per_hour: Option<u32>,
        calibration: Option<Calibration>,
    ) -> Self {
        Self {
            clock,
            calibration,
            state: Mutex::new(WindowState {
                limit: override_per_hour.unwrap_or(default_per_hour).max(1),
                settled: override_per_hour.is_some(),
                sent: VecDeque::new(),
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.lock().limit
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until one more request fits in the window, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let now = self.clock.now();
                let mut state = self.lock();
                while state.sent.front().is_some_and(|t| *t + window() <= now) {
                    state.sent.pop_front();
                }
                if (state.sent.len() as u64) < u64::from(state.limit) {
                    state.sent.push_back(now);
                    return;
                }
                match state.sent.front() {
                    Some(oldest) => (*oldest + window() - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                    None => Duration::ZERO,
                }
            };
            debug!(wait_secs = wait.as_secs_f64(), "rate limit window full");
            self.clock.sleep(wait).await;
        }
    }

    /// Feed a response to the calibration hook. Only the first response
    /// that yields a value is used.
    pub fn observe(&self, response: &HttpResponse) {
        let Some(calibrate) = &self.calibration else {
            return;
        };
        if self.lock().settled {
            return;
        }
        if let Some(limit) = calibrate(response).filter(|l| *l > 0) {
            let mut state = self.lock();
            if !state.settled {
                info!(requests_per_hour = limit, "calibrated rate limit");
                state.limit = limit;
                state.settled = true;
            }
        }
    }
}

/// Calibrate from a header carrying the per-hour ceiling, such as
/// `X-RateLimit-Limit`.
pub fn header_calibration(name: &'static str) -> Calibration {
    Arc::new(move |response: &HttpResponse| {
        response.header(name).and_then(|v| v.trim().parse::<u32>().ok())
    })
}
