//! Per-connection inactivity timer.
//!
//! Measures time since the worker last made progress, not total elapsed
//! time: every received byte pushes the deadline out by the full period, so a
//! large result streamed in chunks does not expire.

use std::future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep, sleep_until};

pub struct InactivityTimer {
    period: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
    armed: bool,
}

impl InactivityTimer {
    /// `None` disables the timer entirely.
    pub fn new(period: Option<Duration>) -> Self {
        Self {
            period,
            sleep: None,
            armed: false,
        }
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Start the countdown if it is not already running.
    ///
    /// New submissions do not extend a running countdown, so a steady stream
    /// of requests cannot hide a stuck worker.
    pub fn arm(&mut self) {
        if !self.armed {
            self.restart();
        }
    }

    /// Record progress: restart a running countdown from now.
    pub fn touch(&mut self) {
        if self.armed {
            self.restart();
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    fn restart(&mut self) {
        let Some(period) = self.period else {
            return;
        };
        let deadline = Instant::now() + period;
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(sleep_until(deadline))),
        }
        self.armed = true;
    }

    /// Resolves once when an armed countdown runs out; pending otherwise.
    ///
    /// Cancel safe: dropping the future leaves the countdown untouched.
    pub async fn expired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) if self.armed => sleep.as_mut().await,
            _ => future::pending::<()>().await,
        }
        self.armed = false;
    }
}
