//! Overload detection and adaptive throttling
//!
//! Each broadcast pass is timed against the target interval. The fraction of
//! the interval left idle is smoothed into a trailing sleep ratio, which
//! drives the throttling ratio applied to every client's bandwidth budget.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::mixer::constants::throttling;

/// Tuning of the throttling policy
#[derive(Debug, Clone, Copy)]
pub struct OverloadConfig {
    pub trailing_average_frames: u32,
    pub struggle_trigger_sleep_ratio: f32,
    pub back_off_trigger_sleep_ratio: f32,
    pub struggle_step: f32,
    pub ratio_back_off: f32,
    pub ceiling: f32,
}

impl Default for OverloadConfig {
    fn default() -> Self {
        Self {
            trailing_average_frames: throttling::TRAILING_AVERAGE_FRAMES,
            struggle_trigger_sleep_ratio: throttling::STRUGGLE_TRIGGER_SLEEP_RATIO,
            back_off_trigger_sleep_ratio: throttling::BACK_OFF_TRIGGER_SLEEP_RATIO,
            struggle_step: throttling::STRUGGLE_STEP,
            ratio_back_off: throttling::RATIO_BACK_OFF,
            ceiling: throttling::CEILING,
        }
    }
}

/// Throttling values published for lock-free readers
#[derive(Debug)]
pub struct ThrottlingState {
    trailing_sleep_ratio: AtomicU32,
    throttling_ratio: AtomicU32,
}

impl Default for ThrottlingState {
    fn default() -> Self {
        Self {
            trailing_sleep_ratio: AtomicU32::new(1.0f32.to_bits()),
            throttling_ratio: AtomicU32::new(0.0f32.to_bits()),
        }
    }
}

impl ThrottlingState {
    /// 1.0 when idle, towards 0 under overload
    pub fn trailing_sleep_ratio(&self) -> f32 {
        f32::from_bits(self.trailing_sleep_ratio.load(Ordering::Acquire))
    }

    /// 0.0 when unthrottled
    pub fn throttling_ratio(&self) -> f32 {
        f32::from_bits(self.throttling_ratio.load(Ordering::Acquire))
    }

    fn publish(&self, trailing: f32, ratio: f32) {
        self.trailing_sleep_ratio.store(trailing.to_bits(), Ordering::Release);
        self.throttling_ratio.store(ratio.to_bits(), Ordering::Release);
    }
}

/// Change of the throttling ratio caused by one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverloadTransition {
    Steady,
    Struggling { from: f32, to: f32 },
    Recovering { from: f32, to: f32 },
}

/// Tracks broadcast pass durations and derives the throttling ratio
pub struct OverloadMonitor {
    config: OverloadConfig,
    target_interval: Duration,
    trailing_sleep_ratio: f32,
    throttling_ratio: f32,
    shared: Arc<ThrottlingState>,
    tick_start: Option<Instant>,
    /// Rolling window of pass durations
    tick_durations: VecDeque<Duration>,
}

impl OverloadMonitor {
    pub fn new(target_interval: Duration) -> Self {
        Self::with_config(target_interval, OverloadConfig::default())
    }

    pub fn with_config(target_interval: Duration, config: OverloadConfig) -> Self {
        Self {
            config,
            target_interval,
            trailing_sleep_ratio: 1.0,
            throttling_ratio: 0.0,
            shared: Arc::new(ThrottlingState::default()),
            tick_start: None,
            tick_durations: VecDeque::with_capacity(throttling::DURATION_SAMPLES),
        }
    }

    /// Handle for readers outside the scheduler thread
    pub fn state(&self) -> Arc<ThrottlingState> {
        self.shared.clone()
    }

    pub fn trailing_sleep_ratio(&self) -> f32 {
        self.trailing_sleep_ratio
    }

    pub fn throttling_ratio(&self) -> f32 {
        self.throttling_ratio
    }

    pub fn target_interval(&self) -> Duration {
        self.target_interval
    }

    /// Start timing a broadcast pass
    pub fn tick_start(&mut self) {
        self.tick_start = Some(Instant::now());
    }

    /// Stop timing and update the throttling ratio
    pub fn tick_end(&mut self) -> OverloadTransition {
        match self.tick_start.take() {
            Some(start) => self.record_tick(start.elapsed()),
            None => OverloadTransition::Steady,
        }
    }

    /// Fraction of the interval left idle after a pass of `elapsed`
    pub fn idle_ratio(&self, elapsed: Duration) -> f32 {
        let target = self.target_interval.as_secs_f32();
        if target <= 0.0 {
            return 0.0;
        }
        ((target - elapsed.as_secs_f32()) / target).max(0.0)
    }

    /// Feed one pass duration into the trailing average and the policy
    pub fn record_tick(&mut self, elapsed: Duration) -> OverloadTransition {
        self.tick_durations.push_back(elapsed);
        while self.tick_durations.len() > throttling::DURATION_SAMPLES {
            self.tick_durations.pop_front();
        }

        let alpha = 1.0 / self.config.trailing_average_frames.max(1) as f32;
        self.trailing_sleep_ratio =
            (1.0 - alpha) * self.trailing_sleep_ratio + alpha * self.idle_ratio(elapsed);

        let from = self.throttling_ratio;
        let transition = if self.trailing_sleep_ratio <= self.config.struggle_trigger_sleep_ratio {
            let to = (from + self.config.struggle_step * (1.0 - from)).min(self.config.ceiling);
            if to > from {
                warn!(
                    "Broadcast struggling (trailing sleep {:.1}%), throttling {:.2} -> {:.2}",
                    self.trailing_sleep_ratio * 100.0,
                    from,
                    to
                );
                OverloadTransition::Struggling { from, to }
            } else {
                OverloadTransition::Steady
            }
        } else if self.trailing_sleep_ratio >= self.config.back_off_trigger_sleep_ratio && from > 0.0 {
            let to = (from - self.config.ratio_back_off).max(0.0);
            if to == 0.0 {
                info!("Broadcast recovered, throttling lifted");
            }
            OverloadTransition::Recovering { from, to }
        } else {
            OverloadTransition::Steady
        };

        match transition {
            OverloadTransition::Struggling { to, .. } | OverloadTransition::Recovering { to, .. } => {
                self.throttling_ratio = to;
            }
            OverloadTransition::Steady => {}
        }

        self.shared.publish(self.trailing_sleep_ratio, self.throttling_ratio);
        transition
    }

    pub fn last_tick_duration(&self) -> Duration {
        self.tick_durations.back().copied().unwrap_or(Duration::ZERO)
    }

    pub fn average_tick_duration(&self) -> Duration {
        if self.tick_durations.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.tick_durations.iter().sum();
        sum / self.tick_durations.len() as u32
    }

    pub fn p95_tick_duration(&self) -> Duration {
        if self.tick_durations.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.tick_durations.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted.get(idx.min(sorted.len() - 1)).copied().unwrap_or(Duration::ZERO)
    }

    /// Average pass duration as a percentage of the interval (0-100+)
    pub fn budget_usage_percent(&self) -> f32 {
        let target = self.target_interval.as_secs_f32();
        if target <= 0.0 {
            return 0.0;
        }
        (self.average_tick_duration().as_secs_f32() / target) * 100.0
    }
}
