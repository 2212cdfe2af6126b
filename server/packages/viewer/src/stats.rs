use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const STATS_WINDOW: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    VerySlow,
    Slow,
    Good,
    Excellent,
}

impl QualityTier {
    pub fn for_fps(fps: f64) -> Self {
        if fps > 30.0 {
            Self::Excellent
        } else if fps > 20.0 {
            Self::Good
        } else if fps > 5.0 {
            Self::Slow
        } else {
            Self::VerySlow
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerySlow => "very_slow",
            Self::Slow => "slow",
            Self::Good => "good",
            Self::Excellent => "excellent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub frames: usize,
    pub fps: f64,
    /// Mean payload size in kilobytes.
    pub mean_kb: f64,
    pub tier: QualityTier,
}

/// Rolling window over the last [`STATS_WINDOW`] frames.
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    samples: VecDeque<(Instant, usize)>,
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, at: Instant, bytes: usize) {
        if self.samples.len() == STATS_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((at, bytes));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn fps(&self) -> f64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first);
        if span == Duration::ZERO {
            return 0.0;
        }
        (self.samples.len() - 1) as f64 / span.as_secs_f64()
    }

    pub fn mean_kb(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: usize = self.samples.iter().map(|(_, bytes)| bytes).sum();
        total as f64 / self.samples.len() as f64 / 1024.0
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let fps = self.fps();
        StatsSnapshot {
            frames: self.samples.len(),
            fps,
            mean_kb: self.mean_kb(),
            tier: QualityTier::for_fps(fps),
        }
    }
}
