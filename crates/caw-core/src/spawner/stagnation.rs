//! Per-agent stagnation monitor.
//!
//! Three independent signals feed one monotone escalation ladder
//! (`none < warn < pause < abort`):
//!
//! - **loop detection**: the same `(phase, progress, iteration)` hash seen
//!   `repeat_threshold` times within the last `history_window` observations;
//! - **wall clock**: warn / abort thresholds on elapsed time;
//! - **turn count**: warn / abort thresholds on assistant turns.
//!
//! The monitor never de-escalates and reports each level at most once.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// Thresholds; the defaults match production behaviour.
#[derive(Debug, Clone)]
pub struct StagnationConfig {
    pub repeat_threshold: usize,
    pub history_window: usize,
    pub warn_time: Duration,
    pub abort_time: Duration,
    pub warn_turns: u32,
    pub abort_turns: u32,
    pub check_interval: Duration,
}

impl Default for StagnationConfig {
    fn default() -> Self {
        Self {
            repeat_threshold: 3,
            history_window: 5,
            warn_time: Duration::from_secs(600),
            abort_time: Duration::from_secs(1800),
            warn_turns: 8,
            abort_turns: 15,
            check_interval: Duration::from_secs(30),
        }
    }
}

/// Escalation ladder, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationLevel {
    None,
    Warn,
    Pause,
    Abort,
}

impl EscalationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Warn => "warn",
            Self::Pause => "pause",
            Self::Abort => "abort",
        }
    }
}

/// One agent's monitor state.
#[derive(Debug)]
pub struct StagnationMonitor {
    config: StagnationConfig,
    started_at: Instant,
    history: VecDeque<u64>,
    turns: u32,
    level: EscalationLevel,
}

impl StagnationMonitor {
    pub fn new(config: StagnationConfig) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            history: VecDeque::new(),
            turns: 0,
            level: EscalationLevel::None,
        }
    }

    /// Record an observed agent state.
    pub fn observe(&mut self, phase: &str, progress_snippet: &str, iteration: u64) {
        let mut hasher = DefaultHasher::new();
        phase.hash(&mut hasher);
        progress_snippet.hash(&mut hasher);
        iteration.hash(&mut hasher);
        let digest = hasher.finish();

        self.history.push_back(digest);
        while self.history.len() > self.config.history_window {
            self.history.pop_front();
        }
    }

    /// Record one assistant turn.
    pub fn note_turn(&mut self) {
        self.turns += 1;
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn level(&self) -> EscalationLevel {
        self.level
    }

    /// Whether the recent history repeats one state often enough to count
    /// as a loop.
    fn looping(&self) -> bool {
        for digest in &self.history {
            let occurrences = self.history.iter().filter(|d| *d == digest).count();
            if occurrences >= self.config.repeat_threshold {
                return true;
            }
        }
        false
    }

    /// The level the signals currently justify, ignoring history.
    fn target_level(&self, elapsed: Duration) -> EscalationLevel {
        if elapsed >= self.config.abort_time || self.turns >= self.config.abort_turns {
            return EscalationLevel::Abort;
        }
        if self.looping() {
            return EscalationLevel::Pause;
        }
        if elapsed >= self.config.warn_time || self.turns >= self.config.warn_turns {
            return EscalationLevel::Warn;
        }
        EscalationLevel::None
    }

    /// Evaluate all signals. Returns the new level only when it escalated
    /// past the previously reported one.
    pub fn check(&mut self) -> Option<EscalationLevel> {
        self.check_at(self.started_at.elapsed())
    }

    /// Testable core of [`check`], with an explicit elapsed time.
    pub fn check_at(&mut self, elapsed: Duration) -> Option<EscalationLevel> {
        let target = self.target_level(elapsed);
        if target > self.level {
            self.level = target;
            Some(target)
        } else {
            None
        }
    }
}
