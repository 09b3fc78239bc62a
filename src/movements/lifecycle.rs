//! Movement lifecycle as an explicit transition table.
//!
//! ```text
//!            fresh evidence                      silence
//! detected ──────────────▶ verified      trending ─┐
//! verified ──────────────▶ growing       growing  ─┴─▶ peaked ─▶ declining
//! growing  ──────────────▶ trending      declining, detected, verified ─▶ dormant
//! ```
//!
//! Each cycle a movement takes at most one edge, the first in table order
//! whose guard holds. Without fresh evidence its momentum then decays
//! geometrically with the hours since its last signal.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::LifecycleConfig;
use crate::movements::{Movement, Stage};

/// What one scan cycle learned about a movement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// At least one signal was newly linked this cycle.
    pub fresh_evidence: bool,
    /// Distinct sources across all linked signals.
    pub distinct_sources: usize,
    /// Hours since the last linked signal.
    pub hours_idle: f64,
}

/// Condition under which an edge fires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Guard {
    /// Fresh evidence, and at least this many distinct sources.
    DistinctSources(usize),
    /// Fresh evidence, and momentum strictly above the threshold.
    MomentumAbove(u8),
    /// No fresh evidence, and idle strictly longer than this many hours.
    SilentFor(f64),
}

impl Guard {
    fn holds(&self, movement: &Movement, obs: &Observation) -> bool {
        match *self {
            Guard::DistinctSources(min) => obs.fresh_evidence && obs.distinct_sources >= min,
            Guard::MomentumAbove(threshold) => {
                obs.fresh_evidence && movement.momentum_score > threshold
            }
            Guard::SilentFor(hours) => !obs.fresh_evidence && obs.hours_idle > hours,
        }
    }
}

/// One row of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: Vec<Stage>,
    pub to: Stage,
    pub guard: Guard,
    /// Taking this edge stamps `peak_at` and `peak_momentum_score`.
    pub records_peak: bool,
}

impl Transition {
    fn edge(from: &[Stage], to: Stage, guard: Guard) -> Self {
        Self {
            from: from.to_vec(),
            to,
            guard,
            records_peak: false,
        }
    }
}

/// Result of applying one cycle to a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageChange {
    pub from: Stage,
    pub to: Stage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Step {
    pub change: Option<StageChange>,
    pub momentum_before: u8,
    pub momentum_after: u8,
}

/// The transition table plus the momentum decay rate.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    transitions: Vec<Transition>,
    decay_per_hour: f64,
}

impl Lifecycle {
    pub fn new(config: &LifecycleConfig) -> Self {
        use Stage::*;

        let transitions = vec![
            Transition::edge(
                &[Detected],
                Verified,
                Guard::DistinctSources(config.min_distinct_sources),
            ),
            Transition::edge(
                &[Verified],
                Growing,
                Guard::MomentumAbove(config.growing_momentum),
            ),
            Transition::edge(
                &[Growing],
                Trending,
                Guard::MomentumAbove(config.trending_momentum),
            ),
            Transition {
                records_peak: true,
                ..Transition::edge(
                    &[Trending, Growing],
                    Peaked,
                    Guard::SilentFor(config.peak_after_hours),
                )
            },
            Transition::edge(
                &[Peaked],
                Declining,
                Guard::SilentFor(config.decline_after_hours),
            ),
            Transition::edge(
                &[Declining, Detected, Verified],
                Dormant,
                Guard::SilentFor(config.dormant_after_hours),
            ),
        ];

        Self {
            transitions,
            decay_per_hour: config.decay_per_hour,
        }
    }

    /// First edge out of the movement's stage whose guard holds.
    pub fn next_transition(&self, movement: &Movement, obs: &Observation) -> Option<&Transition> {
        if movement.stage.is_terminal() {
            return None;
        }
        self.transitions
            .iter()
            .find(|t| t.from.contains(&movement.stage) && t.guard.holds(movement, obs))
    }

    /// `round(momentum × decay^hours_idle)`.
    pub fn decayed(&self, momentum: u8, hours_idle: f64) -> u8 {
        let hours = hours_idle.max(0.0);
        let value = f64::from(momentum) * self.decay_per_hour.powf(hours);
        value.round().clamp(0.0, 100.0) as u8
    }

    /// Apply one cycle: take at most one edge, then decay momentum if the
    /// movement was silent. Dormant movements are left untouched.
    pub fn apply(&self, movement: &mut Movement, obs: &Observation, now: DateTime<Utc>) -> Step {
        let momentum_before = movement.momentum_score;
        if movement.stage.is_terminal() {
            return Step {
                change: None,
                momentum_before,
                momentum_after: momentum_before,
            };
        }

        let change = self.next_transition(movement, obs).map(|t| {
            if t.records_peak {
                movement.peak_at = Some(now);
                movement.peak_momentum_score = movement.momentum_score;
            }
            StageChange {
                from: movement.stage,
                to: t.to,
            }
        });
        if let Some(change) = change {
            movement.stage = change.to;
        }

        if !obs.fresh_evidence {
            movement.momentum_score = self.decayed(movement.momentum_score, obs.hours_idle);
        }
        movement.updated_at = now;

        Step {
            change,
            momentum_before,
            momentum_after: movement.momentum_score,
        }
    }
}
