//! Merging freshly profiled movements into the ones already tracked.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DedupConfig;
use crate::movements::Movement;

/// A movement candidate produced by one scan, with the signals behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementProfile {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub momentum_score: u8,
    #[serde(default)]
    pub signal_ids: Vec<Uuid>,
}

/// "Profile `profile_index` is the same movement as `movement_id`."
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchProposal {
    pub profile_index: usize,
    pub movement_id: Uuid,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupResult {
    /// The input profiles with same-name profiles merged. `matches` and
    /// `new_profiles` index into this list.
    pub profiles: Vec<MovementProfile>,
    /// Accepted proposals; each profile and each movement appears at most once.
    pub matches: Vec<MatchProposal>,
    /// Indices of profiles that become new movements, ascending.
    pub new_profiles: Vec<usize>,
}

/// Lowercase alphanumerics only, so "Right-to-Repair" == "right to repair".
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Collapse profiles with equal normalised names into the first of them,
/// unioning their signals and keeping the higher momentum. Also returns,
/// for every input index, the index of the profile it was merged into.
pub fn merge_same_name(profiles: &[MovementProfile]) -> (Vec<MovementProfile>, Vec<usize>) {
    let mut merged: Vec<MovementProfile> = Vec::with_capacity(profiles.len());
    let mut by_name: HashMap<String, usize> = HashMap::new();
    let mut merged_index = Vec::with_capacity(profiles.len());

    for profile in profiles {
        let key = normalize_name(&profile.name);
        // Names with no alphanumerics never merge.
        let existing = (!key.is_empty()).then(|| by_name.get(&key).copied()).flatten();
        match existing {
            Some(index) => {
                let target = &mut merged[index];
                target.momentum_score = target.momentum_score.max(profile.momentum_score);
                if target.summary.trim().is_empty() {
                    target.summary = profile.summary.clone();
                }
                for id in &profile.signal_ids {
                    if !target.signal_ids.contains(id) {
                        target.signal_ids.push(*id);
                    }
                }
                merged_index.push(index);
            }
            None => {
                if !key.is_empty() {
                    by_name.insert(key, merged.len());
                }
                merged_index.push(merged.len());
                merged.push(profile.clone());
            }
        }
    }

    (merged, merged_index)
}

pub struct Deduplicator {
    min_confidence: f64,
}

impl Deduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
        }
    }

    /// Profiles whose normalised name equals a tracked movement's, at
    /// confidence 1.0.
    pub fn exact_matches(profiles: &[MovementProfile], movements: &[Movement]) -> Vec<MatchProposal> {
        profiles
            .iter()
            .enumerate()
            .filter_map(|(index, profile)| {
                let key = normalize_name(&profile.name);
                if key.is_empty() {
                    return None;
                }
                movements
                    .iter()
                    .filter(|m| !m.stage.is_terminal())
                    .find(|m| normalize_name(&m.name) == key)
                    .map(|m| MatchProposal {
                        profile_index: index,
                        movement_id: m.id,
                        confidence: 1.0,
                    })
            })
            .collect()
    }

    /// Resolve exact-name matches and proposals into a one-to-one matching.
    ///
    /// Profiles sharing a normalised name are merged first; proposals for
    /// any of them apply to the merged profile. Candidates are taken exact
    /// matches first, then proposals in the order
    /// given; the first accepted candidate for a profile or a movement wins.
    /// Candidates below the confidence threshold, with an out-of-range
    /// profile index, or naming an unknown or dormant movement are dropped.
    pub fn resolve(
        &self,
        profiles: &[MovementProfile],
        movements: &[Movement],
        proposals: &[MatchProposal],
    ) -> DedupResult {
        let eligible: HashSet<Uuid> = movements
            .iter()
            .filter(|m| !m.stage.is_terminal())
            .map(|m| m.id)
            .collect();

        let (profiles, merged_index) = merge_same_name(profiles);
        let remapped = proposals.iter().filter_map(|p| {
            merged_index.get(p.profile_index).map(|&profile_index| MatchProposal {
                profile_index,
                ..*p
            })
        });

        let exact = Self::exact_matches(&profiles, movements);
        let mut matched_profiles = HashSet::new();
        let mut matched_movements = HashSet::new();
        let mut matches = Vec::new();

        for candidate in exact.into_iter().chain(remapped) {
            if !(candidate.confidence >= self.min_confidence)
                || !eligible.contains(&candidate.movement_id)
                || matched_profiles.contains(&candidate.profile_index)
                || matched_movements.contains(&candidate.movement_id)
            {
                continue;
            }
            matched_profiles.insert(candidate.profile_index);
            matched_movements.insert(candidate.movement_id);
            matches.push(candidate);
        }

        let new_profiles = (0..profiles.len())
            .filter(|i| !matched_profiles.contains(i))
            .collect();

        DedupResult {
            profiles,
            matches,
            new_profiles,
        }
    }
}
