//! One scan cycle over the movement tables.
//!
//! Dedup, signal linking, movement creation and the lifecycle step all run
//! inside a single [`MovementTx`], so a cycle either lands completely or not
//! at all. Each cycle is recorded against the scan job that ran it and is
//! applied at most once per job.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DedupConfig, LifecycleConfig};
use crate::error::{Error, ParseError};
use crate::movements::dedup::{Deduplicator, MatchProposal, MovementProfile};
use crate::movements::lifecycle::{Lifecycle, Observation};
use crate::movements::{Movement, Stage};
use crate::store::{Database, MovementTx};

/// A stage change applied during the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub movement_id: Uuid,
    pub name: String,
    pub from: Stage,
    pub to: Stage,
}

/// What a cycle did. Stored as the scan job's projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub created: Vec<Uuid>,
    pub matched: Vec<Uuid>,
    pub signals_linked: usize,
    pub transitions: Vec<TransitionRecord>,
    /// Movements whose momentum dropped through decay.
    pub decayed: usize,
}

pub struct MovementCycle {
    lifecycle: Lifecycle,
    dedup: Deduplicator,
}

impl MovementCycle {
    pub fn new(lifecycle: &LifecycleConfig, dedup: &DedupConfig) -> Self {
        Self {
            lifecycle: Lifecycle::new(lifecycle),
            dedup: Deduplicator::new(dedup),
        }
    }

    /// Apply `profiles` and `proposals` to the tracked movements and advance
    /// every active movement by one lifecycle step.
    ///
    /// If `job_id` already committed a cycle, nothing is applied and the
    /// stored report is returned.
    pub async fn run(
        &self,
        db: &dyn Database,
        job_id: Uuid,
        profiles: &[MovementProfile],
        proposals: &[MatchProposal],
        now: DateTime<Utc>,
    ) -> Result<CycleReport, Error> {
        let mut tx = db.begin_movement_tx().await?;

        match self.apply_once(tx.as_mut(), job_id, profiles, proposals, now).await {
            Ok((report, false)) => {
                tx.rollback().await?;
                info!(job_id = %job_id, "Movement cycle already applied");
                Ok(report)
            }
            Ok((report, true)) => {
                tx.commit().await?;
                info!(
                    job_id = %job_id,
                    created = report.created.len(),
                    matched = report.matched.len(),
                    signals_linked = report.signals_linked,
                    transitions = report.transitions.len(),
                    "Movement cycle committed"
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Failed to roll back movement cycle");
                }
                Err(e)
            }
        }
    }

    /// The report, and whether this call applied it.
    async fn apply_once(
        &self,
        tx: &mut dyn MovementTx,
        job_id: Uuid,
        profiles: &[MovementProfile],
        proposals: &[MatchProposal],
        now: DateTime<Utc>,
    ) -> Result<(CycleReport, bool), Error> {
        if let Some(stored) = tx.applied_cycle(job_id).await? {
            let report = serde_json::from_value(stored).map_err(|source| ParseError::InvalidJson {
                context: "stored cycle report".to_string(),
                source,
            })?;
            return Ok((report, false));
        }

        let report = self.apply(tx, profiles, proposals, now).await?;
        let stored = serde_json::to_value(&report).map_err(|source| ParseError::InvalidJson {
            context: "cycle report".to_string(),
            source,
        })?;
        tx.record_cycle(job_id, &stored).await?;
        Ok((report, true))
    }

    async fn apply(
        &self,
        tx: &mut dyn MovementTx,
        profiles: &[MovementProfile],
        proposals: &[MatchProposal],
        now: DateTime<Utc>,
    ) -> Result<CycleReport, Error> {
        let mut movements = tx.active_movements().await?;
        let resolved = self.dedup.resolve(profiles, &movements, proposals);
        let profiles = &resolved.profiles;
        debug!(
            profiles = profiles.len(),
            proposals = proposals.len(),
            accepted = resolved.matches.len(),
            "Dedup resolved"
        );

        let mut report = CycleReport::default();
        let mut fresh: HashSet<Uuid> = HashSet::new();

        for accepted in &resolved.matches {
            let profile = &profiles[accepted.profile_index];
            let linked = link_all(tx, &profile.signal_ids, accepted.movement_id).await?;
            report.signals_linked += linked;
            report.matched.push(accepted.movement_id);
            if linked == 0 {
                continue;
            }

            fresh.insert(accepted.movement_id);
            if let Some(movement) = movements.iter_mut().find(|m| m.id == accepted.movement_id) {
                movement.momentum_score = profile.momentum_score.min(100);
                movement.last_signal_at = now;
                if !profile.summary.trim().is_empty() {
                    movement.summary = profile.summary.clone();
                }
            }
        }

        for &index in &resolved.new_profiles {
            let profile = &profiles[index];
            let movement =
                Movement::detected(&profile.name, &profile.summary, profile.momentum_score, now);
            tx.insert_movement(&movement).await?;

            let linked = link_all(tx, &profile.signal_ids, movement.id).await?;
            report.signals_linked += linked;
            if linked > 0 {
                fresh.insert(movement.id);
            }
            info!(movement_id = %movement.id, name = %movement.name, "New movement detected");
            report.created.push(movement.id);
            movements.push(movement);
        }

        for movement in &mut movements {
            let fresh_evidence = fresh.contains(&movement.id);
            let distinct_sources = if fresh_evidence {
                tx.distinct_sources(movement.id).await?
            } else {
                0
            };
            let observation = Observation {
                fresh_evidence,
                distinct_sources,
                hours_idle: movement.hours_idle(now),
            };

            let step = self.lifecycle.apply(movement, &observation, now);
            if step.momentum_after < step.momentum_before {
                report.decayed += 1;
            }
            if let Some(change) = step.change {
                info!(
                    movement_id = %movement.id,
                    from = %change.from,
                    to = %change.to,
                    momentum = movement.momentum_score,
                    "Movement stage changed"
                );
                report.transitions.push(TransitionRecord {
                    movement_id: movement.id,
                    name: movement.name.clone(),
                    from: change.from,
                    to: change.to,
                });
            }
            tx.update_movement(movement).await?;
        }

        Ok(report)
    }
}

/// Link every signal to the movement; returns how many links were new.
async fn link_all(
    tx: &mut dyn MovementTx,
    signal_ids: &[Uuid],
    movement_id: Uuid,
) -> Result<usize, Error> {
    let mut linked = 0;
    for &signal_id in signal_ids {
        if tx.link_signal(signal_id, movement_id).await? {
            linked += 1;
        }
    }
    Ok(linked)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::movements::{FeedItem, Signal};
    use crate::store::LibSqlBackend;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn cycle() -> MovementCycle {
        MovementCycle::new(&LifecycleConfig::default(), &DedupConfig::default())
    }

    async fn ingest(db: &LibSqlBackend, items: &[(&str, &str)]) -> Vec<Uuid> {
        let signals: Vec<Signal> = items
            .iter()
            .map(|(source, source_id)| {
                Signal::from_feed(
                    FeedItem {
                        source: source.to_string(),
                        source_id: source_id.to_string(),
                        title: format!("{source} {source_id}"),
                        content: String::new(),
                        url: None,
                        metadata: serde_json::Value::Null,
                    },
                    Utc::now(),
                )
            })
            .collect();
        db.insert_signals(&signals, Uuid::new_v4())
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect()
    }

    fn profile(name: &str, momentum: u8, signal_ids: Vec<Uuid>) -> MovementProfile {
        MovementProfile {
            name: name.to_string(),
            summary: format!("{name} summary"),
            momentum_score: momentum,
            signal_ids,
        }
    }

    #[tokio::test]
    async fn new_profile_becomes_movement_and_verifies_with_two_sources() {
        let db = test_db().await;
        let ids = ingest(&db, &[("reddit", "1"), ("hn", "2")]).await;

        let report = cycle()
            .run(&db, Uuid::new_v4(), &[profile("Repair cafes", 25, ids)], &[], Utc::now())
            .await
            .unwrap();

        assert_eq!(report.created.len(), 1);
        assert_eq!(report.signals_linked, 2);
        let movement = db.get_movement(report.created[0]).await.unwrap().unwrap();
        assert_eq!(movement.stage, Stage::Verified);
        assert_eq!(db.signals_for_movement(movement.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn matched_movement_takes_profile_momentum() {
        let db = test_db().await;
        let first = ingest(&db, &[("reddit", "1"), ("hn", "2")]).await;
        let c = cycle();
        let report = c
            .run(&db, Uuid::new_v4(), &[profile("Repair cafes", 25, first)], &[], Utc::now())
            .await
            .unwrap();
        let id = report.created[0];

        let second = ingest(&db, &[("reddit", "3")]).await;
        let proposals = [MatchProposal {
            profile_index: 0,
            movement_id: id,
            confidence: 0.9,
        }];
        let report = c
            .run(&db, Uuid::new_v4(), &[profile("Fix-it culture", 45, second)], &proposals, Utc::now())
            .await
            .unwrap();

        assert!(report.created.is_empty());
        assert_eq!(report.matched, vec![id]);
        let movement = db.get_movement(id).await.unwrap().unwrap();
        assert_eq!(movement.momentum_score, 45);
        assert_eq!(movement.stage, Stage::Growing);
        assert_eq!(movement.summary, "Fix-it culture summary");
    }

    #[tokio::test]
    async fn relinking_known_signals_is_not_fresh_evidence() {
        let db = test_db().await;
        let ids = ingest(&db, &[("reddit", "1"), ("hn", "2")]).await;
        let c = cycle();
        let report = c
            .run(&db, Uuid::new_v4(), &[profile("Repair cafes", 25, ids.clone())], &[], Utc::now())
            .await
            .unwrap();
        let id = report.created[0];

        // Same name, same signals, two days later.
        let later = Utc::now() + Duration::hours(48);
        let report = c
            .run(&db, Uuid::new_v4(), &[profile("repair cafes", 90, ids)], &[], later)
            .await
            .unwrap();

        assert_eq!(report.signals_linked, 0);
        let movement = db.get_movement(id).await.unwrap().unwrap();
        assert_eq!(movement.stage, Stage::Verified);
        assert!(movement.momentum_score < 25);
    }

    #[tokio::test]
    async fn silent_movements_decay_and_move_stage() {
        let db = test_db().await;
        let now = Utc::now();
        let mut trending = Movement::detected("Quiet quitting", "", 80, now);
        trending.stage = Stage::Trending;
        trending.last_signal_at = now - Duration::hours(30);

        let mut tx = db.begin_movement_tx().await.unwrap();
        tx.insert_movement(&trending).await.unwrap();
        tx.commit().await.unwrap();

        let report = cycle().run(&db, Uuid::new_v4(), &[], &[], now).await.unwrap();

        assert_eq!(report.transitions.len(), 1);
        assert_eq!(report.transitions[0].to, Stage::Peaked);
        assert_eq!(report.decayed, 1);
        let stored = db.get_movement(trending.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::Peaked);
        assert_eq!(stored.peak_momentum_score, 80);
        assert_eq!(stored.momentum_score, 73);
    }

    #[tokio::test]
    async fn same_name_profiles_in_one_scan_create_one_movement() {
        let db = test_db().await;
        let ids = ingest(&db, &[("reddit", "1"), ("hn", "2"), ("mastodon", "3")]).await;

        let report = cycle()
            .run(
                &db,
                Uuid::new_v4(),
                &[
                    profile("Repair cafes", 25, ids[..2].to_vec()),
                    profile("repair-cafes", 30, ids[1..].to_vec()),
                ],
                &[],
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(report.created.len(), 1);
        assert_eq!(report.signals_linked, 3);
        let movements = db.list_active_movements().await.unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].name, "Repair cafes");
        assert_eq!(movements[0].momentum_score, 30);
    }

    #[tokio::test]
    async fn a_job_applies_its_cycle_once() {
        let db = test_db().await;
        let now = Utc::now();
        let mut trending = Movement::detected("Quiet quitting", "", 80, now);
        trending.stage = Stage::Trending;
        trending.last_signal_at = now - Duration::hours(30);

        let mut tx = db.begin_movement_tx().await.unwrap();
        tx.insert_movement(&trending).await.unwrap();
        tx.commit().await.unwrap();

        let job_id = Uuid::new_v4();
        let c = cycle();
        let first = c.run(&db, job_id, &[], &[], now).await.unwrap();
        // The same job run again, e.g. re-queued after a crash before completing.
        let second = c
            .run(&db, job_id, &[], &[], now + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(second, first);
        let stored = db.get_movement(trending.id).await.unwrap().unwrap();
        assert_eq!(stored.momentum_score, 73);
        assert_eq!(stored.stage, Stage::Peaked);
    }

    #[tokio::test]
    async fn dormant_movements_are_not_touched() {
        let db = test_db().await;
        let now = Utc::now();
        let mut dormant = Movement::detected("Fidget spinners", "", 40, now);
        dormant.stage = Stage::Dormant;
        dormant.last_signal_at = now - Duration::hours(1000);

        let mut tx = db.begin_movement_tx().await.unwrap();
        tx.insert_movement(&dormant).await.unwrap();
        tx.commit().await.unwrap();

        let ids = ingest(&db, &[("reddit", "9")]).await;
        let proposals = [MatchProposal {
            profile_index: 0,
            movement_id: dormant.id,
            confidence: 1.0,
        }];
        let report = cycle()
            .run(&db, Uuid::new_v4(), &[profile("Fidget spinners", 60, ids)], &proposals, now)
            .await
            .unwrap();

        // The name collides, but a dormant movement is never revived.
        assert_eq!(report.created.len(), 1);
        let stored = db.get_movement(dormant.id).await.unwrap().unwrap();
        assert_eq!(stored.momentum_score, 40);
        assert_eq!(stored.stage, Stage::Dormant);
    }
}
