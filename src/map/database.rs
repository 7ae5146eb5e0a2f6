//! Landmark database.
//!
//! Two owned maps keyed by id: the landmark parameters, and the observation
//! table `host → target → observations`. Both use `BTreeMap` so iteration
//! (and therefore linearization and marginalization) is deterministic.

use std::collections::{BTreeMap, BTreeSet};

use super::landmark::{FrameCamId, KeypointId, KeypointObservation, Landmark};

pub type ObservationMap = BTreeMap<FrameCamId, BTreeMap<FrameCamId, Vec<KeypointObservation>>>;

#[derive(Debug, Default)]
pub struct LandmarkDatabase {
    landmarks: BTreeMap<KeypointId, Landmark>,
    observations: ObservationMap,
}

impl LandmarkDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_landmark(&mut self, id: KeypointId, landmark: Landmark) {
        assert_eq!(
            landmark.host.cam_id, 0,
            "landmark {} must be hosted in camera 0",
            id
        );
        self.landmarks.insert(id, landmark);
    }

    pub fn landmark_exists(&self, id: KeypointId) -> bool {
        self.landmarks.contains_key(&id)
    }

    pub fn get_landmark(&self, id: KeypointId) -> &Landmark {
        self.landmarks
            .get(&id)
            .unwrap_or_else(|| panic!("landmark {} missing from database", id))
    }

    pub fn get_landmark_mut(&mut self, id: KeypointId) -> &mut Landmark {
        self.landmarks
            .get_mut(&id)
            .unwrap_or_else(|| panic!("landmark {} missing from database", id))
    }

    pub fn landmarks(&self) -> impl Iterator<Item = (&KeypointId, &Landmark)> {
        self.landmarks.iter()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    /// Record an observation of an existing landmark in `target`.
    pub fn add_observation(&mut self, target: FrameCamId, obs: KeypointObservation) {
        let host = self.get_landmark(obs.kpt_id).host;
        self.observations
            .entry(host)
            .or_default()
            .entry(target)
            .or_default()
            .push(obs);
    }

    pub fn observations(&self) -> &ObservationMap {
        &self.observations
    }

    pub fn num_observations(&self, id: KeypointId) -> usize {
        let Some(landmark) = self.landmarks.get(&id) else {
            return 0;
        };
        self.observations
            .get(&landmark.host)
            .map(|targets| {
                targets
                    .values()
                    .flat_map(|obs| obs.iter())
                    .filter(|o| o.kpt_id == id)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop a single observation of `id` in `target`.
    pub fn remove_observation(&mut self, id: KeypointId, target: FrameCamId) {
        let host = self.get_landmark(id).host;
        if let Some(targets) = self.observations.get_mut(&host) {
            if let Some(obs) = targets.get_mut(&target) {
                obs.retain(|o| o.kpt_id != id);
                if obs.is_empty() {
                    targets.remove(&target);
                }
            }
            if targets.is_empty() {
                self.observations.remove(&host);
            }
        }
    }

    /// Delete a landmark together with all of its observations.
    pub fn remove_landmark(&mut self, id: KeypointId) {
        let Some(landmark) = self.landmarks.remove(&id) else {
            return;
        };
        if let Some(targets) = self.observations.get_mut(&landmark.host) {
            targets.retain(|_, obs| {
                obs.retain(|o| o.kpt_id != id);
                !obs.is_empty()
            });
            if targets.is_empty() {
                self.observations.remove(&landmark.host);
            }
        }
    }

    /// Apply a marginalization event to the database.
    ///
    /// Landmarks hosted in a marginalized keyframe leave the estimator
    /// entirely, observations included. Surviving landmarks drop every
    /// observation whose target frame was removed from the window.
    pub fn remove_keyframes(
        &mut self,
        kfs_to_marg: &BTreeSet<i64>,
        poses_to_marg: &BTreeSet<i64>,
        states_to_marg_all: &BTreeSet<i64>,
    ) {
        let dead: Vec<KeypointId> = self
            .landmarks
            .iter()
            .filter(|(_, lm)| kfs_to_marg.contains(&lm.host.frame_id))
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.remove_landmark(id);
        }

        for targets in self.observations.values_mut() {
            targets.retain(|target, _| {
                !poses_to_marg.contains(&target.frame_id)
                    && !states_to_marg_all.contains(&target.frame_id)
            });
        }
        self.observations.retain(|_, targets| !targets.is_empty());
    }
}
