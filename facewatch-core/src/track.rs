//! Short-lived face tracks across consecutive frames.
//!
//! Association is greedy: each detection joins the nearest surviving track
//! (cosine distance of embeddings) if it is close enough, otherwise it opens
//! a new track. This is not an optimal assignment. With several faces in
//! view two detections may land on the same track within one frame, and a
//! bipartite matching would be needed to rule that out.

use crate::config::TrackingConfig;
use crate::embedding::{self, Embedding};
use crate::extract::Detection;
use std::collections::BTreeMap;

pub type TrackId = u64;

#[derive(Debug, Clone)]
pub struct Track {
    id: TrackId,
    embedding: Embedding,
    detection: Detection,
    age: u32,
}

impl Track {
    pub fn id(&self) -> TrackId {
        self.id
    }

    /// Smoothed unit embedding
    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    /// Most recent detection assigned to this track
    pub fn detection(&self) -> &Detection {
        &self.detection
    }

    /// Updates since the track last received a detection
    pub fn age(&self) -> u32 {
        self.age
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    pub max_age: u32,
    pub distance_threshold: f32,
    pub smoothing: f32,
}

impl TrackerSettings {
    pub fn live(config: &TrackingConfig) -> Self {
        Self {
            max_age: config.max_age,
            distance_threshold: config.distance_threshold,
            smoothing: config.smoothing,
        }
    }

    pub fn preview(config: &TrackingConfig) -> Self {
        Self {
            max_age: config.preview_max_age,
            ..Self::live(config)
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::live(&TrackingConfig::default())
    }
}

pub struct TrackTable {
    settings: TrackerSettings,
    tracks: BTreeMap<TrackId, Track>,
    next_id: TrackId,
}

impl TrackTable {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            tracks: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Advance one frame: age and prune, then assign every detection to a
    /// track. Returns the current tracks in id order.
    pub fn update(&mut self, detections: Vec<Detection>) -> &BTreeMap<TrackId, Track> {
        let max_age = self.settings.max_age;
        self.tracks.retain(|id, track| {
            track.age += 1;
            if track.age > max_age {
                log::debug!("Track {} expired", id);
                false
            } else {
                true
            }
        });

        for detection in detections {
            match self.nearest(&detection.embedding) {
                Some(id) => self.refresh(id, detection),
                None => self.open(detection),
            }
        }

        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Closest track under the distance threshold; the lowest id wins a tie
    fn nearest(&self, embedding: &Embedding) -> Option<TrackId> {
        let mut best: Option<(TrackId, f32)> = None;
        for (&id, track) in &self.tracks {
            let Some(distance) = embedding::cosine_distance(embedding, &track.embedding) else {
                continue;
            };
            if distance >= self.settings.distance_threshold {
                continue;
            }
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((id, distance));
            }
        }
        best.map(|(id, _)| id)
    }

    fn refresh(&mut self, id: TrackId, detection: Detection) {
        let smoothing = self.settings.smoothing;
        if let Some(track) = self.tracks.get_mut(&id) {
            track.embedding = embedding::blend(&detection.embedding, &track.embedding, smoothing);
            track.detection = detection;
            track.age = 0;
        }
    }

    fn open(&mut self, detection: Detection) {
        let id = self.next_id;
        self.next_id += 1;
        log::debug!("Opened track {}", id);
        self.tracks.insert(
            id,
            Track {
                id,
                embedding: detection.embedding.clone(),
                detection,
                age: 0,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{from_vec, norm};
    use crate::extract::BoundingBox;
    use image::RgbImage;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn det(values: Vec<f32>) -> Detection {
        Detection {
            bbox: BoundingBox::new(0, 0, 10, 10),
            embedding: from_vec(values),
            confidence: 0.9,
            frame: Arc::new(RgbImage::new(1, 1)),
        }
    }

    fn table(max_age: u32) -> TrackTable {
        TrackTable::new(TrackerSettings {
            max_age,
            ..TrackerSettings::default()
        })
    }

    #[test]
    fn test_steady_face_keeps_one_track() {
        let mut tracker = table(10);
        for _ in 0..25 {
            let tracks = tracker.update(vec![det(vec![0.2, 0.9, 0.1])]);
            assert_eq!(tracks.len(), 1);
            let track = tracks.values().next().unwrap();
            assert_eq!(track.id(), 0);
            assert_eq!(track.age(), 0);
        }
    }

    #[test]
    fn test_track_expires_once_age_exceeds_max() {
        let max_age = 10;
        let mut tracker = table(max_age);
        tracker.update(vec![det(vec![1.0, 0.0])]);

        for step in 1..=max_age {
            let tracks = tracker.update(Vec::new());
            assert_eq!(tracks.len(), 1, "removed early at step {}", step);
            assert_eq!(tracks[&0].age(), step);
        }

        assert!(tracker.update(Vec::new()).is_empty());
    }

    #[test]
    fn test_distant_faces_never_merge() {
        let mut tracker = table(10);
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..50 {
            // Two faces jittering around orthogonal directions
            let a = det(vec![1.0, rng.gen_range(-0.05..0.05), 0.0]);
            let b = det(vec![0.0, rng.gen_range(-0.05..0.05), 1.0]);
            let tracks = tracker.update(vec![a, b]);
            assert_eq!(tracks.len(), 2);
            assert!(tracks.contains_key(&0));
            assert!(tracks.contains_key(&1));
        }
    }

    #[test]
    fn test_nearest_track_wins() {
        let mut tracker = table(10);
        tracker.update(vec![det(vec![1.0, 0.0, 0.0]), det(vec![0.0, 1.0, 0.0])]);

        let tracks = tracker.update(vec![det(vec![0.2, 1.0, 0.0])]);
        assert_eq!(tracks[&0].age(), 1);
        assert_eq!(tracks[&1].age(), 0);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut tracker = table(1);
        tracker.update(vec![det(vec![1.0, 0.0])]);
        tracker.update(Vec::new());
        tracker.update(Vec::new());
        assert!(tracker.is_empty());

        let tracks = tracker.update(vec![det(vec![1.0, 0.0])]);
        assert_eq!(tracks.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_smoothed_embedding_stays_unit_and_follows_input() {
        let mut tracker = table(10);
        tracker.update(vec![det(vec![1.0, 0.0])]);
        let tracks = tracker.update(vec![det(vec![0.9, 0.3])]);

        let track = &tracks[&0];
        let expected = embedding::blend(&from_vec(vec![0.9, 0.3]), &from_vec(vec![1.0, 0.0]), 0.7);
        assert!((norm(track.embedding()) - 1.0).abs() < 1e-6);
        assert!((track.embedding()[1] - expected[1]).abs() < 1e-6);
        assert!((track.detection().embedding[1] - from_vec(vec![0.9, 0.3])[1]).abs() < 1e-6);
    }

    #[test]
    fn test_every_detection_is_assigned() {
        fn fresh_ids(tracks: &BTreeMap<TrackId, Track>) -> Vec<TrackId> {
            tracks
                .iter()
                .filter(|(_, t)| t.age() == 0)
                .map(|(&id, _)| id)
                .collect()
        }

        let mut tracker = table(10);

        // Three unrelated faces open three tracks
        let tracks = tracker.update(vec![
            det(vec![1.0, 0.0, 0.0, 0.0]),
            det(vec![0.0, 1.0, 0.0, 0.0]),
            det(vec![0.0, 0.0, 1.0, 0.0]),
        ]);
        assert_eq!(tracks.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(fresh_ids(tracks), vec![0, 1, 2]);

        // Two refresh existing tracks, one newcomer opens track 3
        let tracks = tracker.update(vec![
            det(vec![1.0, 0.1, 0.0, 0.0]),
            det(vec![0.0, 0.0, 1.0, 0.1]),
            det(vec![0.0, 0.0, 0.0, 1.0]),
        ]);
        assert_eq!(tracks.len(), 4);
        assert_eq!(fresh_ids(tracks), vec![0, 2, 3]);
        assert_eq!(tracks[&1].age(), 1);

        // Two look-alikes both land on track 1 and nothing new opens
        let tracks = tracker.update(vec![
            det(vec![0.0, 1.0, 0.0, 0.0]),
            det(vec![0.1, 1.0, 0.0, 0.0]),
        ]);
        assert_eq!(tracks.len(), 4);
        assert_eq!(fresh_ids(tracks), vec![1]);

        let tracks = tracker.update(vec![det(vec![0.0, 0.0, 0.0, 1.0])]);
        assert_eq!(fresh_ids(tracks), vec![3]);
        assert_eq!(tracks.keys().max(), Some(&3));
    }
}
