use crate::embedding::{self, Embedding};
use crate::gallery::Gallery;
use std::fmt;

/// Outcome label of a gallery lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Known(String),
    Unknown,
}

impl Label {
    pub fn name(&self) -> &str {
        match self {
            Label::Known(name) => name,
            Label::Unknown => "Unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Label::Known(_))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub label: Label,
    /// Best similarity for a known match, 0 otherwise
    pub score: f32,
}

impl MatchOutcome {
    pub fn unknown() -> Self {
        Self {
            label: Label::Unknown,
            score: 0.0,
        }
    }
}

/// Exhaustive nearest-sample search over the gallery.
///
/// Cost is identities x samples per query, fine for galleries of tens of
/// people. A larger gallery would want an approximate nearest-neighbour
/// index here instead of the linear scan.
#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    threshold: f32,
}

impl Matcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Best identity whose similarity strictly exceeds the threshold.
    /// The first identity (in key order) reaching the maximum wins.
    pub fn best_match(&self, query: &Embedding, gallery: &Gallery) -> MatchOutcome {
        let mut best: Option<(&str, f32)> = None;

        for (_, identity) in gallery.iter() {
            for sample in &identity.samples {
                let Some(sim) = embedding::similarity(query, &sample.embedding) else {
                    log::trace!("Skipping sample of {} with mismatched dimension", identity.display_name);
                    continue;
                };
                if sim > self.threshold && best.map_or(true, |(_, score)| sim > score) {
                    best = Some((identity.display_name.as_str(), sim));
                }
            }
        }

        match best {
            Some((name, score)) => MatchOutcome {
                label: Label::Known(name.to_string()),
                score,
            },
            None => MatchOutcome::unknown(),
        }
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(0.5)
    }
}
