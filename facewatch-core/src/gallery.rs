//! Gallery of enrolled identities and its on-disk record.
//!
//! The whole gallery lives in one `bincode` file: a map from normalized
//! identity key to [`Identity`]. It is read wholesale on load and rewritten
//! wholesale (write to a temporary file, then rename) on every save.

use crate::embedding::Embedding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GalleryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Identity not found: {0}")]
    IdentityNotFound(String),
    #[error("Invalid identity name: {0:?}")]
    InvalidName(String),
    #[error("Embedding dimension {found} does not match gallery dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// One enrolled reference embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub embedding: Embedding,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub display_name: String,
    pub samples: Vec<Sample>,
    pub image_paths: Vec<PathBuf>,
}

/// Listing entry for an identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub key: String,
    pub display_name: String,
    pub sample_count: usize,
    pub image_path: Option<PathBuf>,
}

/// Normalize a display name into a gallery key: trimmed, case-folded,
/// with each run of whitespace collapsed into a single `_`.
pub fn identity_key(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Clone, Default)]
pub struct Gallery {
    identities: BTreeMap<String, Identity>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the gallery record. A missing file is an empty gallery.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, GalleryError> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No gallery at {}, starting empty", path.display());
            return Ok(Self::new());
        }

        let data = fs::read(path)?;
        let identities: BTreeMap<String, Identity> = bincode::deserialize(&data)
            .map_err(|e| GalleryError::Serialization(e.to_string()))?;
        Ok(Self { identities })
    }

    /// Load, falling back to an empty gallery when the record is unreadable
    pub fn load_or_empty<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(gallery) => gallery,
            Err(e) => {
                log::error!(
                    "Failed to load gallery {}: {}; continuing with an empty gallery",
                    path.as_ref().display(),
                    e
                );
                Self::new()
            }
        }
    }

    /// Rewrite the whole record
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), GalleryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let data = bincode::serialize(&self.identities)
            .map_err(|e| GalleryError::Serialization(e.to_string()))?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, path)?;

        log::debug!(
            "Saved gallery with {} identities to {}",
            self.identities.len(),
            path.display()
        );
        Ok(())
    }

    /// Embedding dimension shared by all stored samples, if any
    pub fn dimension(&self) -> Option<usize> {
        self.identities
            .values()
            .flat_map(|identity| identity.samples.first())
            .map(|sample| sample.embedding.len())
            .next()
    }

    /// Append samples and image references to an identity, creating it if
    /// new. Returns the identity key.
    pub fn enroll(
        &mut self,
        display_name: &str,
        samples: Vec<Sample>,
        image_paths: Vec<PathBuf>,
    ) -> Result<String, GalleryError> {
        let key = identity_key(display_name);
        if key.is_empty() {
            return Err(GalleryError::InvalidName(display_name.to_string()));
        }

        let expected = self.dimension().or_else(|| samples.first().map(|s| s.embedding.len()));
        if let Some(expected) = expected {
            if let Some(bad) = samples.iter().find(|s| s.embedding.len() != expected) {
                return Err(GalleryError::DimensionMismatch {
                    expected,
                    found: bad.embedding.len(),
                });
            }
        }

        let identity = self.identities.entry(key.clone()).or_insert_with(|| {
            log::info!("Creating identity {} ({})", display_name.trim(), key);
            Identity {
                display_name: display_name.trim().to_string(),
                samples: Vec::new(),
                image_paths: Vec::new(),
            }
        });
        identity.samples.extend(samples);
        identity.image_paths.extend(image_paths);

        Ok(key)
    }

    pub fn remove(&mut self, key: &str) -> Result<Identity, GalleryError> {
        self.identities
            .remove(key)
            .ok_or_else(|| GalleryError::IdentityNotFound(key.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&Identity> {
        self.identities.get(key)
    }

    /// Iterate `(key, identity)` in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Identity)> {
        self.identities.iter()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn list(&self) -> Vec<IdentitySummary> {
        self.identities
            .iter()
            .map(|(key, identity)| IdentitySummary {
                key: key.clone(),
                display_name: identity.display_name.clone(),
                sample_count: identity.samples.len(),
                image_path: identity.image_paths.first().cloned(),
            })
            .collect()
    }

    /// First stored image of an identity
    pub fn identity_image(&self, key: &str) -> Result<&Path, GalleryError> {
        let identity = self
            .identities
            .get(key)
            .ok_or_else(|| GalleryError::IdentityNotFound(key.to_string()))?;
        identity
            .image_paths
            .first()
            .map(PathBuf::as_path)
            .ok_or_else(|| GalleryError::IdentityNotFound(format!("{} has no image", key)))
    }

    /// Log one line per identity
    pub fn log_summary(&self) {
        log::info!("Loaded gallery with {} identities:", self.identities.len());
        for identity in self.identities.values() {
            log::info!(
                "  - {}: {} face samples",
                identity.display_name,
                identity.samples.len()
            );
        }
    }
}
