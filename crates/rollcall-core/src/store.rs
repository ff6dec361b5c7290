//! On-disk identity store.
//!
//! One image per reference sample, named
//! `{display_name}_{employee_id}_{sequence:03}.png`. Names are parsed from
//! the right so display names may themselves contain `_`.

use crate::raster;
use crate::recognizer::ReferenceSample;
use crate::types::Identity;
use image::GrayImage;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

const SAMPLE_EXTENSION: &str = "png";
const READABLE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity store I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sample image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("sample {0} already exists")]
    SampleExists(PathBuf),
    #[error("{0:?} is not a valid sample file name")]
    UnsafeName(String),
}

/// File name for one reference sample.
pub fn sample_file_name(identity: &Identity, sequence: u32) -> String {
    format!(
        "{}_{}_{:03}.{}",
        identity.display_name, identity.employee_id, sequence, SAMPLE_EXTENSION
    )
}

/// Parse `{name}_{id}_{seq}.{ext}` back into its identity and sequence.
pub fn parse_sample_file_name(file_name: &str) -> Option<(Identity, u32)> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if !READABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        return None;
    }
    let mut parts = stem.rsplitn(3, '_');
    let sequence: u32 = parts.next()?.parse().ok()?;
    let employee_id = parts.next()?;
    let name = parts.next()?;
    if name.is_empty() || employee_id.is_empty() {
        return None;
    }
    Some((Identity::new(name, employee_id), sequence))
}

/// Directory of reference samples.
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    /// Open (creating if needed) the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        tracing::info!(dir = %dir.display(), "identity store opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every parseable sample file as `(identity, sequence, path)`, sorted by
    /// file name so training order is deterministic.
    fn entries(&self) -> Result<Vec<(Identity, u32, PathBuf)>, StoreError> {
        let read = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut entries = Vec::new();
        for entry in read {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match parse_sample_file_name(name) {
                Some((identity, seq)) => entries.push((identity, seq, entry.path())),
                None if name.contains('.') && !name.ends_with(".json") => {
                    tracing::warn!(file = name, "skipping unrecognised sample filename");
                }
                None => {}
            }
        }
        entries.sort_by(|a, b| a.2.cmp(&b.2));
        Ok(entries)
    }

    /// Load all samples, normalized to the recognizer's raster size.
    /// Unreadable images are logged and skipped.
    pub fn samples(&self) -> Result<Vec<ReferenceSample>, StoreError> {
        let mut samples = Vec::new();
        for (identity, sequence, path) in self.entries()? {
            match image::open(&path) {
                Ok(img) => samples.push(ReferenceSample {
                    identity,
                    sequence,
                    image: raster::normalize_face(&img.to_luma8()),
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable sample");
                }
            }
        }
        Ok(samples)
    }

    /// First sequence number not yet used by `employee_id`.
    pub fn next_sequence(&self, employee_id: &str) -> Result<u32, StoreError> {
        Ok(self
            .entries()?
            .iter()
            .filter(|(identity, _, _)| identity.employee_id == employee_id)
            .map(|(_, seq, _)| seq + 1)
            .max()
            .unwrap_or(0))
    }

    /// The enrolled identity for `employee_id`, taken from its first sample.
    pub fn find_identity(&self, employee_id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|(identity, _, _)| identity.employee_id == employee_id)
            .map(|(identity, _, _)| identity))
    }

    /// Number of distinct identities and total samples on disk.
    pub fn counts(&self) -> Result<(usize, usize), StoreError> {
        let entries = self.entries()?;
        let mut ids: Vec<&str> = entries.iter().map(|(i, _, _)| i.employee_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok((ids.len(), entries.len()))
    }

    /// Write a new sample. Never overwrites: an existing file with the same
    /// name is an error.
    pub fn write_sample(
        &self,
        identity: &Identity,
        sequence: u32,
        face: &GrayImage,
    ) -> Result<PathBuf, StoreError> {
        let file_name = sample_file_name(identity, sequence);
        let mut components = Path::new(&file_name).components();
        let single = matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none();
        if !identity.is_file_safe() || !single {
            return Err(StoreError::UnsafeName(file_name));
        }
        let path = self.dir.join(file_name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| {
                if source.kind() == io::ErrorKind::AlreadyExists {
                    StoreError::SampleExists(path.clone())
                } else {
                    StoreError::Io {
                        path: path.clone(),
                        source,
                    }
                }
            })?;

        raster::normalize_face(face)
            .write_to(&mut BufWriter::new(file), image::ImageFormat::Png)
            .map_err(|source| StoreError::Image {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use tempfile::TempDir;

    fn face(v: u8) -> GrayImage {
        GrayImage::from_fn(raster::FACE_SIZE, raster::FACE_SIZE, |x, y| {
            Luma([v.wrapping_add(((x / 9 + y / 5) % 7) as u8 * 20)])
        })
    }

    #[test]
    fn test_file_name_roundtrip_with_underscored_name() {
        let id = Identity::new("mary ann", "e7");
        let name = sample_file_name(&id, 12);
        assert_eq!(name, "mary_ann_E7_012.png");
        assert_eq!(parse_sample_file_name(&name), Some((id, 12)));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(parse_sample_file_name("user_emails.json"), None);
        assert_eq!(parse_sample_file_name("alice_E001.png"), None);
        assert_eq!(parse_sample_file_name("alice_E001_x.png"), None);
        assert!(parse_sample_file_name("Alice_e001_003.JPG").is_some());
    }

    #[test]
    fn test_write_and_load_samples() {
        let tmp = TempDir::new().unwrap();
        let store = IdentityStore::open(tmp.path()).unwrap();
        let alice = Identity::new("alice", "E001");
        store.write_sample(&alice, 0, &face(40)).unwrap();
        store.write_sample(&alice, 1, &face(60)).unwrap();

        let samples = store.samples().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].sequence, 0);
        assert_eq!(samples[1].image, face(60));
        assert_eq!(store.counts().unwrap(), (1, 2));
    }

    #[test]
    fn test_write_never_overwrites() {
        let tmp = TempDir::new().unwrap();
        let store = IdentityStore::open(tmp.path()).unwrap();
        let alice = Identity::new("alice", "E001");
        store.write_sample(&alice, 0, &face(40)).unwrap();
        let err = store.write_sample(&alice, 0, &face(90)).unwrap_err();
        assert!(matches!(err, StoreError::SampleExists(_)));
        assert_eq!(store.samples().unwrap()[0].image, face(40));
    }

    #[test]
    fn test_next_sequence_per_employee() {
        let tmp = TempDir::new().unwrap();
        let store = IdentityStore::open(tmp.path()).unwrap();
        assert_eq!(store.next_sequence("E001").unwrap(), 0);

        let alice = Identity::new("alice", "E001");
        for seq in 0..10 {
            store.write_sample(&alice, seq, &face(seq as u8)).unwrap();
        }
        store.write_sample(&Identity::new("bob", "E002"), 0, &face(1)).unwrap();

        assert_eq!(store.next_sequence("E001").unwrap(), 10);
        assert_eq!(store.next_sequence("E002").unwrap(), 1);
        // A renamed update keeps counting from the same employee id.
        store.write_sample(&Identity::new("alicia", "E001"), 10, &face(3)).unwrap();
        assert_eq!(store.next_sequence("E001").unwrap(), 11);
    }

    #[test]
    fn test_find_identity() {
        let tmp = TempDir::new().unwrap();
        let store = IdentityStore::open(tmp.path()).unwrap();
        store.write_sample(&Identity::new("alice", "E001"), 0, &face(1)).unwrap();
        assert_eq!(
            store.find_identity("E001").unwrap(),
            Some(Identity::new("alice", "E001"))
        );
        assert_eq!(store.find_identity("E404").unwrap(), None);
    }

    #[test]
    fn test_write_refuses_paths_outside_store() {
        let tmp = TempDir::new().unwrap();
        let store = IdentityStore::open(tmp.path().join("known_faces")).unwrap();

        let err = store
            .write_sample(&Identity::new("../escaped", "E1"), 0, &face(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnsafeName(_)));
        assert!(!tmp.path().join("escaped_E1_000.png").exists());

        let err = store
            .write_sample(&Identity::new("alice", "A/B"), 0, &face(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnsafeName(_)));

        for identity in [Identity::new(".hidden", "E1"), Identity::new("alice", "E\\1")] {
            assert!(matches!(
                store.write_sample(&identity, 0, &face(1)),
                Err(StoreError::UnsafeName(_))
            ));
        }
        assert_eq!(store.counts().unwrap(), (0, 0));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);

        // The refused writes leave sequences untouched.
        let good = Identity::new("escaped", "E1");
        store.write_sample(&good, 0, &face(1)).unwrap();
        store.write_sample(&good, 1, &face(2)).unwrap();
        assert_eq!(store.next_sequence("E1").unwrap(), 2);
    }
}
