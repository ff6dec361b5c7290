//! rollcall-core: Face detection, recognition and identity storage.
//!
//! SCRFD detection runs via ONNX Runtime; recognition is an LBPH model
//! retrained from the on-disk identity store and published as immutable
//! snapshots.

pub mod contacts;
pub mod detector;
pub mod raster;
pub mod recognizer;
pub mod store;
pub mod types;

pub use contacts::ContactDirectory;
pub use detector::{Detector, DetectorError, ScrfdDetector};
pub use recognizer::{LabelMapping, ModelSnapshot, ReferenceSample, SharedModel};
pub use store::{IdentityStore, StoreError};
pub use types::{FaceRegion, Identity, Prediction};

/// Default directory for ONNX model files.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/rollcall/models")
}
