//! LBPH face recognizer.
//!
//! Local Binary Patterns Histograms over normalized 200x200 grayscale crops,
//! matched by nearest neighbour under the symmetric chi-square distance.
//! A trained model and its label mapping travel together as one immutable
//! [`ModelSnapshot`]; [`SharedModel`] publishes snapshots to readers.

use crate::raster;
use crate::types::{Identity, Prediction};
use image::GrayImage;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// --- Named constants ---
const LBP_GRID: usize = 8;
const LBP_BINS: usize = 256;
/// Clockwise 3x3 neighbourhood starting top-left (radius 1, 8 neighbours).
const LBP_NEIGHBOURS: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

/// Model-internal class id. Only meaningful together with the
/// [`LabelMapping`] of the snapshot that produced it.
pub type Label = u32;

/// One stored training image.
#[derive(Debug, Clone)]
pub struct ReferenceSample {
    pub identity: Identity,
    pub sequence: u32,
    pub image: GrayImage,
}

/// Label → identity table, assigned in enumeration order at train time.
#[derive(Debug, Clone, Default)]
pub struct LabelMapping {
    identities: Vec<Identity>,
}

impl LabelMapping {
    pub fn get(&self, label: Label) -> Option<&Identity> {
        self.identities.get(label as usize)
    }

    pub fn label_of(&self, employee_id: &str) -> Option<Label> {
        self.identities
            .iter()
            .position(|i| i.employee_id == employee_id)
            .map(|p| p as Label)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Label, &Identity)> {
        self.identities
            .iter()
            .enumerate()
            .map(|(i, id)| (i as Label, id))
    }
}

/// Trained LBPH state: one spatial histogram per training image.
#[derive(Debug, Clone, Default)]
pub struct LbphModel {
    histograms: Vec<(Label, Vec<f32>)>,
}

impl LbphModel {
    /// Train from `(label, face)` pairs. Faces are normalized to
    /// `FACE_SIZE` before histogramming.
    pub fn train<'a>(samples: impl IntoIterator<Item = (Label, &'a GrayImage)>) -> Self {
        let histograms = samples
            .into_iter()
            .map(|(label, face)| (label, spatial_histogram(&raster::normalize_face(face))))
            .collect();
        Self { histograms }
    }

    /// Nearest training histogram as `(label, distance)`; `None` if untrained.
    pub fn predict(&self, face: &GrayImage) -> Option<(Label, f64)> {
        if self.histograms.is_empty() {
            return None;
        }
        let probe = spatial_histogram(&raster::normalize_face(face));
        let mut best: Option<(Label, f64)> = None;
        for (label, hist) in &self.histograms {
            let dist = chi_square(&probe, hist);
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((*label, dist));
            }
        }
        best
    }

    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.histograms.len()
    }
}

/// A trained model paired with the mapping its labels refer to.
/// Never mutated once built.
#[derive(Debug, Clone, Default)]
pub struct ModelSnapshot {
    model: LbphModel,
    labels: LabelMapping,
}

impl ModelSnapshot {
    /// Snapshot that answers "unknown" to everything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Train over the complete sample set. Labels are assigned to employee
    /// ids in order of first appearance, so they change whenever the sample
    /// set does.
    pub fn train(samples: &[ReferenceSample]) -> Self {
        let mut labels = LabelMapping::default();
        let mut by_employee: HashMap<&str, Label> = HashMap::new();
        let mut pairs = Vec::with_capacity(samples.len());

        for sample in samples {
            let label = *by_employee
                .entry(sample.identity.employee_id.as_str())
                .or_insert_with(|| {
                    labels.identities.push(sample.identity.clone());
                    (labels.identities.len() - 1) as Label
                });
            pairs.push((label, &sample.image));
        }

        let model = LbphModel::train(pairs);
        if model.is_empty() {
            tracing::info!("no samples, recognizer disabled until first registration");
        } else {
            tracing::info!(
                images = model.len(),
                identities = labels.len(),
                "trained recognizer"
            );
        }
        Self { model, labels }
    }

    /// Classify a face crop, resolving the label through this snapshot's
    /// own mapping.
    pub fn predict(&self, face: &GrayImage) -> Prediction {
        match self.predict_label(face) {
            Some((label, confidence)) => Prediction {
                identity: self.labels.get(label).cloned(),
                confidence,
            },
            None => Prediction::unknown(),
        }
    }

    pub fn predict_label(&self, face: &GrayImage) -> Option<(Label, f64)> {
        self.model.predict(face)
    }

    pub fn labels(&self) -> &LabelMapping {
        &self.labels
    }

    pub fn sample_count(&self) -> usize {
        self.model.len()
    }
}

/// The currently published snapshot. Readers take an `Arc` and keep using
/// it for as long as they like; `install` swaps the whole pair at once.
pub struct SharedModel {
    current: RwLock<Arc<ModelSnapshot>>,
}

impl SharedModel {
    pub fn new(snapshot: ModelSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<ModelSnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Publish `snapshot`, returning the one it replaced.
    pub fn install(&self, snapshot: ModelSnapshot) -> Arc<ModelSnapshot> {
        let next = Arc::new(snapshot);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, next)
    }
}

impl Default for SharedModel {
    fn default() -> Self {
        Self::new(ModelSnapshot::empty())
    }
}

/// LBP code image, two pixels smaller than the input in each dimension.
fn lbp_codes(face: &GrayImage) -> (Vec<u8>, usize, usize) {
    let (w, h) = (face.width() as usize, face.height() as usize);
    if w < 3 || h < 3 {
        return (Vec::new(), 0, 0);
    }
    let raw = face.as_raw();
    let (cw, ch) = (w - 2, h - 2);
    let mut codes = vec![0u8; cw * ch];

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = raw[y * w + x];
            let mut code = 0u8;
            for (bit, (dx, dy)) in LBP_NEIGHBOURS.iter().enumerate() {
                let nx = (x as i64 + dx) as usize;
                let ny = (y as i64 + dy) as usize;
                if raw[ny * w + nx] >= center {
                    code |= 1 << bit;
                }
            }
            codes[(y - 1) * cw + (x - 1)] = code;
        }
    }

    (codes, cw, ch)
}

/// Concatenated per-cell LBP histograms, each normalized by the cell area.
fn spatial_histogram(face: &GrayImage) -> Vec<f32> {
    let (codes, cw, ch) = lbp_codes(face);
    let mut out = vec![0f32; LBP_GRID * LBP_GRID * LBP_BINS];
    let cell_w = cw / LBP_GRID;
    let cell_h = ch / LBP_GRID;
    if cell_w == 0 || cell_h == 0 {
        return out;
    }
    let area = (cell_w * cell_h) as f32;

    for gy in 0..LBP_GRID {
        for gx in 0..LBP_GRID {
            let base = (gy * LBP_GRID + gx) * LBP_BINS;
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    out[base + codes[y * cw + x] as usize] += 1.0;
                }
            }
            for bin in &mut out[base..base + LBP_BINS] {
                *bin /= area;
            }
        }
    }

    out
}

/// Symmetric chi-square distance: Σ 2(a−b)² / (a+b).
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let sum = (x + y) as f64;
            if sum > f64::EPSILON {
                let diff = (x - y) as f64;
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}
