use serde::{Deserialize, Serialize};

/// An enrolled person. `employee_id` is the stable key; the display name is
/// carried along but never used to identify anyone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub display_name: String,
    pub employee_id: String,
}

impl Identity {
    /// Build an identity from operator input, normalizing both fields.
    pub fn new(display_name: &str, employee_id: &str) -> Self {
        Self {
            display_name: normalize_name(display_name),
            employee_id: normalize_employee_id(employee_id),
        }
    }

    /// Display name in title case with separators turned back into spaces
    /// ("mary_ann" → "Mary Ann").
    pub fn title_name(&self) -> String {
        self.display_name
            .split('_')
            .filter(|w| !w.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Both fields can be embedded in a sample file name without naming
    /// another directory.
    pub fn is_file_safe(&self) -> bool {
        is_file_safe(&self.display_name) && is_file_safe(&self.employee_id)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.title_name(), self.employee_id)
    }
}

/// Lower-case the name and join whitespace-separated words with `_`.
pub fn normalize_name(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Non-empty, no path separators or NUL, and no leading `.`.
pub fn is_file_safe(field: &str) -> bool {
    !field.is_empty() && !field.starts_with('.') && !field.contains(['/', '\\', '\0'])
}

/// Employee ids compare case-insensitively; upper case is canonical.
pub fn normalize_employee_id(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Axis-aligned face box in pixel coordinates of the image it was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Map a region found on an image downscaled by `factor` back to the
    /// full-resolution image.
    pub fn upscaled(&self, factor: f32) -> Self {
        let up = |v: u32| (v as f32 / factor) as u32;
        Self {
            x: up(self.x),
            y: up(self.y),
            width: up(self.width),
            height: up(self.height),
        }
    }

    /// Clip the region to a `width` × `height` image. Returns `None` when
    /// nothing of it is left.
    pub fn clamped(&self, width: u32, height: u32) -> Option<Self> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(Self::new(self.x, self.y, w, h))
    }
}

/// Outcome of classifying one face crop against a model snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// `None` when the model is untrained or has no candidates.
    pub identity: Option<Identity>,
    /// Distance to the nearest training sample. Lower is a stronger match.
    pub confidence: f64,
}

impl Prediction {
    pub fn unknown() -> Self {
        Self {
            identity: None,
            confidence: f64::MAX,
        }
    }

    /// The identity, if the match is stronger than `threshold`.
    pub fn recognized(&self, threshold: f64) -> Option<&Identity> {
        match &self.identity {
            Some(identity) if self.confidence < threshold => Some(identity),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_normalization() {
        let id = Identity::new("  Mary  Ann ", " e001 ");
        assert_eq!(id.display_name, "mary_ann");
        assert_eq!(id.employee_id, "E001");
    }

    #[test]
    fn test_file_safe_fields() {
        assert!(Identity::new("mary ann", "e001").is_file_safe());
        assert!(Identity::new("o'brien", "X-9").is_file_safe());
        for (name, id) in [
            ("../escaped", "E1"),
            ("alice", "A/B"),
            ("alice", "A\\B"),
            (".hidden", "E1"),
            ("alice", ".."),
            ("ali\0ce", "E1"),
            ("alice", ""),
        ] {
            assert!(!Identity::new(name, id).is_file_safe(), "{name:?} {id:?}");
        }
    }

    #[test]
    fn test_title_name() {
        let id = Identity::new("mary ann", "E1");
        assert_eq!(id.title_name(), "Mary Ann");
        assert_eq!(id.to_string(), "Mary Ann (E1)");
    }

    #[test]
    fn test_region_upscaled() {
        let r = FaceRegion::new(10, 20, 30, 40).upscaled(0.5);
        assert_eq!(r, FaceRegion::new(20, 40, 60, 80));
    }

    #[test]
    fn test_region_clamped() {
        let r = FaceRegion::new(90, 90, 30, 30);
        assert_eq!(r.clamped(100, 100), Some(FaceRegion::new(90, 90, 10, 10)));
        assert_eq!(r.clamped(50, 50), None);
    }

    #[test]
    fn test_prediction_threshold() {
        let p = Prediction {
            identity: Some(Identity::new("alice", "E001")),
            confidence: 59.9,
        };
        assert!(p.recognized(60.0).is_some());
        assert!(p.recognized(50.0).is_none());
        assert!(Prediction::unknown().recognized(60.0).is_none());
    }
}
