use crate::types::{Landmark, PoseResult};

/// Per-landmark, per-axis exponential moving average over successive poses.
///
/// `smoothed = (1 - alpha) * raw + alpha * previous`, so a higher `alpha`
/// means more inertia. The first pose after construction or [`reset`] seeds
/// the state and passes through untouched.
///
/// [`reset`]: SmoothingFilter::reset
#[derive(Debug)]
pub struct SmoothingFilter {
    alpha: f32,
    prev: Option<PoseResult>,
}

impl SmoothingFilter {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            prev: None,
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.prev.is_some()
    }

    /// Smooths `raw` against the previous output. An absent detection passes
    /// through as absent and leaves the state alone.
    pub fn apply(&mut self, raw: Option<PoseResult>) -> Option<PoseResult> {
        let raw = raw?;

        let prev = match self.prev.as_ref() {
            Some(prev) if prev.len() == raw.len() => prev,
            Some(prev) => {
                log::warn!(
                    "landmark count changed from {} to {}, reseeding smoothing state",
                    prev.len(),
                    raw.len()
                );
                self.prev = Some(raw.clone());
                return Some(raw);
            }
            None => {
                self.prev = Some(raw.clone());
                return Some(raw);
            }
        };

        let a = self.alpha;
        // Same as (1 - a) * raw + a * prev, but exact when raw == prev.
        let blend = |raw: f32, prev: f32| raw + a * (prev - raw);
        let smoothed: PoseResult = raw
            .landmarks()
            .iter()
            .zip(prev.landmarks())
            .map(|(r, p)| Landmark::new(blend(r.x, p.x), blend(r.y, p.y), blend(r.z, p.z)))
            .collect::<Vec<_>>()
            .into();

        self.prev = Some(smoothed.clone());
        Some(smoothed)
    }

    pub fn reset(&mut self) {
        self.prev = None;
    }
}
