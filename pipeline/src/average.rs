use crate::error::{PipelineError, Result};

/// Number of leading box coordinates in a region row.
const COORDS: usize = 4;
/// Column of the objectness score in a region row.
const OBJECTNESS: usize = 4;

/// Mean of the last `frames` snapshots of the raw detection-layer outputs.
///
/// Slots that were never recorded count as zero, so the mean under-reports
/// until `frames` cycles have been recorded.
pub struct RunningAverage {
    history: Vec<Vec<f32>>,
    mean: Vec<f32>,
}

impl RunningAverage {
    pub fn new(frames: usize, size: usize) -> Self {
        RunningAverage {
            history: vec![vec![0.; size]; frames.max(1)],
            mean: vec![0.; size],
        }
    }

    pub fn frames(&self) -> usize {
        self.history.len()
    }

    pub fn size(&self) -> usize {
        self.mean.len()
    }

    /// Store this cycle's outputs in history slot `cycle_index % frames`.
    pub fn record(&mut self, cycle_index: usize, raw_outputs: &[f32]) -> Result<()> {
        if raw_outputs.len() != self.size() {
            return Err(PipelineError::MalformedOutput(format!(
                "expected {} output values, got {}",
                self.size(),
                raw_outputs.len()
            )));
        }
        let slot = cycle_index % self.frames();
        self.history[slot].copy_from_slice(raw_outputs);
        Ok(())
    }

    /// Recompute the mean over every history slot.
    pub fn compute_mean(&mut self) -> &[f32] {
        let scale = 1. / self.frames() as f32;
        self.mean.iter_mut().for_each(|m| *m = 0.);
        for snapshot in &self.history {
            for (m, v) in self.mean.iter_mut().zip(snapshot.iter()) {
                *m += scale * v;
            }
        }
        &self.mean
    }

    /// Mean over region rows of `5 + classes` values.
    ///
    /// Objectness and class scores get the plain mean. Box coordinates are
    /// weighted by each snapshot's objectness, so empty or cold snapshots
    /// do not drag a box towards the origin.
    pub fn compute_region_mean(&mut self, classes: usize) -> Result<&[f32]> {
        let row = OBJECTNESS + 1 + classes;
        if self.size() % row != 0 {
            return Err(PipelineError::MalformedOutput(format!(
                "{} output values do not split into rows of {}",
                self.size(),
                row
            )));
        }

        self.compute_mean();
        for (r, mean) in self.mean.chunks_exact_mut(row).enumerate() {
            let base = r * row;
            let mut weight = 0.;
            let mut coords = [0.; COORDS];
            for snapshot in &self.history {
                let objectness = snapshot[base + OBJECTNESS];
                weight += objectness;
                for (c, v) in coords.iter_mut().zip(&snapshot[base..base + COORDS]) {
                    *c += objectness * v;
                }
            }
            for (m, c) in mean[..COORDS].iter_mut().zip(coords.iter()) {
                *m = if weight > 0. { c / weight } else { 0. };
            }
        }
        Ok(&self.mean)
    }
}
