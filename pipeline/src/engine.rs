use crate::error::{PipelineError, Result, Truncated};
use crate::frame::{Frame, Letterbox};
use bbox::{filter_confident, Bbox, Detection};

/// Leading values of every output row before the class probabilities:
/// x, y, w, h, objectness.
pub const ROW_HEADER: usize = 5;

/// The neural network the worker runs once per cycle.
///
/// Outputs of all detection layers are exposed as one flat buffer of rows
/// `[x, y, w, h, objectness, p_0 .. p_{classes - 1}]`. Coordinates are
/// relative to the network input and class probabilities are already scaled
/// by objectness. The buffer keeps its length for the lifetime of the engine
/// and may be overwritten between `infer` and `decode_boxes`.
pub trait DetectionEngine: Send {
    /// Network input resolution as (width, height).
    fn input_size(&self) -> (usize, usize);

    fn class_count(&self) -> usize;

    fn infer(&mut self, input: &Frame) -> Result<()>;

    fn outputs(&self) -> &[f32];

    fn outputs_mut(&mut self) -> &mut [f32];

    fn decode_boxes(&self, letterbox: Option<&Letterbox>, threshold: f32) -> Result<Vec<Detection>> {
        decode_region_rows(self.outputs(), self.class_count(), letterbox, threshold)
    }

    /// Number of internal layers that can be visualised.
    fn layer_count(&self) -> usize {
        0
    }

    /// Activations of internal layer `layer` rendered as an image.
    fn layer_image(&mut self, _layer: usize) -> Result<Option<Frame>> {
        Ok(None)
    }
}

/// Turn region rows into detections above `threshold`.
pub fn decode_region_rows(
    outputs: &[f32],
    classes: usize,
    letterbox: Option<&Letterbox>,
    threshold: f32,
) -> Result<Vec<Detection>> {
    let row_len = ROW_HEADER + classes;
    if classes == 0 || outputs.len() % row_len != 0 {
        return Err(PipelineError::MalformedOutput(format!(
            "{} values do not form rows of {}",
            outputs.len(),
            row_len
        )));
    }

    let mut detections = vec![];
    for row in outputs.chunks_exact(row_len) {
        let objectness = row[4];
        if !(objectness > threshold) {
            continue;
        }
        let prob: Vec<f32> = row[ROW_HEADER..]
            .iter()
            .map(|p| if *p > threshold { *p } else { 0. })
            .collect();

        let mut bbox = Bbox::new(row[0], row[1], row[2], row[3]);
        if let Some(letterbox) = letterbox {
            letterbox.correct(&mut bbox);
        }
        detections.push(Detection::new(bbox, objectness, prob));
    }
    filter_confident(&mut detections, threshold);
    Ok(detections)
}

/// Keep the `max` most probable detections.
pub fn truncate_detections(detections: &mut Vec<Detection>, max: usize) -> Option<Truncated> {
    if detections.len() <= max {
        return None;
    }
    detections.sort_by(|a, b| {
        b.max_prob()
            .partial_cmp(&a.max_prob())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let dropped = detections.len() - max;
    detections.truncate(max);
    Some(Truncated { kept: max, dropped })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Engine replaying scripted output buffers, one per `infer` call.
    pub struct ScriptedEngine {
        pub input: (usize, usize),
        pub classes: usize,
        pub script: VecDeque<Result<Vec<f32>>>,
        pub fallback: Vec<f32>,
        pub outputs: Vec<f32>,
        pub inputs_seen: Arc<Mutex<Vec<Frame>>>,
    }

    impl ScriptedEngine {
        pub fn new(input: (usize, usize), classes: usize, fallback: Vec<f32>) -> Self {
            ScriptedEngine {
                input,
                classes,
                script: VecDeque::new(),
                outputs: vec![0.; fallback.len()],
                fallback,
                inputs_seen: Arc::new(Mutex::new(vec![])),
            }
        }

        pub fn then(mut self, step: Result<Vec<f32>>) -> Self {
            self.script.push_back(step);
            self
        }
    }

    impl DetectionEngine for ScriptedEngine {
        fn input_size(&self) -> (usize, usize) {
            self.input
        }

        fn class_count(&self) -> usize {
            self.classes
        }

        fn infer(&mut self, input: &Frame) -> Result<()> {
            self.inputs_seen.lock().unwrap().push(input.clone());
            let next = self
                .script
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))?;
            self.outputs.copy_from_slice(&next);
            Ok(())
        }

        fn outputs(&self) -> &[f32] {
            &self.outputs
        }

        fn outputs_mut(&mut self) -> &mut [f32] {
            &mut self.outputs
        }
    }

    /// One region row with a single class whose probability equals objectness.
    pub fn row(x: f32, y: f32, w: f32, h: f32, objectness: f32) -> Vec<f32> {
        vec![x, y, w, h, objectness, objectness]
    }
}
