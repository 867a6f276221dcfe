use crate::Detection;
use std::cmp::Ordering;

/// Class-wise greedy non-max suppression.
///
/// For every class the detections are visited in descending probability;
/// each one zeroes the probability of that class on every later detection
/// overlapping it by more than `iou_threshold`. Detections left without any
/// non-zero class probability are removed.
pub fn do_nms_sort(detections: &mut Vec<Detection>, classes: usize, iou_threshold: f32) {
    if detections.is_empty() {
        return;
    }

    let mut order: Vec<usize> = (0..detections.len()).collect();
    for class in 0..classes {
        order.sort_by(|&a, &b| {
            let pa = detections[a].prob.get(class).cloned().unwrap_or(0.);
            let pb = detections[b].prob.get(class).cloned().unwrap_or(0.);
            pb.partial_cmp(&pa).unwrap_or(Ordering::Equal)
        });

        for i in 0..order.len() {
            let a = order[i];
            if detections[a].prob.get(class).map_or(true, |p| *p == 0.) {
                continue;
            }
            let kept = detections[a].bbox;
            for &b in &order[i + 1..] {
                if kept.iou(&detections[b].bbox) > iou_threshold {
                    if let Some(p) = detections[b].prob.get_mut(class) {
                        *p = 0.;
                    }
                }
            }
        }
    }

    detections.retain(|det| det.prob.iter().any(|p| *p > 0.));
}

/// Keep detections with at least one class probability strictly above
/// `threshold`.
pub fn filter_confident(detections: &mut Vec<Detection>, threshold: f32) {
    detections.retain(|det| det.primary_class(threshold).is_some());
}
