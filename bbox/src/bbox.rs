/// Box in normalized image coordinates, stored by its centre.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bbox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Return coordinate of the Bbox in the form of ((x1, y1), (x2, y2))
    pub fn coordinate(&self) -> ((f32, f32), (f32, f32)) {
        (
            (self.x - self.width / 2., self.y - self.height / 2.),
            (self.x + self.width / 2., self.y + self.height / 2.),
        )
    }

    pub fn iou(&self, target: &Bbox) -> f32 {
        let ((s_x1, s_y1), (s_x2, s_y2)) = self.coordinate();
        let ((t_x1, t_y1), (t_x2, t_y2)) = target.coordinate();

        let x_left = f32::max(s_x1, t_x1);
        let y_top = f32::max(s_y1, t_y1);
        let x_right = f32::min(s_x2, t_x2);
        let y_bottom = f32::min(s_y2, t_y2);

        if x_right <= x_left || y_bottom <= y_top {
            0.
        } else {
            let intersect_area = (x_right - x_left) * (y_bottom - y_top);
            let union_area = self.area() + target.area() - intersect_area;

            intersect_area / union_area
        }
    }

    /// Pixel rectangle `(left, top, right, bottom)` on a `width`x`height` image,
    /// clamped to the image.
    pub fn to_pixels(&self, width: usize, height: usize) -> (usize, usize, usize, usize) {
        let (w, h) = (width as f32, height as f32);
        let clamp = |v: f32, max: usize| (v as i64).clamp(0, max.saturating_sub(1) as i64) as usize;

        let ((x1, y1), (x2, y2)) = self.coordinate();
        (
            clamp(x1 * w, width),
            clamp(y1 * h, height),
            clamp(x2 * w, width),
            clamp(y2 * h, height),
        )
    }
}

/// One candidate object produced by an inference cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: Bbox,
    pub objectness: f32,
    /// Probability per class, zero for classes at or below the threshold.
    pub prob: Vec<f32>,
}

impl Detection {
    pub fn new(bbox: Bbox, objectness: f32, prob: Vec<f32>) -> Self {
        Self {
            bbox,
            objectness,
            prob,
        }
    }

    /// Classes whose probability is strictly above `threshold`, in class order.
    pub fn classes_above(&self, threshold: f32) -> impl Iterator<Item = usize> + '_ {
        self.prob
            .iter()
            .enumerate()
            .filter(move |(_, p)| **p > threshold)
            .map(|(class, _)| class)
    }

    /// The class an overlay is coloured by: the first one above `threshold`.
    pub fn primary_class(&self, threshold: f32) -> Option<usize> {
        self.classes_above(threshold).next()
    }

    pub fn max_prob(&self) -> f32 {
        self.prob.iter().cloned().fold(0., f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_same() {
        let a = Bbox::new(1., 1., 2., 2.);
        let b = Bbox::new(1., 1., 2., 2.);

        let expected: f32 = 1.;
        assert_eq!(a.iou(&b), expected);
    }

    #[test]
    fn test_iou_quarter() {
        let a = Bbox::new(1., 1., 2., 2.);
        let b = Bbox::new(2., 2., 2., 2.);

        let expected: f32 = 1. / 7.;
        assert_eq!(a.iou(&b), expected);
    }

    #[test]
    fn test_iou_none() {
        let a = Bbox::new(1., 1., 2., 2.);
        let b = Bbox::new(3., 3., 2., 2.);

        let expected: f32 = 0.;
        assert_eq!(a.iou(&b), expected);
    }

    #[test]
    fn test_to_pixels_clamped() {
        let b = Bbox::new(0.5, 0.5, 0.25, 0.5);
        assert_eq!(b.to_pixels(100, 50), (37, 12, 62, 37));

        let edge = Bbox::new(0., 1., 0.5, 0.5);
        assert_eq!(edge.to_pixels(100, 50), (0, 37, 25, 49));
    }

    #[test]
    fn test_primary_class_is_first_above_threshold() {
        let det = Detection::new(Bbox::new(0.5, 0.5, 0.1, 0.1), 0.9, vec![0.2, 0.7, 0.9]);
        assert_eq!(det.primary_class(0.5), Some(1));
        assert_eq!(det.classes_above(0.5).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(det.primary_class(0.95), None);
    }
}
