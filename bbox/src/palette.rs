//! Deterministic per-class overlay colours.

const COLORS: [[f32; 3]; 6] = [
    [1., 0., 1.],
    [0., 0., 1.],
    [0., 1., 1.],
    [0., 1., 0.],
    [1., 1., 0.],
    [1., 0., 0.],
];

/// Interpolate channel `channel` of the palette at position `x` of `max`.
pub fn get_color(channel: usize, x: usize, max: usize) -> f32 {
    let ratio = (x as f32 / max.max(1) as f32) * 5.;
    let i = ratio.floor() as usize;
    let j = ratio.ceil() as usize;
    let ratio = ratio - i as f32;
    (1. - ratio) * COLORS[i.min(5)][channel] + ratio * COLORS[j.min(5)][channel]
}

/// RGB colour in `[0, 1]` for `class` out of `classes`.
pub fn class_color(class: usize, classes: usize) -> [f32; 3] {
    let classes = classes.max(1);
    let offset = ((class as u64 * 123457) % classes as u64) as usize;
    [
        get_color(2, offset, classes),
        get_color(1, offset, classes),
        get_color(0, offset, classes),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_class_is_magenta() {
        assert_eq!(class_color(0, 80), [1., 0., 1.]);
    }

    #[test]
    fn test_color_is_deterministic() {
        for class in 0..80 {
            assert_eq!(class_color(class, 80), class_color(class, 80));
        }
        // 1 * 123457 % 80 == 17
        let ratio = 17. / 80. * 5.;
        let frac = ratio - 1.;
        let expected = [
            (1. - frac) * COLORS[1][2] + frac * COLORS[2][2],
            (1. - frac) * COLORS[1][1] + frac * COLORS[2][1],
            (1. - frac) * COLORS[1][0] + frac * COLORS[2][0],
        ];
        assert_eq!(class_color(1, 80), expected);
    }

    #[test]
    fn test_colors_in_range() {
        for class in 0..200 {
            for c in class_color(class, 91).iter() {
                assert!((0. ..=1.).contains(c));
            }
        }
    }
}
