use crate::config::TextStyle;
use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use crate::labels::Labels;
use crate::single::LiveStat;
use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use bbox::Detection;
use image::Rgb;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

/// Label height relative to the frame height.
const LABEL_HEIGHT_RATIO: f32 = 0.03;
/// Box line width relative to the frame height.
const BOX_WIDTH_RATIO: f32 = 0.006;
/// Pixel height of the single-slot detection labels.
const STAT_TEXT_PX: f32 = 16.;
/// Pixel height of the caption at scale 1.
const CAPTION_PX: f32 = 24.;

/// Draws boxes, labels and captions onto frames.
///
/// Text needs a TrueType font; a painter without one draws boxes only.
#[derive(Default)]
pub struct Painter {
    font: Option<FontVec>,
}

impl Painter {
    pub fn new() -> Self {
        Painter { font: None }
    }

    pub fn with_font<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let font = FontVec::try_from_vec(data).map_err(|_| PipelineError::Font(path.to_path_buf()))?;
        Ok(Painter { font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// One pixel rectangle outline, clamped to the frame.
    pub fn draw_box(&self, frame: &mut Frame, x1: i64, y1: i64, x2: i64, y2: i64, rgb: [f32; 3]) {
        if let Some(rect) = clamped_rect(frame, x1, y1, x2, y2) {
            draw_hollow_rect_mut(frame.image_mut(), rect, Rgb(rgb));
        }
    }

    /// Nested outlines shrinking inwards, `width` pixels thick.
    pub fn draw_box_width(
        &self,
        frame: &mut Frame,
        x1: i64,
        y1: i64,
        x2: i64,
        y2: i64,
        width: i64,
        rgb: [f32; 3],
    ) {
        for i in 0..width {
            self.draw_box(frame, x1 + i, y1 + i, x2 - i, y2 - i, rgb);
        }
    }

    pub fn fill_rect(&self, frame: &mut Frame, x1: i64, y1: i64, x2: i64, y2: i64, rgb: [f32; 3]) {
        let (x1, x2) = (x1.min(x2), x1.max(x2));
        let (y1, y2) = (y1.min(y2), y1.max(y2));
        if let Some(rect) = clamped_rect(frame, x1, y1, x2, y2) {
            draw_filled_rect_mut(frame.image_mut(), rect, Rgb(rgb));
        }
    }

    /// Width and height of `text` rendered `px` pixels high.
    pub fn text_size(&self, text: &str, px: f32) -> Option<(i64, i64)> {
        let font = self.font.as_ref()?;
        let (w, h) = text_size(PxScale::from(px), font, text);
        Some((w as i64, h as i64))
    }

    fn ascent(&self, px: f32) -> i64 {
        self.font
            .as_ref()
            .map_or(0., |f| f.as_scaled(PxScale::from(px)).ascent())
            .round() as i64
    }

    /// Draw `text` with its top left corner at `(x, top)`. Returns false when
    /// no font is loaded.
    pub fn draw_text(
        &self,
        frame: &mut Frame,
        text: &str,
        x: i64,
        top: i64,
        px: f32,
        rgb: [f32; 3],
    ) -> bool {
        let font = match &self.font {
            Some(font) => font,
            None => return false,
        };
        draw_text_mut(
            frame.image_mut(),
            Rgb(rgb),
            x as i32,
            top as i32,
            PxScale::from(px),
            font,
            text,
        );
        true
    }

    /// Boxes and labels of one ring cycle.
    ///
    /// Each box is coloured by its first class above `threshold` and is
    /// `max(1, 0.6%)` of the frame height thick; the label lists every class
    /// above the threshold on a background in the box colour.
    pub fn draw_detections(
        &self,
        frame: &mut Frame,
        detections: &[Detection],
        threshold: f32,
        labels: &Labels,
    ) {
        let (w, h) = frame.dimensions();
        let width = ((h as f32 * BOX_WIDTH_RATIO) as i64).max(1);

        for det in detections {
            let class = match det.primary_class(threshold) {
                Some(class) => class,
                None => continue,
            };
            let rgb = labels.color(class);
            let (left, top, right, bottom) = det.bbox.to_pixels(w, h);
            let (left, top, right, bottom) = (left as i64, top as i64, right as i64, bottom as i64);

            self.draw_box_width(frame, left, top, right, bottom, width, rgb);

            let text = labels.join(det.classes_above(threshold));
            self.draw_label(frame, &text, left, top + width, h as f32 * LABEL_HEIGHT_RATIO, rgb);
        }
    }

    /// Label with black text on a filled `rgb` background, placed above `top`
    /// when it fits and below it otherwise.
    fn draw_label(&self, frame: &mut Frame, text: &str, left: i64, top: i64, px: f32, rgb: [f32; 3]) {
        let (tw, th) = match self.text_size(text, px) {
            Some(size) => size,
            None => return,
        };
        let top = if top - th >= 0 { top - th } else { top };
        self.fill_rect(frame, left, top, left + tw, top + th, rgb);
        self.draw_text(frame, text, left, top, px, [0., 0., 0.]);
    }

    /// Single-slot overlays: a 2 pixel box and a `"<name> NN.NN%"` tag per
    /// live stat.
    pub fn draw_stats(&self, frame: &mut Frame, stats: &[LiveStat], labels: &Labels) {
        for stat in stats {
            let rgb = labels.color(stat.class);
            let text = format!("{} {:.2}%", labels.name(stat.class), stat.probability);

            if let Some((tw, th)) = self.text_size(&text, STAT_TEXT_PX) {
                let tag_w = (tw as f32 * 1.2) as i64;
                self.fill_rect(frame, stat.left, stat.top, stat.left + tag_w, stat.top - th * 2, rgb);
                let pad = tw / text.chars().count().max(1) as i64;
                let text_top = stat.top - th * 3 / 2;
                self.draw_text(frame, &text, stat.left + pad, text_top, STAT_TEXT_PX, [0., 0., 0.]);
            }
            self.draw_box_width(frame, stat.left, stat.top, stat.right, stat.bottom, 2, rgb);
        }
    }

    /// Timing caption with its baseline at the style's position; thickness
    /// above one is drawn as horizontally offset passes.
    pub fn draw_caption(&self, frame: &mut Frame, text: &str, style: &TextStyle) {
        let px = CAPTION_PX * style.scale as f32;
        let top = style.y as i64 - self.ascent(px);
        let rgb = [
            style.color[0] as f32 / 255.,
            style.color[1] as f32 / 255.,
            style.color[2] as f32 / 255.,
        ];
        for pass in 0..style.thickness.max(1) as i64 {
            if !self.draw_text(frame, text, style.x as i64 + pass, top, px, rgb) {
                break;
            }
        }
    }
}

/// Rectangle spanning `(x1, y1)..=(x2, y2)` clamped to the frame, or `None`
/// when nothing of it is left.
fn clamped_rect(frame: &Frame, x1: i64, y1: i64, x2: i64, y2: i64) -> Option<Rect> {
    let (w, h) = (frame.width() as i64, frame.height() as i64);
    if w == 0 || h == 0 || x2 < x1 || y2 < y1 {
        return None;
    }
    let x1 = x1.clamp(0, w - 1);
    let x2 = x2.clamp(0, w - 1);
    let y1 = y1.clamp(0, h - 1);
    let y2 = y2.clamp(0, h - 1);
    Some(Rect::at(x1 as i32, y1 as i32).of_size((x2 - x1 + 1) as u32, (y2 - y1 + 1) as u32))
}
