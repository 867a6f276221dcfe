use super::darknet::DarknetEngine;
use gst::glib;
use gst::prelude::*;
use gst::{gst_debug, gst_info, gst_trace, gst_warning};
use gst_base::subclass::prelude::*;
use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::Mutex;
use yolo_pipeline::config::MAX_FRAMES;
use yolo_pipeline::{
    FailurePolicy, Labels, ModelPaths, Painter, Pipeline, PipelineConfig, PipelineMode,
    PixelLayout, TextStyle,
};

static CAT: Lazy<gst::DebugCategory> = Lazy::new(|| {
    gst::DebugCategory::new("yolo", gst::DebugColorFlags::empty(), Some("YOLO"))
});

const DEFAULT_SILENT: bool = true;
const DEFAULT_CFG: &str = "/usr/local/share/darknet/cfg/yolov3.cfg";
const DEFAULT_MODEL: &str = "/usr/local/share/darknet/cfg/yolov3.weights";
const DEFAULT_NAMES: &str = "/usr/local/share/darknet/data/coco.names";
const DEFAULT_LAYER: i32 = -1;
const DEFAULT_SINGLE_SLOT: bool = false;
const DEFAULT_PASSTHROUGH_ON_ERROR: bool = false;

const FORMATS: [gst_video::VideoFormat; 6] = [
    gst_video::VideoFormat::Bgr,
    gst_video::VideoFormat::Rgb,
    gst_video::VideoFormat::Bgrx,
    gst_video::VideoFormat::Rgbx,
    gst_video::VideoFormat::Xbgr,
    gst_video::VideoFormat::Xrgb,
];

#[derive(Debug, Clone)]
struct Settings {
    silent: bool,
    paths: ModelPaths,
    layer: i32,
    frames: u32,
    single_slot: bool,
    threshold: f32,
    nms: f32,
    throttle: u32,
    max_detections: u32,
    passthrough_on_error: bool,
    caption: TextStyle,
}

impl Default for Settings {
    fn default() -> Self {
        let config = PipelineConfig::default();
        Settings {
            silent: DEFAULT_SILENT,
            paths: ModelPaths {
                cfg: Some(DEFAULT_CFG.into()),
                weights: Some(DEFAULT_MODEL.into()),
                names: Some(DEFAULT_NAMES.into()),
                font: None,
            },
            layer: DEFAULT_LAYER,
            frames: config.frames as u32,
            single_slot: DEFAULT_SINGLE_SLOT,
            threshold: config.threshold,
            nms: config.nms,
            throttle: config.throttle,
            max_detections: config.max_detections as u32,
            passthrough_on_error: DEFAULT_PASSTHROUGH_ON_ERROR,
            caption: config.caption,
        }
    }
}

impl Settings {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            mode: if self.single_slot {
                PipelineMode::Single
            } else {
                PipelineMode::Ring
            },
            frames: self.frames as usize,
            threshold: self.threshold,
            nms: self.nms,
            throttle: self.throttle,
            max_detections: self.max_detections as usize,
            failure_policy: if self.passthrough_on_error {
                FailurePolicy::PassThrough
            } else {
                FailurePolicy::SkipCycle
            },
            layer: if self.layer >= 0 {
                Some(self.layer as usize)
            } else {
                None
            },
            verbose: !self.silent,
            caption: self.caption,
            ..Default::default()
        }
    }
}

struct State {
    info: gst_video::VideoInfo,
    layout: PixelLayout,
    /// `None` when the model could not be set up; buffers then pass through.
    pipeline: Option<Pipeline>,
}

#[derive(Default)]
pub struct Yolo {
    settings: Mutex<Settings>,
    state: Mutex<Option<State>>,
}

impl Yolo {
    fn build_pipeline(settings: &Settings, width: usize, height: usize) -> yolo_pipeline::Result<Pipeline> {
        let config = settings.pipeline_config();
        let paths = settings.paths.validate()?;

        let engine = DarknetEngine::load(&paths.cfg, &paths.weights)?;
        let labels = Labels::load(&paths.names)?;
        let painter = match &paths.font {
            Some(font) => Painter::with_font(font)?,
            None => Painter::new(),
        };

        let mut pipeline = Pipeline::new(config, labels, painter, width, height, Box::new(engine))?;
        pipeline.start()?;
        Ok(pipeline)
    }

    fn set_path(&self, obj: &super::Yolo, name: &str, value: &glib::Value) -> Option<PathBuf> {
        let path: Option<String> = value.get().expect("type checked upstream");
        let path = path.map(PathBuf::from);
        if let Some(path) = &path {
            if !path.exists() {
                gst_warning!(CAT, obj: obj, "File {} does not exist", path.display());
            }
        }
        gst_info!(CAT, obj: obj, "Changing {} to {:?}", name, path);
        path
    }
}

#[glib::object_subclass]
impl ObjectSubclass for Yolo {
    const NAME: &'static str = "Yolo";
    type Type = super::Yolo;
    type ParentType = gst_base::BaseTransform;
}

impl ObjectImpl for Yolo {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: Lazy<Vec<glib::ParamSpec>> = Lazy::new(|| {
            let config = PipelineConfig::default();
            let style = TextStyle::default();
            vec![
                glib::ParamSpecBoolean::new(
                    "silent",
                    "Silent",
                    "Suppress per-cycle detection summaries",
                    DEFAULT_SILENT,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecString::new(
                    "cfg",
                    "Cfg",
                    "Darknet network configuration file",
                    Some(DEFAULT_CFG),
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecString::new(
                    "model",
                    "Model",
                    "Darknet weights file",
                    Some(DEFAULT_MODEL),
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecString::new(
                    "names",
                    "Names",
                    "Class names file, one name per line",
                    Some(DEFAULT_NAMES),
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecString::new(
                    "font",
                    "Font",
                    "TrueType font for labels and captions (none: boxes only)",
                    None,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecInt::new(
                    "layer",
                    "Layer",
                    "Network layer to show instead of the frame in single-slot mode (-1: none)",
                    -1,
                    i32::MAX,
                    DEFAULT_LAYER,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecUInt::new(
                    "frames",
                    "Frames",
                    "Ring slots and number of cycles averaged",
                    1,
                    MAX_FRAMES as u32,
                    config.frames as u32,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecBoolean::new(
                    "single-slot",
                    "Single slot",
                    "Share one frame under a lock and draw live stats instead of the ring",
                    DEFAULT_SINGLE_SLOT,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecFloat::new(
                    "threshold",
                    "Threshold",
                    "Minimum class probability of a detection",
                    0.,
                    1.,
                    config.threshold,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecFloat::new(
                    "nms",
                    "NMS",
                    "IoU above which the weaker of two same-class boxes is dropped",
                    0.,
                    1.,
                    config.nms,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecUInt::new(
                    "throttle",
                    "Throttle",
                    "Process every n-th buffer",
                    1,
                    u32::MAX,
                    config.throttle,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecUInt::new(
                    "max-detections",
                    "Max detections",
                    "Detections kept per cycle",
                    1,
                    u32::MAX,
                    config.max_detections as u32,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecBoolean::new(
                    "passthrough-on-error",
                    "Pass through on error",
                    "Stop detecting and forward raw frames when inference fails",
                    DEFAULT_PASSTHROUGH_ON_ERROR,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecInt::new(
                    "xpos",
                    "X position",
                    "Caption x position",
                    0,
                    i32::MAX,
                    style.x,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecInt::new(
                    "ypos",
                    "Y position",
                    "Caption baseline y position",
                    0,
                    i32::MAX,
                    style.y,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecDouble::new(
                    "font-scale",
                    "Font scale",
                    "Caption font scale",
                    0.,
                    100.,
                    style.scale,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecInt::new(
                    "thickness",
                    "Thickness",
                    "Caption stroke thickness",
                    1,
                    100,
                    style.thickness,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecUInt::new(
                    "color-r",
                    "Red",
                    "Caption red component",
                    0,
                    255,
                    style.color[0] as u32,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecUInt::new(
                    "color-g",
                    "Green",
                    "Caption green component",
                    0,
                    255,
                    style.color[1] as u32,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecUInt::new(
                    "color-b",
                    "Blue",
                    "Caption blue component",
                    0,
                    255,
                    style.color[2] as u32,
                    glib::ParamFlags::READWRITE | gst::PARAM_FLAG_MUTABLE_READY,
                ),
                glib::ParamSpecUInt64::new(
                    "cycles",
                    "Cycles",
                    "Detection cycles completed",
                    0,
                    u64::MAX,
                    0,
                    glib::ParamFlags::READABLE | gst::PARAM_FLAG_MUTABLE_PLAYING,
                ),
                glib::ParamSpecDouble::new(
                    "detection-fps",
                    "Detection FPS",
                    "Rate of the last detection cycle",
                    0.,
                    f64::MAX,
                    0.,
                    glib::ParamFlags::READABLE | gst::PARAM_FLAG_MUTABLE_PLAYING,
                ),
            ]
        });

        PROPERTIES.as_ref()
    }

    fn set_property(
        &self,
        obj: &Self::Type,
        _id: usize,
        value: &glib::Value,
        pspec: &glib::ParamSpec,
    ) {
        match pspec.name() {
            "cfg" => {
                let path = self.set_path(obj, "cfg", value);
                self.settings.lock().unwrap().paths.cfg = path;
            }
            "model" => {
                let path = self.set_path(obj, "model", value);
                self.settings.lock().unwrap().paths.weights = path;
            }
            "names" => {
                let path = self.set_path(obj, "names", value);
                self.settings.lock().unwrap().paths.names = path;
            }
            "font" => {
                let path = self.set_path(obj, "font", value);
                self.settings.lock().unwrap().paths.font = path;
            }
            name => {
                let mut settings = self.settings.lock().unwrap();
                match name {
                    "silent" => settings.silent = value.get().expect("type checked upstream"),
                    "layer" => settings.layer = value.get().expect("type checked upstream"),
                    "frames" => settings.frames = value.get().expect("type checked upstream"),
                    "single-slot" => {
                        settings.single_slot = value.get().expect("type checked upstream")
                    }
                    "threshold" => {
                        settings.threshold = value.get().expect("type checked upstream")
                    }
                    "nms" => settings.nms = value.get().expect("type checked upstream"),
                    "throttle" => settings.throttle = value.get().expect("type checked upstream"),
                    "max-detections" => {
                        settings.max_detections = value.get().expect("type checked upstream")
                    }
                    "passthrough-on-error" => {
                        settings.passthrough_on_error = value.get().expect("type checked upstream")
                    }
                    "xpos" => settings.caption.x = value.get().expect("type checked upstream"),
                    "ypos" => settings.caption.y = value.get().expect("type checked upstream"),
                    "font-scale" => {
                        settings.caption.scale = value.get().expect("type checked upstream")
                    }
                    "thickness" => {
                        settings.caption.thickness = value.get().expect("type checked upstream")
                    }
                    "color-r" => {
                        settings.caption.color[0] =
                            value.get::<u32>().expect("type checked upstream") as u8
                    }
                    "color-g" => {
                        settings.caption.color[1] =
                            value.get::<u32>().expect("type checked upstream") as u8
                    }
                    "color-b" => {
                        settings.caption.color[2] =
                            value.get::<u32>().expect("type checked upstream") as u8
                    }
                    _ => unimplemented!(),
                }
                gst_info!(CAT, obj: obj, "Changed {}", name);
            }
        }
    }

    fn property(&self, _obj: &Self::Type, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        let path_value = |path: &Option<PathBuf>| {
            path.as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .to_value()
        };

        match pspec.name() {
            "cycles" => {
                let state = self.state.lock().unwrap();
                state
                    .as_ref()
                    .and_then(|s| s.pipeline.as_ref())
                    .map_or(0, |p| p.cycles())
                    .to_value()
            }
            "detection-fps" => {
                let state = self.state.lock().unwrap();
                state
                    .as_ref()
                    .and_then(|s| s.pipeline.as_ref())
                    .map_or(0., |p| p.detection_fps())
                    .to_value()
            }
            name => {
                let settings = self.settings.lock().unwrap();
                match name {
                    "silent" => settings.silent.to_value(),
                    "cfg" => path_value(&settings.paths.cfg),
                    "model" => path_value(&settings.paths.weights),
                    "names" => path_value(&settings.paths.names),
                    "font" => path_value(&settings.paths.font),
                    "layer" => settings.layer.to_value(),
                    "frames" => settings.frames.to_value(),
                    "single-slot" => settings.single_slot.to_value(),
                    "threshold" => settings.threshold.to_value(),
                    "nms" => settings.nms.to_value(),
                    "throttle" => settings.throttle.to_value(),
                    "max-detections" => settings.max_detections.to_value(),
                    "passthrough-on-error" => settings.passthrough_on_error.to_value(),
                    "xpos" => settings.caption.x.to_value(),
                    "ypos" => settings.caption.y.to_value(),
                    "font-scale" => settings.caption.scale.to_value(),
                    "thickness" => settings.caption.thickness.to_value(),
                    "color-r" => (settings.caption.color[0] as u32).to_value(),
                    "color-g" => (settings.caption.color[1] as u32).to_value(),
                    "color-b" => (settings.caption.color[2] as u32).to_value(),
                    _ => unimplemented!(),
                }
            }
        }
    }
}

impl GstObjectImpl for Yolo {}

impl ElementImpl for Yolo {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: Lazy<gst::subclass::ElementMetadata> = Lazy::new(|| {
            gst::subclass::ElementMetadata::new(
                "yolo",
                "Filter/Effect/Video",
                "YOLO object detection filter drawing boxes on the stream",
                "gst-yolo developers",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: Lazy<Vec<gst::PadTemplate>> = Lazy::new(|| {
            let mut caps = gst::Caps::new_empty();
            {
                let caps = caps.make_mut();
                for format in FORMATS.iter() {
                    caps.append_structure(
                        gst::Structure::builder("video/x-raw")
                            .field("format", format.to_str())
                            .field("width", gst::IntRange::new(1, i32::MAX))
                            .field("height", gst::IntRange::new(1, i32::MAX))
                            .field(
                                "framerate",
                                gst::FractionRange::new(
                                    gst::Fraction::new(0, 1),
                                    gst::Fraction::new(i32::MAX, 1),
                                ),
                            )
                            .build(),
                    );
                }
            }

            let src_pad_template = gst::PadTemplate::new(
                "src",
                gst::PadDirection::Src,
                gst::PadPresence::Always,
                &caps,
            )
            .unwrap();

            let sink_pad_template = gst::PadTemplate::new(
                "sink",
                gst::PadDirection::Sink,
                gst::PadPresence::Always,
                &caps,
            )
            .unwrap();

            vec![sink_pad_template, src_pad_template]
        });
        PAD_TEMPLATES.as_ref()
    }
}

impl BaseTransformImpl for Yolo {
    const MODE: gst_base::subclass::BaseTransformMode =
        gst_base::subclass::BaseTransformMode::AlwaysInPlace;
    const PASSTHROUGH_ON_SAME_CAPS: bool = false;
    const TRANSFORM_IP_ON_PASSTHROUGH: bool = false;

    fn unit_size(&self, _element: &Self::Type, caps: &gst::Caps) -> Option<usize> {
        gst_video::VideoInfo::from_caps(caps)
            .map(|info| info.size())
            .ok()
    }

    fn set_caps(
        &self,
        element: &Self::Type,
        incaps: &gst::Caps,
        _outcaps: &gst::Caps,
    ) -> Result<(), gst::LoggableError> {
        let info = match gst_video::VideoInfo::from_caps(incaps) {
            Err(_) => return Err(gst::loggable_error!(CAT, "Failed to parse input caps")),
            Ok(info) => info,
        };
        let layout = info
            .format()
            .to_str()
            .parse::<PixelLayout>()
            .map_err(|err| gst::loggable_error!(CAT, "{}", err))?;
        let (width, height) = (info.width() as usize, info.height() as usize);

        let mut state_guard = self.state.lock().unwrap();
        if let Some(state) = state_guard.as_mut() {
            if let Some(pipeline) = &state.pipeline {
                if let Err(err) = pipeline.check_dimensions(width, height) {
                    return Err(gst::loggable_error!(CAT, "{}", err));
                }
                state.info = info;
                state.layout = layout;
                gst_debug!(CAT, obj: element, "Renegotiated to {}", incaps);
                return Ok(());
            }
        }

        let settings = self.settings.lock().unwrap().clone();
        let pipeline = match Yolo::build_pipeline(&settings, width, height) {
            Ok(pipeline) => {
                gst_info!(
                    CAT,
                    obj: element,
                    "Detecting on {}x{} {:?} frames",
                    width,
                    height,
                    info.format()
                );
                Some(pipeline)
            }
            Err(err) => {
                gst_warning!(
                    CAT,
                    obj: element,
                    "Detection disabled, passing buffers through: {}",
                    err
                );
                None
            }
        };

        *state_guard = Some(State {
            info,
            layout,
            pipeline,
        });
        Ok(())
    }

    fn stop(&self, element: &Self::Type) -> Result<(), gst::ErrorMessage> {
        if let Some(mut state) = self.state.lock().unwrap().take() {
            if let Some(pipeline) = state.pipeline.as_mut() {
                pipeline.stop();
                gst_info!(
                    CAT,
                    obj: element,
                    "{} detection cycles completed",
                    pipeline.cycles()
                );
            }
        }

        gst_info!(CAT, obj: element, "Stopped");

        Ok(())
    }

    fn transform_ip(
        &self,
        element: &Self::Type,
        buf: &mut gst::BufferRef,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        let mut state_guard = self.state.lock().unwrap();
        let state = state_guard.as_mut().ok_or(gst::FlowError::NotNegotiated)?;
        let pipeline = match state.pipeline.as_mut() {
            Some(pipeline) => pipeline,
            None => return Ok(gst::FlowSuccess::Ok),
        };

        let offset = state.info.offset()[0];
        let stride = state.info.stride()[0] as usize;
        let mut map = buf.map_writable().map_err(|_| gst::FlowError::Error)?;
        let pixels = &mut map.as_mut_slice()[offset..];

        match pipeline.chain(pixels, state.layout, stride) {
            Ok(outcome) => gst_trace!(CAT, obj: element, "{:?}", outcome),
            Err(err) => gst_warning!(CAT, obj: element, "Buffer left untouched: {}", err),
        }

        Ok(gst::FlowSuccess::Ok)
    }
}
