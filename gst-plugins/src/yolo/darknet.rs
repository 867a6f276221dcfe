use nom::branch::alt;
use nom::bytes::complete::take_till;
use nom::character::complete::char;
use nom::combinator::{map, rest};
use nom::sequence::{delimited, separated_pair};
use nom::IResult;
use opencv::core::{self, Mat, Scalar, Size, Vector};
use opencv::dnn;
use opencv::prelude::*;
use std::path::Path;
use yolo_pipeline::{DetectionEngine, Frame, PipelineError, Result};

/// What the plugin needs to know from a darknet `.cfg` before loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkShape {
    pub width: usize,
    pub height: usize,
    pub classes: usize,
}

enum Line<'a> {
    Section(&'a str),
    Entry(&'a str, &'a str),
}

fn section(input: &str) -> IResult<&str, &str> {
    delimited(char('['), take_till(|c| c == ']'), char(']'))(input)
}

fn entry(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(take_till(|c| c == '='), char('='), rest)(input)
}

fn line(input: &str) -> IResult<&str, Line<'_>> {
    alt((
        map(section, |name: &str| Line::Section(name.trim())),
        map(entry, |(key, value): (&str, &str)| {
            Line::Entry(key.trim(), value.trim())
        }),
    ))(input)
}

/// Read `[net]` width/height and the class count of the last detection
/// section.
pub fn parse_cfg(text: &str) -> Result<NetworkShape> {
    let mut current = "";
    let (mut width, mut height, mut classes) = (None, None, None);

    for (number, raw) in text.lines().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') || raw.starts_with(';') {
            continue;
        }
        let parsed = match line(raw) {
            Ok((_, parsed)) => parsed,
            Err(_) => {
                return Err(PipelineError::ModelLoad(format!(
                    "cfg line {} is neither a section nor an entry: {}",
                    number + 1,
                    raw
                )))
            }
        };

        match parsed {
            Line::Section(name) => current = name,
            Line::Entry(key, value) => {
                let parse_number = || {
                    value.parse::<usize>().map_err(|_| {
                        PipelineError::ModelLoad(format!(
                            "cfg line {}: {} is not a number",
                            number + 1,
                            value
                        ))
                    })
                };
                match (current, key) {
                    ("net" | "network", "width") => width = Some(parse_number()?),
                    ("net" | "network", "height") => height = Some(parse_number()?),
                    ("yolo" | "region" | "detection", "classes") => classes = Some(parse_number()?),
                    _ => (),
                }
            }
        }
    }

    match (width, height, classes) {
        (Some(width), Some(height), Some(classes)) if width > 0 && height > 0 && classes > 0 => {
            Ok(NetworkShape {
                width,
                height,
                classes,
            })
        }
        _ => Err(PipelineError::ModelLoad(
            "cfg lacks [net] width/height or a detection layer with classes".into(),
        )),
    }
}

fn cv_err(err: opencv::Error) -> PipelineError {
    PipelineError::Inference(err.to_string())
}

/// Darknet network run through the OpenCV DNN module.
pub struct DarknetEngine {
    net: dnn::Net,
    shape: NetworkShape,
    output_names: Vector<String>,
    layer_names: Vector<String>,
    outputs: Vec<f32>,
}

// The network is only ever touched by the thread that owns the engine.
unsafe impl Send for DarknetEngine {}

impl DarknetEngine {
    pub fn load(cfg: &Path, weights: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(cfg).map_err(|source| PipelineError::Io {
            path: cfg.to_path_buf(),
            source,
        })?;
        let shape = parse_cfg(&text)?;

        let path_str = |p: &Path| {
            p.to_str()
                .map(str::to_owned)
                .ok_or_else(|| PipelineError::ModelLoad(format!("{} is not UTF-8", p.display())))
        };
        let load_err = |e: opencv::Error| PipelineError::ModelLoad(e.to_string());

        let mut net =
            dnn::read_net_from_darknet(&path_str(cfg)?, &path_str(weights)?).map_err(load_err)?;
        net.set_preferable_backend(dnn::DNN_BACKEND_OPENCV)
            .map_err(load_err)?;
        net.set_preferable_target(dnn::DNN_TARGET_CPU)
            .map_err(load_err)?;
        let output_names = net.get_unconnected_out_layers_names().map_err(load_err)?;
        let layer_names = net.get_layer_names().map_err(load_err)?;

        let mut engine = DarknetEngine {
            net,
            shape,
            output_names,
            layer_names,
            outputs: vec![],
        };

        // Size the output buffer once; the averaging history depends on it.
        let warm_up = Frame::new(shape.width, shape.height);
        let outs = engine.forward(&warm_up)?;
        engine.outputs = flatten(&outs, shape.classes)?;
        Ok(engine)
    }

    pub fn shape(&self) -> NetworkShape {
        self.shape
    }

    fn forward(&mut self, input: &Frame) -> Result<Vector<Mat>> {
        let (w, h) = input.dimensions();
        let image = Mat::from_slice(input.data()).map_err(cv_err)?;
        let image = image.reshape(3, h as i32).map_err(cv_err)?;
        let blob = dnn::blob_from_image(
            &image,
            1.,
            Size::new(w as i32, h as i32),
            Scalar::default(),
            false,
            false,
            core::CV_32F,
        )
        .map_err(cv_err)?;

        self.net
            .set_input(&blob, "", 1., Scalar::default())
            .map_err(cv_err)?;
        let mut outs = Vector::<Mat>::new();
        self.net
            .forward_layer(&mut outs, &self.output_names)
            .map_err(cv_err)?;
        Ok(outs)
    }
}

/// Concatenate region-layer outputs into one row buffer.
fn flatten(outs: &Vector<Mat>, classes: usize) -> Result<Vec<f32>> {
    let mut flat = vec![];
    for out in outs.iter() {
        if out.cols() as usize != 5 + classes {
            return Err(PipelineError::MalformedOutput(format!(
                "detection layer has {} columns, expected {}",
                out.cols(),
                5 + classes
            )));
        }
        flat.extend_from_slice(out.data_typed::<f32>().map_err(cv_err)?);
    }
    Ok(flat)
}

impl DetectionEngine for DarknetEngine {
    fn input_size(&self) -> (usize, usize) {
        (self.shape.width, self.shape.height)
    }

    fn class_count(&self) -> usize {
        self.shape.classes
    }

    fn infer(&mut self, input: &Frame) -> Result<()> {
        if input.dimensions() != self.input_size() {
            return Err(PipelineError::Inference(format!(
                "input is {:?}, network expects {:?}",
                input.dimensions(),
                self.input_size()
            )));
        }
        let outs = self.forward(input)?;
        let flat = flatten(&outs, self.shape.classes)?;
        if flat.len() != self.outputs.len() {
            return Err(PipelineError::MalformedOutput(format!(
                "{} output values, expected {}",
                flat.len(),
                self.outputs.len()
            )));
        }
        self.outputs.copy_from_slice(&flat);
        Ok(())
    }

    fn outputs(&self) -> &[f32] {
        &self.outputs
    }

    fn outputs_mut(&mut self) -> &mut [f32] {
        &mut self.outputs
    }

    fn layer_count(&self) -> usize {
        self.layer_names.len()
    }

    /// First channel of the layer's activations, min-max normalised to gray.
    fn layer_image(&mut self, layer: usize) -> Result<Option<Frame>> {
        let name = match self.layer_names.get(layer) {
            Ok(name) => name,
            Err(_) => return Ok(None),
        };
        let blob = self.net.forward_single(&name).map_err(cv_err)?;
        if blob.dims() != 4 {
            return Ok(None);
        }
        let size = blob.mat_size();
        let (h, w) = (size[2] as usize, size[3] as usize);
        let data = blob.data_typed::<f32>().map_err(cv_err)?;
        let channel = &data[..(w * h).min(data.len())];

        let (min, max) = channel
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        let range = if max > min { max - min } else { 1. };

        let mut image = Frame::new(w, h);
        for (i, v) in channel.iter().enumerate() {
            let gray = (v - min) / range;
            image.set_rgb(i % w, i / w, [gray; 3]);
        }
        Ok(Some(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY_CFG: &str = "\
[net]
# Testing
batch=1
subdivisions=1
width=416
height=288
channels=3

[convolutional]
filters=255
size=1

[yolo]
mask = 3,4,5
classes=80
num=6

[route]
layers = -4

[yolo]
mask = 0,1,2
classes= 20
";

    #[test]
    fn test_parse_cfg_uses_last_detection_layer() {
        let shape = parse_cfg(TINY_CFG).unwrap();
        assert_eq!(
            shape,
            NetworkShape {
                width: 416,
                height: 288,
                classes: 20
            }
        );
    }

    #[test]
    fn test_parse_region_cfg() {
        let cfg = "[network]\nwidth=608\nheight=608\n;comment\n[region]\nclasses=9418\n";
        assert_eq!(parse_cfg(cfg).unwrap().classes, 9418);
    }

    #[test]
    fn test_parse_cfg_rejects_missing_classes() {
        let cfg = "[net]\nwidth=416\nheight=416\n[convolutional]\nfilters=3\n";
        assert!(matches!(parse_cfg(cfg), Err(PipelineError::ModelLoad(_))));
    }

    #[test]
    fn test_parse_cfg_rejects_garbage() {
        assert!(parse_cfg("[net]\nwidth 416\n").is_err());
        assert!(parse_cfg("[net]\nwidth=wide\n").is_err());
    }
}
