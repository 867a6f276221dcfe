use std::fmt::Write;
use std::path::Path;

/// Sensor modes of the TX2 onboard camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraMode {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Output frames are the sensor size divided by this.
    pub divisor: u32,
}

impl CameraMode {
    pub fn from_index(mode: u8) -> Option<CameraMode> {
        let (width, height, framerate, divisor) = match mode {
            1 => (2592, 1944, 30, 4),
            2 => (2592, 1458, 30, 4),
            3 => (1280, 720, 120, 2),
            _ => return None,
        };
        Some(CameraMode {
            width,
            height,
            framerate,
            divisor,
        })
    }

    pub fn output_size(&self) -> (u32, u32) {
        (self.width / self.divisor, self.height / self.divisor)
    }
}

pub fn parse_mode(s: &str) -> Result<CameraMode, String> {
    s.parse::<u8>()
        .ok()
        .and_then(CameraMode::from_index)
        .ok_or_else(|| format!("unknown camera mode {}, expected 1, 2 or 3", s))
}

/// Launch description for camera ! yolo ! display, optionally teeing off an
/// H.264 recording.
#[derive(Debug, Clone)]
pub struct Description {
    mode: CameraMode,
    output: (u32, u32),
    properties: Vec<(&'static str, String)>,
    movie: Option<String>,
}

impl Description {
    pub fn new(mode: CameraMode) -> Self {
        Description {
            mode,
            output: mode.output_size(),
            properties: vec![],
            movie: None,
        }
    }

    pub fn output(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        if let Some(width) = width {
            self.output.0 = width;
        }
        if let Some(height) = height {
            self.output.1 = height;
        }
        self
    }

    pub fn movie(mut self, path: Option<&Path>) -> Self {
        self.movie = path.map(|p| p.display().to_string());
        self
    }

    /// Sets a property on the yolo element.
    pub fn property(mut self, name: &'static str, value: impl ToString) -> Self {
        self.properties.push((name, value.to_string()));
        self
    }

    pub fn path_property(self, name: &'static str, path: Option<&Path>) -> Self {
        match path {
            Some(path) => self.property(name, format!("\"{}\"", path.display())),
            None => self,
        }
    }

    pub fn build(&self) -> String {
        let mut desc = format!(
            "nvcamerasrc ! video/x-raw(memory:NVMM),width={}, height={}, framerate={}/1 ! nvvidconv ! videoconvert ! video/x-raw, width={}, height={}, format=(string)BGR ! yolo name=yolo",
            self.mode.width, self.mode.height, self.mode.framerate, self.output.0, self.output.1
        );
        for (name, value) in &self.properties {
            let _ = write!(desc, " {}={}", name, value);
        }
        desc.push_str(" ! videoconvert ! clockoverlay halignment=2 valignment=1 ! ");

        match &self.movie {
            Some(location) => {
                let _ = write!(
                    desc,
                    "tee name=t t. ! queue ! videoconvert ! omxh264enc ! video/x-h264, stream-format=(string)byte-stream ! h264parse ! qtmux ! filesink location=\"{}\" sync=false t. ! queue ! videoconvert ! ximagesink",
                    location
                );
            }
            None => desc.push_str("videoconvert ! ximagesink"),
        }
        desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_modes() {
        assert_eq!(CameraMode::from_index(1).unwrap().output_size(), (648, 486));
        assert_eq!(CameraMode::from_index(2).unwrap().output_size(), (648, 364));
        let fast = CameraMode::from_index(3).unwrap();
        assert_eq!(fast.framerate, 120);
        assert_eq!(fast.output_size(), (640, 360));
        assert_eq!(CameraMode::from_index(0), None);
        assert_eq!(CameraMode::from_index(4), None);
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("2"), Ok(CameraMode::from_index(2).unwrap()));
        assert!(parse_mode("7").is_err());
        assert!(parse_mode("fast").is_err());
    }

    #[test]
    fn test_display_only() {
        let desc = Description::new(CameraMode::from_index(3).unwrap()).build();
        assert!(desc.starts_with(
            "nvcamerasrc ! video/x-raw(memory:NVMM),width=1280, height=720, framerate=120/1 ! "
        ));
        assert!(desc.contains("video/x-raw, width=640, height=360, format=(string)BGR ! yolo name=yolo ! "));
        assert!(desc.ends_with("clockoverlay halignment=2 valignment=1 ! videoconvert ! ximagesink"));
        assert!(!desc.contains("tee"));
    }

    #[test]
    fn test_movie_and_properties() {
        let desc = Description::new(CameraMode::from_index(1).unwrap())
            .output(Some(416), None)
            .property("silent", false)
            .property("frames", 5)
            .path_property("cfg", Some(Path::new("/models/yolov3 tiny.cfg")))
            .path_property("names", None)
            .movie(Some(Path::new("out.mp4")))
            .build();

        assert!(desc.contains("width=416, height=486, format=(string)BGR"));
        assert!(desc.contains("yolo name=yolo silent=false frames=5 cfg=\"/models/yolov3 tiny.cfg\" ! "));
        assert!(!desc.contains("names="));
        assert!(desc.contains("tee name=t"));
        assert!(desc.contains("filesink location=\"out.mp4\" sync=false"));
        assert!(desc.ends_with("t. ! queue ! videoconvert ! ximagesink"));
    }
}
