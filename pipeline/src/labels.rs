use crate::error::{PipelineError, Result};
use bbox::palette::class_color;
use std::path::Path;

/// Class names and their overlay colours, shared read-only by both threads.
#[derive(Debug, Clone, PartialEq)]
pub struct Labels {
    names: Vec<String>,
    colors: Vec<[f32; 3]>,
}

impl Labels {
    /// Read one class name per line.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut names: Vec<String> = content.lines().map(|l| l.trim_end().to_string()).collect();
        while names.last().map_or(false, |n| n.is_empty()) {
            names.pop();
        }
        if names.is_empty() {
            return Err(PipelineError::MalformedLabels {
                path: path.to_path_buf(),
                reason: "no class names".into(),
            });
        }
        if let Some(line) = names.iter().position(|n| n.is_empty()) {
            return Err(PipelineError::MalformedLabels {
                path: path.to_path_buf(),
                reason: format!("empty class name on line {}", line + 1),
            });
        }

        Ok(Self::new(names))
    }

    pub fn new(names: Vec<String>) -> Self {
        let classes = names.len();
        Labels {
            colors: (0..classes).map(|c| class_color(c, classes)).collect(),
            names,
        }
    }

    /// Check the labels cover `classes` network classes and derive the
    /// palette from the network's class count.
    pub fn fit_to(&mut self, classes: usize) -> Result<()> {
        if classes == 0 || self.names.len() < classes {
            return Err(PipelineError::InvalidConfig(format!(
                "{} class names for a network with {} classes",
                self.names.len(),
                classes
            )));
        }
        self.colors = (0..self.names.len())
            .map(|c| class_color(c, classes))
            .collect();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, class: usize) -> &str {
        self.names.get(class).map_or("?", |n| n.as_str())
    }

    pub fn color(&self, class: usize) -> [f32; 3] {
        self.colors.get(class).cloned().unwrap_or([1., 1., 1.])
    }

    /// Names of `classes` joined the way overlays print them.
    pub fn join<I: IntoIterator<Item = usize>>(&self, classes: I) -> String {
        classes
            .into_iter()
            .map(|c| self.name(c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_names(content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "yolo-labels-{}-{}.names",
            std::process::id(),
            content.len()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_names() {
        let path = write_names("person\nbicycle\ncar\n\n");
        let labels = Labels::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(labels.len(), 3);
        assert_eq!(labels.name(2), "car");
        assert_eq!(labels.color(0), [1., 0., 1.]);
        assert_eq!(labels.join(vec![0, 2]), "person, car");
    }

    #[test]
    fn test_empty_file_is_malformed() {
        let path = write_names("\n");
        let result = Labels::load(&path);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(PipelineError::MalformedLabels { .. })));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Labels::load("/nonexistent/coco.names"),
            Err(PipelineError::Io { .. })
        ));
    }

    #[test]
    fn test_fit_to_network() {
        let mut labels = Labels::new(vec!["a".into(), "b".into()]);
        assert!(labels.fit_to(3).is_err());
        labels.fit_to(2).unwrap();
        assert_eq!(labels.color(1), class_color(1, 2));
    }
}
