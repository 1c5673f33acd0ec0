use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::{motion, MotionBackend, StubBackend};

/// Construction parameters shared by all backends. Each backend reads the
/// fields it understands and ignores the rest.
#[derive(Clone, Debug)]
pub struct DetectorSettings {
    pub backend: String,
    /// ONNX model path (yolo).
    pub model_path: Option<PathBuf>,
    /// Class names file replacing the COCO labels (yolo).
    pub labels_path: Option<PathBuf>,
    /// Square model input size in pixels (yolo).
    pub input_size: u32,
    /// Grid cell size in pixels (motion).
    pub motion_cell_size: u32,
    /// Mean luma change a cell needs to count as moving (motion).
    pub motion_pixel_delta: f32,
    /// Moving cells needed before a detection is reported (motion).
    pub motion_min_cells: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: "motion".to_string(),
            model_path: None,
            labels_path: None,
            input_size: 640,
            motion_cell_size: motion::DEFAULT_CELL_SIZE,
            motion_pixel_delta: motion::DEFAULT_PIXEL_DELTA,
            motion_min_cells: motion::DEFAULT_MIN_CELLS,
        }
    }
}

type Constructor = fn(&DetectorSettings) -> Result<Box<dyn DetectorBackend>>;

/// Registry of detector backend constructors, keyed by name.
pub struct BackendRegistry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with every backend compiled into this build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("stub", |_| Ok(Box::new(StubBackend::new())));
        registry.register("motion", |settings| {
            Ok(Box::new(
                MotionBackend::new()
                    .with_cell_size(settings.motion_cell_size)
                    .with_pixel_delta(settings.motion_pixel_delta)
                    .with_min_cells(settings.motion_min_cells),
            ))
        });
        #[cfg(feature = "backend-tract")]
        registry.register("yolo", |settings| {
            let path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("yolo backend requires a model_path"))?;
            let mut backend = super::backends::YoloBackend::new(path, settings.input_size)?;
            if let Some(labels_path) = &settings.labels_path {
                backend = backend.with_labels(super::backends::load_labels(labels_path)?);
            }
            Ok(Box::new(backend))
        });
        registry
    }

    /// Register a constructor. Re-registering a name replaces it.
    pub fn register(&mut self, name: &'static str, constructor: Constructor) {
        self.constructors.insert(name, constructor);
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }

    /// Build and warm up the backend named in `settings`.
    pub fn build(&self, settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
        let constructor = self.constructors.get(settings.backend.as_str()).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not available (have: {})",
                settings.backend,
                self.list().join(", ")
            )
        })?;
        let mut backend = constructor(settings)?;
        backend.warm_up()?;
        log::info!("detector backend '{}' ready", backend.name());
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_builtin_backends_by_name() {
        let registry = BackendRegistry::with_builtin();
        for name in ["stub", "motion"] {
            let settings = DetectorSettings {
                backend: name.to_string(),
                ..DetectorSettings::default()
            };
            assert_eq!(registry.build(&settings).unwrap().name(), name);
        }
    }

    #[test]
    fn unknown_backend_lists_alternatives() {
        let registry = BackendRegistry::with_builtin();
        let settings = DetectorSettings {
            backend: "nope".to_string(),
            ..DetectorSettings::default()
        };
        let err = registry.build(&settings).err().unwrap().to_string();
        assert!(err.contains("nope"));
        assert!(err.contains("motion"));
    }
}
