mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::YoloBackend;
pub use backends::{load_labels, MotionBackend, StubBackend, StubStep, COCO_LABELS};
pub use registry::{BackendRegistry, DetectorSettings};
pub use result::{non_max_suppression, BoundingBox, Detection};
