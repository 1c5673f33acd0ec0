mod labels;
pub mod motion;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod yolo;

pub use labels::{load_labels, COCO_LABELS};
pub use motion::MotionBackend;
pub use stub::{StubBackend, StubStep};

#[cfg(feature = "backend-tract")]
pub use yolo::YoloBackend;
