pub mod detection;
pub mod skeleton;

pub use detection::{CameraStream, Detection2D, Keypoint2D};
pub use skeleton::{HierarchyNode, Joint, JointDef, Skeleton};
