pub mod rotation;
pub mod sidecar;

pub use rotation::RotationController;
pub use sidecar::SidecarController;
