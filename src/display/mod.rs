pub mod status;

pub use status::{CameraLine, StatusDisplay};
