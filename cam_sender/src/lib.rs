//! Capture frames from a V4L camera and stream them to the park server.
pub mod sender;
pub mod sensors;

pub use common::Error;
