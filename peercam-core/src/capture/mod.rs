//! Periodic capture-and-send loop.

mod service;
mod source;

pub use service::{CaptureHandle, CaptureService, LoopPhase, LoopStatus};
pub use source::{Capture, CaptureSource, StaticCapture};
