use anyhow::Result;

use crate::detect::result::DetectionSet;
use crate::frame::Frame;

/// Object detector backend.
///
/// Maps one frame to the classes seen in it. Backends are the external
/// collaborator of the pipeline: the orchestrator only calls them on sampled
/// frames and relies on no state carried between calls.
pub trait DetectorBackend {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionSet>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
