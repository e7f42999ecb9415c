//! Frame acquisition.
//!
//! Sources produce a sequence of RGB frames with an end-of-stream signal
//! (`Ok(None)`) and an error signal (`Err`). File playback is finite, live
//! capture is unbounded; the pipeline treats both uniformly and closes the
//! session cleanly when the sequence ends.

use anyhow::Result;

mod synthetic;

pub use synthetic::SyntheticSource;

/// One decoded RGB frame (3 bytes per pixel, row-major).
#[derive(Clone, Debug)]
pub struct Frame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic frame index within the source.
    pub index: u64,
}

/// Frame source trait.
///
/// `Ok(Some(frame))` is the next frame, `Ok(None)` is end of stream, and
/// `Err` is an unrecoverable acquisition failure. Sources need not be
/// rewindable.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}
