//! NDJSON codec for kernel message streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so an
//! unterminated or runaway message from a kernel cannot exhaust memory.
//! Display payloads (base64 images, HTML tables) can be large, so the limit
//! is generous.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum line length accepted from a kernel: 16 MiB.
pub const MAX_LINE_BYTES: usize = 16 * 1_048_576;

/// Newline-delimited JSON decoder for the kernel's stdio channel.
///
/// Lines longer than [`MAX_LINE_BYTES`] and lines that are not valid UTF-8
/// are dropped inside the decoder: it discards input up to the next newline
/// and carries on with the following line. A decode error would end a
/// `FramedRead`, so these never surface as errors; callers read
/// [`KernelCodec::take_skipped`] to report them instead.
///
/// # Examples
///
/// ```rust,ignore
/// use tokio_util::codec::FramedRead;
/// use kernel_gateway::kernel::codec::KernelCodec;
///
/// let frames = FramedRead::new(child_stdout, KernelCodec::new());
/// ```
#[derive(Debug)]
pub struct KernelCodec {
    lines: LinesCodec,
    skipped: u64,
}

impl KernelCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
            skipped: 0,
        }
    }

    /// Number of lines dropped since the last call, resetting the count.
    pub fn take_skipped(&mut self) -> u64 {
        std::mem::take(&mut self.skipped)
    }
}

impl Default for KernelCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for KernelCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.lines.decode(src) {
                Err(LinesCodecError::MaxLineLengthExceeded | LinesCodecError::Io(_)) => {
                    // LinesCodec is now discarding (oversize) or has already
                    // consumed the bad line (UTF-8); decoding again resumes.
                    self.skipped += 1;
                }
                Ok(line) => return Ok(line),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.lines.decode_eof(src) {
                Err(LinesCodecError::MaxLineLengthExceeded | LinesCodecError::Io(_)) => {
                    self.skipped += 1;
                }
                Ok(line) => return Ok(line),
            }
        }
    }
}
