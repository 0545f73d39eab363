//! Segment framing and reassembly for the 20-byte GATT channel
//!
//! Every link frame starts with a one-byte segment header:
//! - bit 0: set on the first segment of a message
//! - bits 1..7: `0` while more segments follow, otherwise the [`SegmentType`]
//!   of the complete message (`1` plaintext, `2` ciphertext)
//!
//! A message shorter than one segment carries both the start bit and its type
//! in a single header.

use core::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::protocol::constants::SegmentType;
use crate::types::Timestamp;
use crate::{PacketError, Result, SesameError};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Payload bytes carried by one segment on the default 20-byte channel
pub const SEGMENT_DATA_SIZE: usize = 19;

const START_BIT: u8 = 0x01;
const APPEND_ONLY: u8 = 0;

/// Link frames produced for one message
pub type Frames = SmallVec<[Vec<u8>; 4]>;

// ----------------------------------------------------------------------------
// Fragmenter
// ----------------------------------------------------------------------------

/// Splits messages into link frames
#[derive(Debug, Clone, Copy)]
pub struct MessageFragmenter {
    segment_data_size: usize,
}

impl MessageFragmenter {
    /// Create a fragmenter carrying `segment_data_size` payload bytes per frame
    pub fn new(segment_data_size: usize) -> Self {
        Self {
            segment_data_size: segment_data_size.max(1),
        }
    }

    /// Fragmenter for the standard 20-byte characteristic
    pub fn for_ble() -> Self {
        Self::new(SEGMENT_DATA_SIZE)
    }

    /// Split `data` into frames, tagging the last with `segment_type`
    pub fn fragment_message(&self, data: &[u8], segment_type: SegmentType) -> Frames {
        let mut frames = Frames::new();
        if data.is_empty() {
            frames.push(vec![START_BIT | (segment_type.header_bits() << 1)]);
            return frames;
        }

        let total = data.len().div_ceil(self.segment_data_size);
        for (index, chunk) in data.chunks(self.segment_data_size).enumerate() {
            let mut header = if index + 1 == total {
                segment_type.header_bits() << 1
            } else {
                APPEND_ONLY << 1
            };
            if index == 0 {
                header |= START_BIT;
            }

            let mut frame = Vec::with_capacity(chunk.len() + 1);
            frame.push(header);
            frame.extend_from_slice(chunk);
            frames.push(frame);
        }
        frames
    }
}

impl Default for MessageFragmenter {
    fn default() -> Self {
        Self::for_ble()
    }
}

// ----------------------------------------------------------------------------
// Reassembler
// ----------------------------------------------------------------------------

/// A complete message recovered from its segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledMessage {
    pub segment_type: SegmentType,
    pub data: Vec<u8>,
}

/// Buffers segments until a final segment completes the message
#[derive(Debug)]
pub struct MessageReassembler {
    buffer: Vec<u8>,
    started_at: Option<Timestamp>,
    timeout_ms: u64,
    max_message_size: usize,
}

impl MessageReassembler {
    pub fn new(timeout: Duration, max_message_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            started_at: None,
            timeout_ms: timeout.as_millis() as u64,
            max_message_size,
        }
    }

    /// Feed one link frame, returning the message it completes
    pub fn add_segment(
        &mut self,
        segment: &[u8],
        now: Timestamp,
    ) -> Result<Option<ReassembledMessage>> {
        let (&header, data) = segment.split_first().ok_or(PacketError::PayloadTooSmall {
            expected: 1,
            actual: 0,
        })?;
        let is_start = header & START_BIT != 0;
        let kind = header >> 1;

        if is_start {
            if !self.buffer.is_empty() {
                debug!(
                    "Discarding {} buffered bytes on new message start",
                    self.buffer.len()
                );
            }
            self.buffer.clear();
            self.started_at = Some(now);
        } else {
            match self.started_at {
                None => {
                    debug!("Dropping continuation segment with no message in progress");
                    return Ok(None);
                }
                Some(started) if now - started >= self.timeout_ms => {
                    let buffered = self.reset();
                    warn!("Continuation arrived after fragment timeout, {} bytes lost", buffered);
                    return Err(SesameError::FrameTruncated { buffered });
                }
                Some(_) => {}
            }
        }

        let segment_type = match kind {
            APPEND_ONLY => None,
            1 => Some(SegmentType::Plaintext),
            2 => Some(SegmentType::Ciphertext),
            _ => {
                self.reset();
                return Err(PacketError::MalformedHeader { header }.into());
            }
        };

        if self.buffer.len() + data.len() > self.max_message_size {
            let actual = self.buffer.len() + data.len();
            self.reset();
            return Err(PacketError::PayloadTooLarge {
                max: self.max_message_size,
                actual,
            }
            .into());
        }
        self.buffer.extend_from_slice(data);

        Ok(segment_type.map(|segment_type| {
            self.started_at = None;
            ReassembledMessage {
                segment_type,
                data: core::mem::take(&mut self.buffer),
            }
        }))
    }

    /// Deadline of the message in progress
    pub fn deadline(&self) -> Option<Timestamp> {
        self.started_at.map(|started| started + self.timeout_ms)
    }

    /// Discard a partial message whose deadline has passed
    pub fn expire(&mut self, now: Timestamp) -> Option<SesameError> {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                let buffered = self.reset();
                warn!("Fragment timeout, discarding {} buffered bytes", buffered);
                Some(SesameError::FrameTruncated { buffered })
            }
            _ => None,
        }
    }

    /// Discard any partial message, reporting it as truncated
    pub fn discard(&mut self) -> Option<SesameError> {
        if self.started_at.is_some() {
            let buffered = self.reset();
            Some(SesameError::FrameTruncated { buffered })
        } else {
            None
        }
    }

    /// Whether no message is in progress
    pub fn is_idle(&self) -> bool {
        self.started_at.is_none()
    }

    fn reset(&mut self) -> usize {
        let buffered = self.buffer.len();
        self.buffer.clear();
        self.started_at = None;
        buffered
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
