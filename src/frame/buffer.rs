//! C1 Frame Buffer (spec.md §3, §4.1).
//!
//! Bit positions match `examples/original_source/src/frame_queue.h`
//! (`kFrameFlag*`); the merge policy in `copy`/`append` is spec.md §4.1's,
//! which diverges from the original's plain overwrite.

use std::fmt;

/// Eight-flag bitset carried by a Frame Buffer, one bit per access-unit
/// property contributed by an encoder segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const EOS: FrameFlags = FrameFlags(1 << 0);
    pub const FRAME_START: FrameFlags = FrameFlags(1 << 1);
    pub const FRAME_END: FrameFlags = FrameFlags(1 << 2);
    pub const KEYFRAME: FrameFlags = FrameFlags(1 << 3);
    pub const CONFIG: FrameFlags = FrameFlags(1 << 5);
    pub const MOTION_SIDE_INFO: FrameFlags = FrameFlags(1 << 7);

    pub const NONE: FrameFlags = FrameFlags(0);

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;
    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        self.union(rhs)
    }
}

impl fmt::Display for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08b}", self.0)
    }
}

/// Fixed-capacity byte buffer with an eight-flag bitset, per spec.md §3.
///
/// Owned by exactly one of the Frame Queue's three sequences (free/pending/
/// ready) at any instant; no internal synchronization.
pub struct FrameBuffer {
    data: Vec<u8>,
    capacity: usize,
    flags: FrameFlags,
    temporary: bool,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        FrameBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
            flags: FrameFlags::NONE,
            temporary: false,
        }
    }

    pub fn new_temporary(capacity: usize) -> Self {
        let mut buf = Self::new(capacity);
        buf.temporary = true;
        buf
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(FrameFlags::KEYFRAME)
    }

    pub fn is_frame_end(&self) -> bool {
        self.flags.contains(FrameFlags::FRAME_END)
    }

    pub fn is_config(&self) -> bool {
        self.flags.contains(FrameFlags::CONFIG)
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(FrameFlags::EOS)
    }

    pub fn is_motion_vector(&self) -> bool {
        self.flags.contains(FrameFlags::MOTION_SIDE_INFO)
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn length(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn reset(&mut self) {
        self.flags = FrameFlags::NONE;
        self.data.clear();
    }

    /// Merges incoming flags into the buffer's current flag set per the
    /// spec's policy: OR-merge for KEYFRAME/CONFIG, last-wins (overwrite)
    /// for FRAME_END and all other bits.
    fn merge_flags(&mut self, incoming: FrameFlags) {
        let sticky_mask = FrameFlags::KEYFRAME.0 | FrameFlags::CONFIG.0;
        let sticky_bits = (self.flags.0 | incoming.0) & sticky_mask;
        let overwrite_bits = incoming.0 & !sticky_mask;
        self.flags = FrameFlags(sticky_bits | overwrite_bits);
    }

    /// Replaces the buffer's contents with `segment`. Fails if `segment.len()
    /// >= capacity` (spec.md §4.1).
    pub fn copy(&mut self, segment: &[u8], flags: FrameFlags) -> Result<(), BufferError> {
        if segment.len() >= self.capacity {
            return Err(BufferError::TooLarge {
                len: segment.len(),
                capacity: self.capacity,
            });
        }
        self.flags = FrameFlags::NONE;
        self.data.clear();
        self.data.extend_from_slice(segment);
        self.merge_flags(flags);
        Ok(())
    }

    /// Appends `segment` to the buffer's existing contents. Fails if the
    /// combined length would reach or exceed capacity.
    pub fn append(&mut self, segment: &[u8], flags: FrameFlags) -> Result<(), BufferError> {
        if self.data.len() + segment.len() >= self.capacity {
            return Err(BufferError::TooLarge {
                len: self.data.len() + segment.len(),
                capacity: self.capacity,
            });
        }
        self.data.extend_from_slice(segment);
        self.merge_flags(flags);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("segment length {len} reaches or exceeds buffer capacity {capacity}")]
    TooLarge { len: usize, capacity: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_replaces_contents_and_flags() {
        let mut buf = FrameBuffer::new(16);
        buf.copy(b"abcd", FrameFlags::CONFIG).unwrap();
        assert_eq!(buf.as_bytes(), b"abcd");
        assert!(buf.is_config());
        assert!(!buf.is_keyframe());
    }

    #[test]
    fn append_or_merges_keyframe_and_config() {
        let mut buf = FrameBuffer::new(64);
        buf.copy(b"sps-pps", FrameFlags::CONFIG).unwrap();
        buf.append(b"idr-slice", FrameFlags::KEYFRAME | FrameFlags::FRAME_START)
            .unwrap();
        assert!(buf.is_config(), "CONFIG must be OR-merged, not overwritten");
        assert!(buf.is_keyframe());
        assert_eq!(buf.as_bytes(), b"sps-ppsidr-slice");
    }

    #[test]
    fn frame_end_is_last_wins() {
        let mut buf = FrameBuffer::new(64);
        buf.copy(b"a", FrameFlags::FRAME_START | FrameFlags::FRAME_END)
            .unwrap();
        assert!(buf.is_frame_end());
        buf.append(b"b", FrameFlags::FRAME_START).unwrap();
        assert!(
            !buf.is_frame_end(),
            "a later segment without FRAME_END overwrites the flag"
        );
    }

    #[test]
    fn copy_rejects_segment_at_or_over_capacity() {
        let mut buf = FrameBuffer::new(4);
        assert!(buf.copy(b"abcd", FrameFlags::NONE).is_err());
        assert!(buf.copy(b"abc", FrameFlags::NONE).is_ok());
    }

    #[test]
    fn append_rejects_combined_length_at_or_over_capacity() {
        let mut buf = FrameBuffer::new(8);
        buf.copy(b"abc", FrameFlags::NONE).unwrap();
        assert!(buf.append(b"abcde", FrameFlags::NONE).is_err());
        assert!(buf.append(b"abc", FrameFlags::NONE).is_ok());
    }

    #[test]
    fn reset_clears_flags_and_length() {
        let mut buf = FrameBuffer::new(16);
        buf.copy(b"data", FrameFlags::KEYFRAME | FrameFlags::FRAME_END).unwrap();
        buf.reset();
        assert_eq!(buf.length(), 0);
        assert!(!buf.is_keyframe());
        assert!(!buf.is_frame_end());
    }
}
