use log::{debug, warn};

use crate::bitmap::BitMap;
use crate::registry;
use crate::{AllocatorError, Frame, FrameAllocator, Result, FRAME_SIZE};

/// A contiguous range of physical frames and their allocation bitmap.
///
/// The bitmap lives in the frame passed as `info_frame`, or in the pool's own
/// first frame when none is given; a self-hosted pool permanently consumes
/// that frame. Construction registers the pool's range with the global
/// registry so [`crate::release`] can route bare frame numbers back to it, and
/// dropping the pool unregisters it.
pub struct FramePool {
    base_frame: usize,
    frame_count: usize,
    bitmap: BitMap,
}

impl FramePool {
    /// Largest pool a single-frame bitmap can describe.
    pub const MAX_FRAMES: usize = FRAME_SIZE * 8;

    /// Creates a pool managing `[base_frame, base_frame + frame_count)`.
    ///
    /// # Safety
    ///
    /// The bitmap storage frame (`info_frame`, or `base_frame` if none) must
    /// be identity mapped, writable, and used by nothing but this pool for its
    /// whole lifetime. Callers on a preemptible system must also serialize
    /// pool operations with [`crate::release`] calls that can reach this pool.
    pub unsafe fn new(
        base_frame: usize,
        frame_count: usize,
        info_frame: Option<usize>,
    ) -> Result<Self> {
        if frame_count == 0 {
            return Err(AllocatorError::EmptyPool);
        }
        if frame_count > Self::MAX_FRAMES {
            return Err(AllocatorError::BitmapTooLarge(frame_count));
        }
        if let Some(frame) = info_frame {
            if frame >= base_frame && frame < base_frame + frame_count {
                return Err(AllocatorError::InfoFrameInPool(frame));
            }
        }

        let storage_frame = info_frame.unwrap_or(base_frame);
        let byte_count = frame_count.div_ceil(8);
        let mut bitmap = BitMap::zeroed(storage_frame * FRAME_SIZE, byte_count);

        // bits past the last frame stay set so the search never leaves the pool
        for bit in frame_count..byte_count * 8 {
            bitmap.set_bit(bit, true).expect("bitmap out of range");
        }

        if info_frame.is_none() {
            // the bitmap occupies the pool's first frame, claim it through the
            // normal search before the pool is visible to anyone
            let bit = bitmap.first_zero_bit().ok_or(AllocatorError::PoolExhausted)?;
            bitmap.set_bit(bit, true).expect("bitmap out of range");
        }

        registry::register(base_frame, frame_count, bitmap.alias())?;
        debug!(
            "frame pool [{:#x}, {:#x}) registered, bitmap in frame {:#x}",
            base_frame,
            base_frame + frame_count,
            storage_frame
        );

        Ok(Self {
            base_frame,
            frame_count,
            bitmap,
        })
    }

    /// Marks the lowest free frame allocated and returns it.
    pub fn allocate_frame(&mut self) -> Result<Frame> {
        let bit = self
            .bitmap
            .first_zero_bit()
            .ok_or(AllocatorError::PoolExhausted)?;
        self.bitmap.set_bit(bit, true).expect("bitmap out of range");

        Ok(Frame {
            number: self.base_frame + bit,
        })
    }

    /// Marks `frame` free again. Use [`crate::release`] when the owning pool
    /// is not known.
    pub fn release_frame(&mut self, frame: Frame) -> Result<()> {
        if !self.contains(frame.number) {
            warn!(
                "release of frame {:#x} outside pool [{:#x}, {:#x})",
                frame.number,
                self.base_frame,
                self.base_frame + self.frame_count
            );
            return Err(AllocatorError::UnknownFrame(frame.number));
        }

        let bit = frame.number - self.base_frame;
        if !self.bitmap.get_bit(bit).expect("bitmap out of range") {
            warn!("double free of frame {:#x}", frame.number);
            return Err(AllocatorError::DoubleFree(frame.number));
        }

        self.bitmap.set_bit(bit, false).expect("bitmap out of range");
        Ok(())
    }

    /// Bulk-reserves `[start_frame, start_frame + frame_count)`, regardless of
    /// current state. Used at startup to protect frames already consumed by
    /// static kernel structures. Reversible through release, frame by frame.
    pub fn mark_inaccessible(&mut self, start_frame: usize, frame_count: usize) -> Result<()> {
        let out_of_range = AllocatorError::OutOfRange(start_frame, frame_count);
        let end_frame = start_frame.checked_add(frame_count).ok_or(out_of_range)?;

        // validate before touching any bit, a failure must leave the bitmap as it was
        if start_frame < self.base_frame || end_frame > self.base_frame + self.frame_count {
            return Err(out_of_range);
        }

        for frame in start_frame..end_frame {
            self.bitmap
                .set_bit(frame - self.base_frame, true)
                .expect("bitmap out of range");
        }

        Ok(())
    }

    pub fn contains(&self, frame_number: usize) -> bool {
        frame_number >= self.base_frame && frame_number < self.base_frame + self.frame_count
    }

    pub fn base_frame(&self) -> usize {
        self.base_frame
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn allocated_frames(&self) -> usize {
        self.bitmap.count_set(self.frame_count)
    }

    pub fn free_frames(&self) -> usize {
        self.frame_count - self.allocated_frames()
    }
}

impl FrameAllocator for FramePool {
    fn allocate_frame(&mut self) -> Result<Frame> {
        self.allocate_frame()
    }

    fn free_frame(&mut self, frame: Frame) -> Result<()> {
        self.release_frame(frame)
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        registry::unregister(self.base_frame);
    }
}
