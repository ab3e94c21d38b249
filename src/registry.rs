use log::warn;
use spin::Mutex;

use crate::bitmap::BitMap;
use crate::{AllocatorError, Frame, Result};

// pools come from boot-time memory map regions, a handful at most
const MAX_POOLS: usize = 16;

static REGISTRY: Mutex<PoolRegistry> = Mutex::new(PoolRegistry::new());

/// Non-owning descriptor of a live pool, enough to resolve and clear a bit
/// without reaching the `FramePool` that owns the storage.
struct PoolEntry {
    base_frame: usize,
    frame_count: usize,
    bitmap: BitMap,
}

impl PoolEntry {
    fn contains(&self, frame_number: usize) -> bool {
        frame_number >= self.base_frame && frame_number < self.base_frame + self.frame_count
    }

    fn overlaps(&self, base_frame: usize, frame_count: usize) -> bool {
        base_frame < self.base_frame + self.frame_count
            && self.base_frame < base_frame + frame_count
    }

    fn release(&mut self, frame_number: usize) -> Result<()> {
        let bit = frame_number - self.base_frame;

        if !self.bitmap.get_bit(bit).expect("bitmap out of range") {
            warn!("double free of frame {:#x}", frame_number);
            return Err(AllocatorError::DoubleFree(frame_number));
        }

        self.bitmap.set_bit(bit, false).expect("bitmap out of range");
        Ok(())
    }
}

struct PoolRegistry {
    entries: [Option<PoolEntry>; MAX_POOLS],
}

impl PoolRegistry {
    const fn new() -> Self {
        const EMPTY_ENTRY: Option<PoolEntry> = None;

        Self {
            entries: [EMPTY_ENTRY; MAX_POOLS],
        }
    }

    fn register(&mut self, base_frame: usize, frame_count: usize, bitmap: BitMap) -> Result<()> {
        // an overlapping range would make release resolution ambiguous
        if self
            .entries
            .iter()
            .flatten()
            .any(|entry| entry.overlaps(base_frame, frame_count))
        {
            return Err(AllocatorError::PoolOverlap);
        }

        let slot = self
            .entries
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(AllocatorError::RegistryFull)?;

        *slot = Some(PoolEntry {
            base_frame,
            frame_count,
            bitmap,
        });

        Ok(())
    }

    fn unregister(&mut self, base_frame: usize) {
        for slot in self.entries.iter_mut() {
            if matches!(slot, Some(entry) if entry.base_frame == base_frame) {
                *slot = None;
            }
        }
    }

    fn release(&mut self, frame: Frame) -> Result<()> {
        match self
            .entries
            .iter_mut()
            .flatten()
            .find(|entry| entry.contains(frame.number))
        {
            Some(entry) => entry.release(frame.number),
            None => {
                warn!("release of frame {:#x} that no pool manages", frame.number);
                Err(AllocatorError::UnknownFrame(frame.number))
            }
        }
    }
}

pub(crate) fn register(base_frame: usize, frame_count: usize, bitmap: BitMap) -> Result<()> {
    REGISTRY.lock().register(base_frame, frame_count, bitmap)
}

pub(crate) fn unregister(base_frame: usize) {
    REGISTRY.lock().unregister(base_frame);
}

/// Releases `frame` back to whichever registered pool owns it.
pub fn release(frame: Frame) -> Result<()> {
    REGISTRY.lock().release(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    // local registries only, the global static is exercised through FramePool
    #[repr(align(4096))]
    struct Storage([u8; 8]);

    impl Storage {
        fn new() -> Self {
            Self([0; 8])
        }

        fn bitmap(&mut self, byte_count: usize) -> BitMap {
            unsafe { BitMap::zeroed(self.0.as_mut_ptr() as usize, byte_count) }
        }
    }

    #[test]
    fn register_rejects_overlap() {
        let mut first = Storage::new();
        let mut second = Storage::new();
        let mut registry = PoolRegistry::new();

        registry.register(0x100, 32, first.bitmap(4)).unwrap();
        assert_eq!(
            registry.register(0x110, 32, second.bitmap(4)),
            Err(AllocatorError::PoolOverlap)
        );

        // touching ranges are fine
        registry.register(0x120, 32, second.bitmap(4)).unwrap();
    }

    #[test]
    fn register_reports_a_full_table() {
        let mut storage = Storage::new();
        let mut registry = PoolRegistry::new();

        for pool in 0..MAX_POOLS {
            registry
                .register(pool * 0x10, 8, storage.bitmap(1))
                .unwrap();
        }

        assert_eq!(
            registry.register(MAX_POOLS * 0x10, 8, storage.bitmap(1)),
            Err(AllocatorError::RegistryFull)
        );
    }

    #[test]
    fn unregister_frees_the_slot() {
        let mut storage = Storage::new();
        let mut registry = PoolRegistry::new();

        registry.register(0x100, 32, storage.bitmap(4)).unwrap();
        registry.unregister(0x100);

        // the range is gone from resolution and can be reused
        assert_eq!(
            registry.release(Frame { number: 0x100 }),
            Err(AllocatorError::UnknownFrame(0x100))
        );
        registry.register(0x100, 32, storage.bitmap(4)).unwrap();
    }

    #[test]
    fn release_resolves_the_owning_pool() {
        let mut first = Storage::new();
        let mut second = Storage::new();
        let mut registry = PoolRegistry::new();

        let mut first_bits = first.bitmap(2);
        let mut second_bits = second.bitmap(2);
        first_bits.set_bit(0, true);
        second_bits.set_bit(4, true);

        registry
            .register(0, 16, unsafe { first_bits.alias() })
            .unwrap();
        registry
            .register(16, 16, unsafe { second_bits.alias() })
            .unwrap();

        // frame 20 is bit 4 of the second pool
        registry.release(Frame { number: 20 }).unwrap();
        assert_eq!(second_bits.get_bit(4), Some(false));
        assert_eq!(first_bits.get_bit(0), Some(true));
    }

    #[test]
    fn release_of_a_free_frame_is_a_double_free() {
        let mut storage = Storage::new();
        let mut registry = PoolRegistry::new();

        registry.register(0x200, 32, storage.bitmap(4)).unwrap();
        assert_eq!(
            registry.release(Frame { number: 0x205 }),
            Err(AllocatorError::DoubleFree(0x205))
        );
    }

    #[test]
    fn release_of_an_unmanaged_frame_is_unknown() {
        let mut registry = PoolRegistry::new();

        assert_eq!(
            registry.release(Frame { number: 0x300 }),
            Err(AllocatorError::UnknownFrame(0x300))
        );
    }
}
