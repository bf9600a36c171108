use crate::core::gfx::TextureHandle;
use smallvec::SmallVec;

/// Number of shader-visible texture binding slots. The fragment stage
/// declares a sampler array of exactly this length; device minimums for
/// per-stage sampled images comfortably exceed it on every target GPU.
pub const MAX_SLOTS: usize = 64;

/// Per-texture slot bookkeeping, embedded in each texture store entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlotBinding {
    pub slot: Option<u32>,
    pub last_used_frame: u64,
}

/// Fixed-capacity table mapping binding slots to resident texture handles.
/// Slot 0 permanently holds the 1x1 fallback texture and is never scanned
/// or evicted. The descriptor set mirroring this table is rewritten only
/// when `stale` was raised during the frame.
pub struct SlotTable {
    slots: [Option<TextureHandle>; MAX_SLOTS],
    stale: bool,
    touched: SmallVec<[TextureHandle; MAX_SLOTS]>,
}

impl SlotTable {
    pub fn new(fallback: TextureHandle) -> Self {
        let mut slots = [None; MAX_SLOTS];
        slots[0] = Some(fallback);
        Self {
            slots,
            // The initial descriptor set has never been written.
            stale: true,
            touched: SmallVec::new(),
        }
    }

    /// Assigns (or re-finds) the binding slot for `handle` this frame.
    ///
    /// Exhaustion is fatal: the content this renderer targets never uses
    /// more than a few dozen distinct textures per frame, and a mid-frame
    /// flush-and-continue path is deliberately not implemented.
    pub fn resolve(&mut self, handle: TextureHandle, binding: &mut SlotBinding, frame: u64) -> u32 {
        if binding.last_used_frame == frame {
            if let Some(slot) = binding.slot {
                return slot;
            }
        }

        let slot = match binding.slot {
            // Still resident from an earlier frame and nobody reclaimed it.
            Some(slot) if self.slots[slot as usize] == Some(handle) => slot,
            _ => {
                let free = self.slots[1..]
                    .iter()
                    .position(Option::is_none)
                    .map(|i| (i + 1) as u32);
                let Some(slot) = free else {
                    panic!(
                        "texture slot table exhausted: {} textures bound in one frame \
                         (capacity {}, slot 0 reserved)",
                        MAX_SLOTS,
                        MAX_SLOTS - 1
                    );
                };
                self.slots[slot as usize] = Some(handle);
                self.stale = true;
                slot
            }
        };

        binding.slot = Some(slot);
        binding.last_used_frame = frame;
        self.touched.push(handle);
        slot
    }

    /// Frees the slot a deleted texture occupied, if any. The descriptor
    /// set is marked stale so the next frame rebinds the fallback there.
    pub fn release(&mut self, binding: &mut SlotBinding) {
        if let Some(slot) = binding.slot.take() {
            debug_assert_ne!(slot, 0, "slot 0 is reserved for the fallback texture");
            self.slots[slot as usize] = None;
            self.stale = true;
        }
    }

    pub fn resident(&self, slot: usize) -> Option<TextureHandle> {
        self.slots[slot]
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Forces a rewrite at end-of-frame even though no slot changed hands,
    /// e.g. when a resident texture's sampler state changed.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn touched(&self) -> &[TextureHandle] {
        &self.touched
    }

    /// Ends the frame's slot accounting; returns whether the descriptor
    /// set must be rewritten before the next draw that samples from it.
    pub fn end_frame(&mut self) -> bool {
        let was_stale = self.stale;
        self.stale = false;
        self.touched.clear();
        was_stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FALLBACK: TextureHandle = 1;

    fn table() -> SlotTable {
        let mut t = SlotTable::new(FALLBACK);
        t.end_frame();
        t
    }

    #[test]
    fn same_texture_twice_keeps_its_slot_and_stays_clean() {
        let mut t = table();
        let mut b = SlotBinding::default();
        let first = t.resolve(7, &mut b, 1);
        assert!(t.end_frame());
        let second = t.resolve(7, &mut b, 2);
        assert_eq!(first, second);
        // Second resolve reused the resident slot; nothing to rewrite.
        assert!(!t.end_frame());
        let third = t.resolve(7, &mut b, 2);
        assert_eq!(first, third);
        assert!(!t.is_stale());
    }

    #[test]
    fn slot_zero_is_never_handed_out() {
        let mut t = table();
        for handle in 10..20 {
            let mut b = SlotBinding::default();
            assert_ne!(t.resolve(handle, &mut b, 1), 0);
        }
        assert_eq!(t.resident(0), Some(FALLBACK));
    }

    #[test]
    fn distinct_textures_fill_every_general_slot() {
        let mut t = table();
        let mut bindings = vec![SlotBinding::default(); MAX_SLOTS - 1];
        let mut seen = std::collections::HashSet::new();
        for (i, b) in bindings.iter_mut().enumerate() {
            let slot = t.resolve(100 + i as TextureHandle, b, 1);
            assert!(seen.insert(slot), "slot {slot} assigned twice");
        }
        assert_eq!(seen.len(), MAX_SLOTS - 1);
    }

    #[test]
    #[should_panic(expected = "slot table exhausted")]
    fn one_texture_past_capacity_is_fatal() {
        let mut t = table();
        for i in 0..MAX_SLOTS {
            let mut b = SlotBinding::default();
            t.resolve(100 + i as TextureHandle, &mut b, 1);
        }
    }

    #[test]
    fn release_frees_the_slot_for_reuse() {
        let mut t = table();
        let mut a = SlotBinding::default();
        let slot = t.resolve(7, &mut a, 1);
        t.end_frame();
        t.release(&mut a);
        assert_eq!(a.slot, None);
        assert!(t.is_stale());
        let mut b = SlotBinding::default();
        assert_eq!(t.resolve(8, &mut b, 2), slot);
    }

    #[test]
    fn reclaimed_slot_is_not_reused_by_the_old_owner() {
        let mut t = table();
        let mut old = SlotBinding::default();
        let slot = t.resolve(7, &mut old, 1);
        t.end_frame();
        // Texture 7 is deleted; texture 8 takes its slot next frame.
        t.release(&mut old);
        let mut new = SlotBinding::default();
        assert_eq!(t.resolve(8, &mut new, 2), slot);

        // A stale binding pointing at a reclaimed slot must get a fresh one.
        let mut stale = SlotBinding {
            slot: Some(slot),
            last_used_frame: 1,
        };
        let fresh = t.resolve(9, &mut stale, 2);
        assert_ne!(fresh, slot);
    }

    #[test]
    fn touched_list_tracks_per_frame_use() {
        let mut t = table();
        let mut a = SlotBinding::default();
        let mut b = SlotBinding::default();
        t.resolve(7, &mut a, 1);
        t.resolve(8, &mut b, 1);
        t.resolve(7, &mut a, 1);
        assert_eq!(t.touched(), &[7, 8]);
        t.end_frame();
        assert!(t.touched().is_empty());
    }
}
