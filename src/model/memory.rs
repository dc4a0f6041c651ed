//! Suballocator for the model arena.
//!
//! The whole model lives in a single byte arena addressed by `u32` offsets.
//! Offset 0 is the null reference. The text area grows upwards from the
//! bottom, contexts are carved from the top (`hi_unit` downwards) and state
//! arrays from `lo_unit` upwards. Freed blocks are kept in 38 size-classed
//! free lists that are threaded through the arena itself: a free block
//! starts with a `Node` record (stamp, next, unit count).

use crate::{Error, Result};

/// Size of one allocation unit in bytes. A state is half a unit, a context
/// record is exactly one unit.
pub(crate) const UNIT_SIZE: u32 = 12;

/// Number of size classes.
pub(crate) const INDEX_COUNT: usize = 38;

/// Stamp value marking a block that sits in a free list.
const STAMP_FREE: u32 = 0xFFFF_FFFF;

/// Number of rare allocations between two free-list glue passes.
const GLUE_PERIOD: u32 = 1 << 13;

pub(crate) struct Arena {
    mem: Box<[u8]>,
    pub(crate) size: u32,
    align_offset: u32,
    pub(crate) text: u32,
    pub(crate) units_start: u32,
    pub(crate) lo_unit: u32,
    pub(crate) hi_unit: u32,
    pub(crate) glue_count: u32,
    free_list: [u32; INDEX_COUNT],
    stamps: [u32; INDEX_COUNT],
    index2units: [u8; INDEX_COUNT],
    units2index: [u8; 128],
}

impl Arena {
    pub(crate) fn new(mem_size: u32) -> Result<Self> {
        let mut units2index = [0u8; 128];
        let mut index2units = [0u8; INDEX_COUNT];

        let mut units = 0usize;
        for i in 0..INDEX_COUNT {
            let step = if i >= 12 { 4 } else { (i >> 2) + 1 };
            for _ in 0..step {
                units2index[units] = i as u8;
                units += 1;
            }
            index2units[i] = units as u8;
        }

        // The arena is addressed through u32 loads, so its end must land on
        // a four byte boundary.
        let align_offset = 4u32.wrapping_sub(mem_size) & 3;
        let total = (align_offset + mem_size) as usize;

        let mut mem = Vec::new();
        mem.try_reserve_exact(total)
            .map_err(|_| Error::MemoryAllocation)?;
        mem.resize(total, 0);

        Ok(Self {
            mem: mem.into_boxed_slice(),
            size: mem_size,
            align_offset,
            text: 0,
            units_start: 0,
            lo_unit: 0,
            hi_unit: 0,
            glue_count: 0,
            free_list: [0; INDEX_COUNT],
            stamps: [0; INDEX_COUNT],
            index2units,
            units2index,
        })
    }

    /// First offset of the text area.
    pub(crate) fn text_start(&self) -> u32 {
        self.align_offset
    }

    /// Returns the arena to its pristine geometry. 1/8 of the memory is
    /// reserved for the text area, the rest for units.
    pub(crate) fn reset(&mut self) {
        self.free_list = [0; INDEX_COUNT];
        self.stamps = [0; INDEX_COUNT];
        self.text = self.align_offset;
        self.hi_unit = self.text + self.size;
        self.units_start = self.hi_unit - self.size / 8 / UNIT_SIZE * 7 * UNIT_SIZE;
        self.lo_unit = self.units_start;
        self.glue_count = 0;
    }

    #[inline]
    pub(crate) fn u8_at(&self, offset: u32) -> u8 {
        self.mem[offset as usize]
    }

    #[inline]
    pub(crate) fn set_u8(&mut self, offset: u32, value: u8) {
        self.mem[offset as usize] = value;
    }

    #[inline]
    pub(crate) fn u16_at(&self, offset: u32) -> u16 {
        let i = offset as usize;
        u16::from_le_bytes([self.mem[i], self.mem[i + 1]])
    }

    #[inline]
    pub(crate) fn set_u16(&mut self, offset: u32, value: u16) {
        let i = offset as usize;
        self.mem[i..i + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub(crate) fn u32_at(&self, offset: u32) -> u32 {
        let i = offset as usize;
        u32::from_le_bytes([self.mem[i], self.mem[i + 1], self.mem[i + 2], self.mem[i + 3]])
    }

    #[inline]
    pub(crate) fn set_u32(&mut self, offset: u32, value: u32) {
        let i = offset as usize;
        self.mem[i..i + 4].copy_from_slice(&value.to_le_bytes());
    }

    // Context record, 12 bytes:
    //   0: num_stats   1: flags   2..4: summ_freq (or the single state)
    //   4..8: stats offset (or the single state's successor)   8..12: suffix

    #[inline]
    pub(crate) fn ctx_num_stats(&self, ctx: u32) -> u8 {
        self.u8_at(ctx)
    }

    #[inline]
    pub(crate) fn set_ctx_num_stats(&mut self, ctx: u32, value: u8) {
        self.set_u8(ctx, value);
    }

    #[inline]
    pub(crate) fn ctx_flags(&self, ctx: u32) -> u8 {
        self.u8_at(ctx + 1)
    }

    #[inline]
    pub(crate) fn set_ctx_flags(&mut self, ctx: u32, value: u8) {
        self.set_u8(ctx + 1, value);
    }

    #[inline]
    pub(crate) fn ctx_summ_freq(&self, ctx: u32) -> u16 {
        self.u16_at(ctx + 2)
    }

    #[inline]
    pub(crate) fn set_ctx_summ_freq(&mut self, ctx: u32, value: u16) {
        self.set_u16(ctx + 2, value);
    }

    #[inline]
    pub(crate) fn ctx_stats(&self, ctx: u32) -> u32 {
        self.u32_at(ctx + 4)
    }

    #[inline]
    pub(crate) fn set_ctx_stats(&mut self, ctx: u32, value: u32) {
        self.set_u32(ctx + 4, value);
    }

    #[inline]
    pub(crate) fn ctx_suffix(&self, ctx: u32) -> u32 {
        self.u32_at(ctx + 8)
    }

    #[inline]
    pub(crate) fn set_ctx_suffix(&mut self, ctx: u32, value: u32) {
        self.set_u32(ctx + 8, value);
    }

    /// A binary context stores its only state inline; it overlays the
    /// summ_freq and stats fields.
    #[inline]
    pub(crate) fn one_state(&self, ctx: u32) -> u32 {
        ctx + 2
    }

    // State record, 6 bytes: symbol, freq, successor (u32).

    #[inline]
    pub(crate) fn st_symbol(&self, state: u32) -> u8 {
        self.u8_at(state)
    }

    #[inline]
    pub(crate) fn set_st_symbol(&mut self, state: u32, value: u8) {
        self.set_u8(state, value);
    }

    #[inline]
    pub(crate) fn st_freq(&self, state: u32) -> u8 {
        self.u8_at(state + 1)
    }

    #[inline]
    pub(crate) fn set_st_freq(&mut self, state: u32, value: u8) {
        self.set_u8(state + 1, value);
    }

    #[inline]
    pub(crate) fn st_successor(&self, state: u32) -> u32 {
        let i = state as usize + 2;
        u32::from_le_bytes([self.mem[i], self.mem[i + 1], self.mem[i + 2], self.mem[i + 3]])
    }

    #[inline]
    pub(crate) fn set_st_successor(&mut self, state: u32, value: u32) {
        let i = state as usize + 2;
        self.mem[i..i + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub(crate) fn state_get(&self, state: u32) -> [u8; 6] {
        let i = state as usize;
        let m = &self.mem;
        [m[i], m[i + 1], m[i + 2], m[i + 3], m[i + 4], m[i + 5]]
    }

    #[inline]
    pub(crate) fn state_set(&mut self, state: u32, bytes: [u8; 6]) {
        let i = state as usize;
        self.mem[i..i + 6].copy_from_slice(&bytes);
    }

    #[inline]
    pub(crate) fn copy_state(&mut self, dst: u32, src: u32) {
        self.mem.copy_within(src as usize..src as usize + 6, dst as usize);
    }

    pub(crate) fn swap_states(&mut self, a: u32, b: u32) {
        for i in 0..6 {
            self.mem.swap(a as usize + i, b as usize + i);
        }
    }

    // Free block node, 12 bytes: stamp, next, unit count.

    #[inline]
    fn node_stamp(&self, node: u32) -> u32 {
        self.u32_at(node)
    }

    #[inline]
    fn node_next(&self, node: u32) -> u32 {
        self.u32_at(node + 4)
    }

    #[inline]
    fn node_nu(&self, node: u32) -> u32 {
        self.u32_at(node + 8)
    }

    #[inline]
    pub(crate) fn index_units(&self, indx: usize) -> u32 {
        self.index2units[indx] as u32
    }

    #[inline]
    pub(crate) fn units_index(&self, nu: u32) -> usize {
        self.units2index[(nu - 1) as usize] as usize
    }

    #[inline]
    pub(crate) fn free_list_head(&self, indx: usize) -> u32 {
        self.free_list[indx]
    }

    pub(crate) fn copy_units(&mut self, dst: u32, src: u32, nu: u32) {
        let n = (nu * UNIT_SIZE) as usize;
        self.mem.copy_within(src as usize..src as usize + n, dst as usize);
    }

    pub(crate) fn insert_node(&mut self, node: u32, indx: usize) {
        self.set_u32(node, STAMP_FREE);
        self.set_u32(node + 4, self.free_list[indx]);
        self.set_u32(node + 8, self.index2units[indx] as u32);
        self.free_list[indx] = node;
        self.stamps[indx] = self.stamps[indx].wrapping_add(1);
    }

    pub(crate) fn remove_node(&mut self, indx: usize) -> u32 {
        let node = self.free_list[indx];
        self.free_list[indx] = self.node_next(node);
        self.stamps[indx] = self.stamps[indx].wrapping_sub(1);
        node
    }

    fn split_block(&mut self, mut ptr: u32, old_indx: usize, new_indx: usize) {
        let nu = self.index2units[old_indx] as u32 - self.index2units[new_indx] as u32;
        ptr += self.index2units[new_indx] as u32 * UNIT_SIZE;
        let mut i = self.units_index(nu);
        if self.index2units[i] as u32 != nu {
            i -= 1;
            let k = self.index2units[i] as u32;
            self.insert_node(ptr + k * UNIT_SIZE, (nu - k - 1) as usize);
        }
        self.insert_node(ptr, i);
    }

    /// Coalesces adjacent free blocks. Rebuilds all free lists from the
    /// merged chain.
    fn glue_free_blocks(&mut self) {
        self.glue_count = GLUE_PERIOD;
        self.stamps = [0; INDEX_COUNT];

        if self.lo_unit != self.hi_unit {
            // Sentinel so the merge scan below stops at the unit frontier.
            self.set_u32(self.lo_unit, 0);
        }

        // Chain all free blocks into one list, merging runs of adjacent
        // blocks as they are visited. `prev` is the offset of the next-field
        // to patch; 0 addresses the local list head.
        let mut head: u32 = 0;
        let mut prev: u32 = 0;
        for i in 0..INDEX_COUNT {
            let mut next = self.free_list[i];
            self.free_list[i] = 0;
            while next != 0 {
                let node = next;
                let mut nu = self.node_nu(node);
                if prev == 0 {
                    head = node;
                } else {
                    self.set_u32(prev, node);
                }
                next = self.node_next(node);
                if nu != 0 {
                    prev = node + 4;
                    loop {
                        let node2 = node + nu * UNIT_SIZE;
                        if self.node_stamp(node2) != STAMP_FREE {
                            break;
                        }
                        nu += self.node_nu(node2);
                        self.set_u32(node2 + 8, 0);
                        self.set_u32(node + 8, nu);
                    }
                }
            }
        }
        if prev == 0 {
            head = 0;
        } else {
            self.set_u32(prev, 0);
        }

        // Redistribute the merged blocks over the size-classed lists.
        let mut n = head;
        while n != 0 {
            let mut node = n;
            let mut nu = self.node_nu(node);
            n = self.node_next(node);
            if nu == 0 {
                continue;
            }
            while nu > 128 {
                self.insert_node(node, INDEX_COUNT - 1);
                nu -= 128;
                node += 128 * UNIT_SIZE;
            }
            let mut i = self.units_index(nu);
            if self.index2units[i] as u32 != nu {
                i -= 1;
                let k = self.index2units[i] as u32;
                self.insert_node(node + k * UNIT_SIZE, (nu - k - 1) as usize);
            }
            self.insert_node(node, i);
        }
    }

    fn alloc_units_rare(&mut self, indx: usize) -> u32 {
        if self.glue_count == 0 {
            self.glue_free_blocks();
            if self.free_list[indx] != 0 {
                return self.remove_node(indx);
            }
        }
        let mut i = indx;
        loop {
            i += 1;
            if i == INDEX_COUNT {
                let num_bytes = self.index2units[indx] as u32 * UNIT_SIZE;
                let us = self.units_start;
                self.glue_count = self.glue_count.wrapping_sub(1);
                return if us - self.text > num_bytes {
                    self.units_start = us - num_bytes;
                    self.units_start
                } else {
                    0
                };
            }
            if self.free_list[i] != 0 {
                break;
            }
        }
        let block = self.remove_node(i);
        self.split_block(block, i, indx);
        block
    }

    /// Allocates a block of the given size class. Returns 0 when the arena
    /// is exhausted.
    pub(crate) fn alloc_units(&mut self, indx: usize) -> u32 {
        if self.free_list[indx] != 0 {
            return self.remove_node(indx);
        }
        let num_bytes = self.index2units[indx] as u32 * UNIT_SIZE;
        let lo = self.lo_unit;
        if self.hi_unit - lo >= num_bytes {
            self.lo_unit = lo + num_bytes;
            return lo;
        }
        self.alloc_units_rare(indx)
    }

    /// Allocates one context record, preferring the high area.
    pub(crate) fn alloc_context(&mut self) -> u32 {
        if self.hi_unit != self.lo_unit {
            self.hi_unit -= UNIT_SIZE;
            return self.hi_unit;
        }
        if self.free_list[0] != 0 {
            return self.remove_node(0);
        }
        self.alloc_units_rare(0)
    }

    pub(crate) fn shrink_units(&mut self, old_ptr: u32, old_nu: u32, new_nu: u32) -> u32 {
        let i0 = self.units_index(old_nu);
        let i1 = self.units_index(new_nu);
        if i0 == i1 {
            return old_ptr;
        }
        if self.free_list[i1] != 0 {
            let ptr = self.remove_node(i1);
            self.copy_units(ptr, old_ptr, new_nu);
            self.insert_node(old_ptr, i0);
            ptr
        } else {
            self.split_block(old_ptr, i0, i1);
            old_ptr
        }
    }

    pub(crate) fn free_units(&mut self, ptr: u32, nu: u32) {
        let indx = self.units_index(nu);
        self.insert_node(ptr, indx);
    }

    pub(crate) fn special_free_unit(&mut self, ptr: u32) {
        if ptr != self.units_start {
            self.insert_node(ptr, 0);
        } else {
            self.units_start += UNIT_SIZE;
        }
    }

    /// Returns freed blocks bordering the unit frontier to the text area.
    pub(crate) fn expand_text_area(&mut self) {
        let mut count = [0u32; INDEX_COUNT];
        if self.lo_unit != self.hi_unit {
            self.set_u32(self.lo_unit, 0);
        }

        let mut node = self.units_start;
        while self.node_stamp(node) == STAMP_FREE {
            let nu = self.node_nu(node);
            self.set_u32(node, 0);
            count[self.units_index(nu)] += 1;
            node += nu * UNIT_SIZE;
        }
        self.units_start = node;

        for i in 0..INDEX_COUNT {
            let mut cnt = count[i];
            if cnt == 0 {
                continue;
            }
            // Unlink the reclaimed blocks; they are the ones whose stamp was
            // cleared above.
            let mut prev: u32 = 0;
            let mut n = self.free_list[i];
            self.stamps[i] -= cnt;
            loop {
                let node = n;
                n = self.node_next(node);
                if self.node_stamp(node) != 0 {
                    prev = node + 4;
                } else {
                    if prev == 0 {
                        self.free_list[i] = n;
                    } else {
                        self.set_u32(prev, n);
                    }
                    cnt -= 1;
                    if cnt == 0 {
                        break;
                    }
                }
            }
        }
    }

    pub(crate) fn used_memory(&self) -> u32 {
        let mut free_units = 0u32;
        for i in 0..INDEX_COUNT {
            free_units = free_units.wrapping_add(self.stamps[i] * self.index2units[i] as u32);
        }
        self.size
            - (self.hi_unit - self.lo_unit)
            - (self.units_start - self.text)
            - free_units * UNIT_SIZE
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn size_class_tables() {
        let arena = Arena::new(1 << 16).unwrap();
        // Classes 0..3 hold 1..4 units, afterwards the granularity widens.
        assert_eq!(arena.index_units(0), 1);
        assert_eq!(arena.index_units(3), 4);
        assert_eq!(arena.index_units(INDEX_COUNT - 1), 128);
        for nu in 1..=128u32 {
            let indx = arena.units_index(nu);
            assert!(arena.index_units(indx) >= nu);
        }
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let mut arena = Arena::new(1 << 16).unwrap();
        arena.reset();
        let a = arena.alloc_units(0);
        let b = arena.alloc_units(2);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        let used = arena.used_memory();
        arena.free_units(a, 1);
        assert!(arena.used_memory() < used);
        // The freed block is recycled for the next same-class request.
        assert_eq!(arena.alloc_units(0), a);
    }

    #[test]
    fn reset_restores_geometry() {
        let mut arena = Arena::new(1 << 16).unwrap();
        arena.reset();
        let units_start = arena.units_start;
        arena.alloc_units(5);
        arena.alloc_context();
        arena.reset();
        assert_eq!(arena.units_start, units_start);
        assert_eq!(arena.lo_unit, units_start);
        assert_eq!(arena.used_memory(), 0);
    }
}
