//! The PPMd var.I rev.1 model: an order-N suffix trie of byte contexts over
//! a fixed arena, with SEE (secondary escape estimation) for escape
//! probabilities.
//!
//! Context records and state arrays live in the arena and are addressed by
//! `u32` offsets, matching the reference memory layout byte for byte. A
//! successor value below `units_start` points into the text area and marks a
//! context that has not been built yet; `create_successors` materializes
//! such chains on demand.

pub(crate) mod coder;
mod decode;
mod encode;
mod memory;

pub(crate) use coder::{RangeDecoder, RangeEncoder};

use crate::{Result, RestoreMethod};
use memory::{Arena, UNIT_SIZE};

const MAX_FREQ: u8 = 124;
const INT_BITS: u32 = 7;
const PERIOD_BITS: u32 = 7;
const BIN_SCALE: u32 = 1 << (INT_BITS + PERIOD_BITS);

const FLAG_RESCALED: u8 = 1 << 2;
const FLAG_HIGH: u8 = 1 << 3;
const FLAG_PREV_HIGH: u8 = 1 << 4;

static EXP_ESCAPE: [u8; 16] = [25, 14, 9, 7, 5, 5, 4, 4, 4, 3, 3, 3, 2, 2, 2, 2];

static INIT_BIN_ESC: [u16; 8] = [
    0x3CDD, 0x1F3F, 0x59BF, 0x48F3, 0x64A1, 0x5ABC, 0x6632, 0x6051,
];

#[inline(always)]
const fn ppmd_get_mean(summ: u32) -> u32 {
    (summ + (1 << (PERIOD_BITS - 2))) >> PERIOD_BITS
}

/// Ages a probability towards zero.
#[inline(always)]
pub(crate) const fn ppmd_update_prob_1(prob: u32) -> u32 {
    prob - ppmd_get_mean(prob)
}

/// One SEE counter: an adaptive shift-register estimate of the escape
/// frequency for a class of contexts.
#[derive(Copy, Clone, Default)]
pub(crate) struct See {
    summ: u16,
    shift: u8,
    count: u8,
}

impl See {
    /// Halves the counter period once enough updates accumulated.
    pub(crate) fn update(&mut self) {
        if (self.shift as u32) < PERIOD_BITS && {
            self.count -= 1;
            self.count == 0
        } {
            self.summ <<= 1;
            self.count = 3 << self.shift;
            self.shift += 1;
        }
    }
}

/// Identifies the SEE counter picked by `make_esc_freq`, so callers can
/// update it after coding without holding a borrow across the range coder.
#[derive(Copy, Clone)]
pub(crate) enum SeeSlot {
    Table(u8, u8),
    Dummy,
}

/// Rollback point for incremental decoding. Everything the decoder mutates
/// before a symbol's last input read lives outside the arena, so saving the
/// scalars and the probability tables is enough to retry a symbol.
pub(crate) struct ModelSnapshot {
    min_context: u32,
    max_context: u32,
    found_state: u32,
    order_fall: u32,
    init_esc: u32,
    prev_success: u32,
    run_length: i32,
    init_rl: i32,
    dummy_see: See,
    see: [[See; 32]; 24],
    bin_summ: [[u16; 64]; 25],
}

pub(crate) struct Ppmd8<RC> {
    pub(crate) arena: Arena,
    min_context: u32,
    max_context: u32,
    found_state: u32,
    order_fall: u32,
    init_esc: u32,
    prev_success: u32,
    max_order: u32,
    restore_method: RestoreMethod,
    run_length: i32,
    init_rl: i32,
    ns2bs_index: [u8; 256],
    ns2index: [u8; 260],
    dummy_see: See,
    see: [[See; 32]; 24],
    bin_summ: [[u16; 64]; 25],
    pub(crate) rc: RC,
}

impl<RC> Ppmd8<RC> {
    pub(crate) fn new(
        rc: RC,
        max_order: u32,
        mem_size: u32,
        restore_method: RestoreMethod,
    ) -> Result<Self> {
        let arena = Arena::new(mem_size)?;

        let mut ns2bs_index = [0u8; 256];
        ns2bs_index[0] = 0;
        ns2bs_index[1] = 2;
        ns2bs_index[2..11].fill(4);
        ns2bs_index[11..256].fill(6);

        let mut ns2index = [0u8; 260];
        for i in 0..5 {
            ns2index[i] = i as u8;
        }
        let mut m = 5u8;
        let mut k = 1u32;
        for i in 5..260 {
            ns2index[i] = m;
            k -= 1;
            if k == 0 {
                m += 1;
                k = m as u32 - 4;
            }
        }

        let mut ppmd = Self {
            arena,
            min_context: 0,
            max_context: 0,
            found_state: 0,
            order_fall: 0,
            init_esc: 0,
            prev_success: 0,
            max_order,
            restore_method,
            run_length: 0,
            init_rl: 0,
            ns2bs_index,
            ns2index,
            dummy_see: See::default(),
            see: [[See::default(); 32]; 24],
            bin_summ: [[0; 64]; 25],
            rc,
        };
        ppmd.restart_model();
        Ok(ppmd)
    }

    fn restart_model(&mut self) {
        self.arena.reset();
        self.order_fall = self.max_order;
        self.init_rl = -((self.max_order.min(12)) as i32) - 1;
        self.run_length = self.init_rl;
        self.prev_success = 0;

        // The root context sees all 256 symbols with frequency 1.
        self.arena.hi_unit -= UNIT_SIZE;
        let mc = self.arena.hi_unit;
        let stats = self.arena.lo_unit;
        self.arena.lo_unit += (256 / 2) * UNIT_SIZE;
        self.min_context = mc;
        self.max_context = mc;
        self.found_state = stats;
        self.arena.set_ctx_flags(mc, 0);
        self.arena.set_ctx_num_stats(mc, 255);
        self.arena.set_ctx_summ_freq(mc, 256 + 1);
        self.arena.set_ctx_stats(mc, stats);
        self.arena.set_ctx_suffix(mc, 0);
        for i in 0..256u32 {
            let s = stats + i * 6;
            self.arena.set_st_symbol(s, i as u8);
            self.arena.set_st_freq(s, 1);
            self.arena.set_st_successor(s, 0);
        }

        let mut i = 0usize;
        for m in 0..25usize {
            while self.ns2index[i] as usize == m {
                i += 1;
            }
            for k in 0..8usize {
                let val = (BIN_SCALE - INIT_BIN_ESC[k] as u32 / (i as u32 + 1)) as u16;
                for r in (0..64).step_by(8) {
                    self.bin_summ[m][k + r] = val;
                }
            }
        }

        let mut i = 0usize;
        for m in 0..24usize {
            while self.ns2index[i + 3] as usize == m + 3 {
                i += 1;
            }
            let summ = ((2 * i as u32 + 5) << (PERIOD_BITS - 4)) as u16;
            for k in 0..32usize {
                self.see[m][k] = See {
                    summ,
                    shift: (PERIOD_BITS - 4) as u8,
                    count: 7,
                };
            }
        }
        self.dummy_see = See {
            summ: 0,
            shift: PERIOD_BITS as u8,
            count: 64,
        };
    }

    /// Rebuilds a context's stats array with all frequencies scaled down,
    /// shrinking the allocation when the class changes.
    fn refresh(&mut self, ctx: u32, old_nu: u32, mut scale: u32) {
        let ns = self.arena.ctx_num_stats(ctx) as u32;
        let stats = self.arena.ctx_stats(ctx);
        let s = self.arena.shrink_units(stats, old_nu, (ns + 2) >> 1);
        self.arena.set_ctx_stats(ctx, s);
        scale |= (self.arena.ctx_summ_freq(ctx) as u32 >= 1 << 15) as u32;

        let mut flags = self.arena.st_symbol(s) as u32 + 0xC0;
        let mut freq = self.arena.st_freq(s) as u32;
        let mut esc_freq = (self.arena.ctx_summ_freq(ctx) as u32).wrapping_sub(freq);
        freq = (freq + scale) >> scale;
        let mut sum_freq = freq;
        self.arena.set_st_freq(s, freq as u8);

        let mut s = s;
        let mut i = ns;
        loop {
            s += 6;
            let mut freq = self.arena.st_freq(s) as u32;
            esc_freq = esc_freq.wrapping_sub(freq);
            freq = (freq + scale) >> scale;
            sum_freq += freq;
            self.arena.set_st_freq(s, freq as u8);
            flags |= self.arena.st_symbol(s) as u32 + 0xC0;
            i -= 1;
            if i == 0 {
                break;
            }
        }
        self.arena
            .set_ctx_summ_freq(ctx, (sum_freq + ((esc_freq.wrapping_add(scale)) >> scale)) as u16);
        let new_flags = (self.arena.ctx_flags(ctx) as u32
            & (FLAG_PREV_HIGH as u32 + FLAG_RESCALED as u32 * scale))
            + ((flags >> (8 - 3)) & FLAG_HIGH as u32);
        self.arena.set_ctx_flags(ctx, new_flags as u8);
    }

    /// Prunes a subtree for the CutOff restore path. Returns the (possibly
    /// moved) context offset or 0 when the context was dropped entirely.
    fn cut_off(&mut self, ctx: u32, order: u32) -> u32 {
        let mut ns = self.arena.ctx_num_stats(ctx) as i32;

        if ns == 0 {
            let s = self.arena.one_state(ctx);
            let mut successor = self.arena.st_successor(s);
            if successor >= self.arena.units_start {
                successor = if order < self.max_order {
                    self.cut_off(successor, order + 1)
                } else {
                    0
                };
                self.arena.set_st_successor(s, successor);
                if successor != 0 || order <= 9 {
                    return ctx;
                }
            }
            self.arena.special_free_unit(ctx);
            return 0;
        }

        let nu = (ns as u32 + 2) >> 1;
        let indx = self.arena.units_index(nu);
        let mut stats = self.arena.ctx_stats(ctx);
        // Relocate stat blocks near the unit frontier downwards so the
        // upcoming expand_text_area pass can reclaim more room.
        if stats - self.arena.units_start <= 1 << 14
            && stats <= self.arena.free_list_head(indx)
        {
            let ptr = self.arena.remove_node(indx);
            self.arena.set_ctx_stats(ctx, ptr);
            self.arena.copy_units(ptr, stats, nu);
            if stats != self.arena.units_start {
                self.arena.insert_node(stats, indx);
            } else {
                self.arena.units_start += self.arena.index_units(indx) * UNIT_SIZE;
            }
            stats = ptr;
        }

        let mut s = stats + ns as u32 * 6;
        loop {
            let successor = self.arena.st_successor(s);
            if successor < self.arena.units_start {
                let s2 = stats + ns as u32 * 6;
                ns -= 1;
                if order != 0 {
                    if s != s2 {
                        self.arena.copy_state(s, s2);
                    }
                } else {
                    self.arena.swap_states(s, s2);
                    self.arena.set_st_successor(s2, 0);
                }
            } else if order < self.max_order {
                let v = self.cut_off(successor, order + 1);
                self.arena.set_st_successor(s, v);
            } else {
                self.arena.set_st_successor(s, 0);
            }
            if s == stats {
                break;
            }
            s -= 6;
        }

        if ns != self.arena.ctx_num_stats(ctx) as i32 && order != 0 {
            if ns < 0 {
                self.arena.free_units(stats, nu);
                self.arena.special_free_unit(ctx);
                return 0;
            }
            self.arena.set_ctx_num_stats(ctx, ns as u8);
            if ns == 0 {
                let sym = self.arena.st_symbol(stats);
                let flags = ((self.arena.ctx_flags(ctx) & FLAG_PREV_HIGH) as u32)
                    + (((sym as u32 + 0xC0) >> (8 - 3)) & FLAG_HIGH as u32);
                self.arena.set_ctx_flags(ctx, flags as u8);
                let freq = ((self.arena.st_freq(stats) as u32 + 11) >> 3) as u8;
                let successor = self.arena.st_successor(stats);
                let one = self.arena.one_state(ctx);
                self.arena.set_st_symbol(one, sym);
                self.arena.set_st_freq(one, freq);
                self.arena.set_st_successor(one, successor);
                self.arena.free_units(stats, nu);
            } else {
                let scale = (self.arena.ctx_summ_freq(ctx) as u32 > 16 * ns as u32) as u32;
                self.refresh(ctx, nu, scale);
            }
        }
        ctx
    }

    /// Brings the model back to a consistent state after the arena filled
    /// up mid-update. `ctx_error` is the first context that was not touched
    /// by the failed update pass.
    fn restore_model(&mut self, ctx_error: u32) {
        self.arena.text = self.arena.text_start();

        // Undo the half-appended states on the max..error chain.
        let mut c = self.max_context;
        while c != ctx_error {
            let ns = self.arena.ctx_num_stats(c).wrapping_sub(1);
            self.arena.set_ctx_num_stats(c, ns);
            if ns == 0 {
                let s = self.arena.ctx_stats(c);
                let flags = ((self.arena.ctx_flags(c) & FLAG_PREV_HIGH) as u32)
                    + (((self.arena.st_symbol(s) as u32 + 0xC0) >> (8 - 3)) & FLAG_HIGH as u32);
                self.arena.set_ctx_flags(c, flags as u8);
                let sym = self.arena.st_symbol(s);
                let freq = ((self.arena.st_freq(s) as u32 + 11) >> 3) as u8;
                let successor = self.arena.st_successor(s);
                let one = self.arena.one_state(c);
                self.arena.set_st_symbol(one, sym);
                self.arena.set_st_freq(one, freq);
                self.arena.set_st_successor(one, successor);
                self.arena.special_free_unit(s);
            } else {
                self.refresh(c, (self.arena.ctx_num_stats(c) as u32 + 3) >> 1, 0);
            }
            c = self.arena.ctx_suffix(c);
        }

        // Age the remaining chain down to the min context.
        while c != self.min_context {
            let ns = self.arena.ctx_num_stats(c);
            if ns == 0 {
                let one = self.arena.one_state(c);
                let freq = self.arena.st_freq(one);
                self.arena.set_st_freq(one, ((freq as u32 + 1) >> 1) as u8);
            } else {
                let summ = self.arena.ctx_summ_freq(c).wrapping_add(4);
                self.arena.set_ctx_summ_freq(c, summ);
                if summ as u32 > 128 + 4 * ns as u32 {
                    self.refresh(c, (ns as u32 + 2) >> 1, 1);
                }
            }
            c = self.arena.ctx_suffix(c);
        }

        if self.restore_method == RestoreMethod::Restart
            || self.arena.used_memory() < self.arena.size >> 1
        {
            self.restart_model();
        } else {
            while self.arena.ctx_suffix(self.max_context) != 0 {
                self.max_context = self.arena.ctx_suffix(self.max_context);
            }
            loop {
                self.cut_off(self.max_context, 0);
                self.arena.expand_text_area();
                if self.arena.used_memory() <= 3 * (self.arena.size >> 2) {
                    break;
                }
            }
            self.arena.glue_count = 0;
            self.order_fall = self.max_order;
        }
        self.min_context = self.max_context;
    }

    /// Builds the chain of single-state contexts between the found state's
    /// successor text position and the already materialized part of the
    /// trie. Returns 0 when the arena is exhausted.
    fn create_successors(&mut self, skip: bool, mut s1: Option<u32>, mut c: u32) -> u32 {
        let mut up_branch = self.arena.st_successor(self.found_state);
        let mut ps = [0u32; crate::MAX_ORDER as usize + 2];
        let mut num_ps = 0usize;

        if !skip {
            ps[num_ps] = self.found_state;
            num_ps += 1;
        }
        while self.arena.ctx_suffix(c) != 0 {
            c = self.arena.ctx_suffix(c);
            let s;
            if let Some(s1v) = s1.take() {
                s = s1v;
            } else if self.arena.ctx_num_stats(c) != 0 {
                let sym = self.arena.st_symbol(self.found_state);
                let mut t = self.arena.ctx_stats(c);
                while self.arena.st_symbol(t) != sym {
                    t += 6;
                }
                if self.arena.st_freq(t) < MAX_FREQ - 9 {
                    self.arena.set_st_freq(t, self.arena.st_freq(t) + 1);
                    self.arena
                        .set_ctx_summ_freq(c, self.arena.ctx_summ_freq(c) + 1);
                }
                s = t;
            } else {
                let t = self.arena.one_state(c);
                let suffix = self.arena.ctx_suffix(c);
                let bump = (self.arena.ctx_num_stats(suffix) == 0) as u8
                    & (self.arena.st_freq(t) < 24) as u8;
                self.arena.set_st_freq(t, self.arena.st_freq(t) + bump);
                s = t;
            }
            let successor = self.arena.st_successor(s);
            if successor != up_branch {
                c = successor;
                if num_ps == 0 {
                    return c;
                }
                break;
            }
            ps[num_ps] = s;
            num_ps += 1;
        }

        let new_sym = self.arena.u8_at(up_branch);
        up_branch += 1;
        let flags = ((((self.arena.st_symbol(self.found_state) as u32) + 0xC0) >> (8 - 4))
            & FLAG_PREV_HIGH as u32)
            + (((new_sym as u32 + 0xC0) >> (8 - 3)) & FLAG_HIGH as u32);

        let new_freq = if self.arena.ctx_num_stats(c) == 0 {
            self.arena.st_freq(self.arena.one_state(c))
        } else {
            let mut t = self.arena.ctx_stats(c);
            while self.arena.st_symbol(t) != new_sym {
                t += 6;
            }
            let cf = self.arena.st_freq(t) as u32 - 1;
            let s0 = self.arena.ctx_summ_freq(c) as u32
                - self.arena.ctx_num_stats(c) as u32
                - cf;
            (1 + if 2 * cf <= s0 {
                (5 * cf > s0) as u32
            } else {
                (cf + 2 * s0 - 3) / s0
            }) as u8
        };

        loop {
            let c1 = self.arena.alloc_context();
            if c1 == 0 {
                return 0;
            }
            self.arena.set_ctx_flags(c1, flags as u8);
            self.arena.set_ctx_num_stats(c1, 0);
            let one = self.arena.one_state(c1);
            self.arena.set_st_symbol(one, new_sym);
            self.arena.set_st_freq(one, new_freq);
            self.arena.set_st_successor(one, up_branch);
            self.arena.set_ctx_suffix(c1, c);
            num_ps -= 1;
            self.arena.set_st_successor(ps[num_ps], c1);
            c = c1;
            if num_ps == 0 {
                break;
            }
        }
        c
    }

    /// Fallback path when the found state has no successor yet: shortens
    /// the effective order by pointing the suffix chain at the text area.
    fn reduce_order(&mut self, mut s1: Option<u32>, mut c: u32) -> u32 {
        let c1 = c;
        let up_branch = self.arena.text;
        self.arena.set_st_successor(self.found_state, up_branch);
        self.order_fall += 1;

        let mut s;
        loop {
            if let Some(s1v) = s1.take() {
                c = self.arena.ctx_suffix(c);
                s = s1v;
            } else {
                if self.arena.ctx_suffix(c) == 0 {
                    return c;
                }
                c = self.arena.ctx_suffix(c);
                if self.arena.ctx_num_stats(c) != 0 {
                    let sym = self.arena.st_symbol(self.found_state);
                    let mut t = self.arena.ctx_stats(c);
                    while self.arena.st_symbol(t) != sym {
                        t += 6;
                    }
                    if self.arena.st_freq(t) < MAX_FREQ - 9 {
                        self.arena.set_st_freq(t, self.arena.st_freq(t) + 2);
                        self.arena
                            .set_ctx_summ_freq(c, self.arena.ctx_summ_freq(c) + 2);
                    }
                    s = t;
                } else {
                    let t = self.arena.one_state(c);
                    let freq = self.arena.st_freq(t);
                    self.arena.set_st_freq(t, freq + (freq < 32) as u8);
                    s = t;
                }
            }
            if self.arena.st_successor(s) != 0 {
                break;
            }
            self.arena.set_st_successor(s, up_branch);
            self.order_fall += 1;
        }

        if self.arena.st_successor(s) <= up_branch {
            let saved = self.found_state;
            self.found_state = s;
            let successor = self.create_successors(false, None, c);
            self.arena.set_st_successor(s, successor);
            self.found_state = saved;
        }
        let successor = self.arena.st_successor(s);
        if self.order_fall == 1 && c1 == self.max_context {
            self.arena.set_st_successor(self.found_state, successor);
            self.arena.text -= 1;
        }
        successor
    }

    pub(crate) fn update_model(&mut self) {
        let mut min_successor = self.arena.st_successor(self.found_state);
        let f_freq = self.arena.st_freq(self.found_state) as u32;
        let f_symbol = self.arena.st_symbol(self.found_state);
        let mut s: Option<u32> = None;

        if self.arena.st_freq(self.found_state) < MAX_FREQ / 4
            && self.arena.ctx_suffix(self.min_context) != 0
        {
            let c = self.arena.ctx_suffix(self.min_context);
            if self.arena.ctx_num_stats(c) == 0 {
                let t = self.arena.one_state(c);
                if self.arena.st_freq(t) < 32 {
                    self.arena.set_st_freq(t, self.arena.st_freq(t) + 1);
                }
                s = Some(t);
            } else {
                let mut t = self.arena.ctx_stats(c);
                if self.arena.st_symbol(t) != f_symbol {
                    while self.arena.st_symbol(t) != f_symbol {
                        t += 6;
                    }
                    if self.arena.st_freq(t) >= self.arena.st_freq(t - 6) {
                        self.arena.swap_states(t, t - 6);
                        t -= 6;
                    }
                }
                if self.arena.st_freq(t) < MAX_FREQ - 9 {
                    self.arena.set_st_freq(t, self.arena.st_freq(t) + 2);
                    self.arena
                        .set_ctx_summ_freq(c, self.arena.ctx_summ_freq(c).wrapping_add(2));
                }
                s = Some(t);
            }
        }

        let c_err = self.max_context;
        if self.order_fall == 0 && min_successor != 0 {
            let cs = self.create_successors(true, s, self.min_context);
            if cs == 0 {
                self.arena.set_st_successor(self.found_state, 0);
                self.restore_model(c_err);
                return;
            }
            self.arena.set_st_successor(self.found_state, cs);
            self.min_context = cs;
            self.max_context = cs;
            return;
        }

        let text = self.arena.text;
        self.arena.set_u8(text, f_symbol);
        self.arena.text = text + 1;
        if self.arena.text >= self.arena.units_start {
            self.restore_model(c_err);
            return;
        }
        let mut max_successor = self.arena.text;

        if min_successor == 0 {
            let cs = self.reduce_order(s, self.min_context);
            if cs == 0 {
                self.restore_model(c_err);
                return;
            }
            min_successor = cs;
        } else if min_successor < self.arena.units_start {
            let cs = self.create_successors(false, s, self.min_context);
            if cs == 0 {
                self.restore_model(c_err);
                return;
            }
            min_successor = cs;
        }

        self.order_fall -= 1;
        if self.order_fall == 0 {
            max_successor = min_successor;
            if self.max_context != self.min_context {
                self.arena.text -= 1;
            }
        }

        let flag = (((f_symbol as u32 + 0xC0) >> (8 - 3)) & FLAG_HIGH as u32) as u8;
        let ns = self.arena.ctx_num_stats(self.min_context) as u32;
        let s0 = self.arena.ctx_summ_freq(self.min_context) as u32 - ns - f_freq;

        let mut c = c_err;
        while c != self.min_context {
            let ns1 = self.arena.ctx_num_stats(c) as u32;
            let mut sum;
            if ns1 != 0 {
                if ns1 & 1 != 0 {
                    // The stats array grows by one state; reallocate when it
                    // crosses a size class boundary.
                    let old_nu = (ns1 + 1) >> 1;
                    let i = self.arena.units_index(old_nu);
                    if i != self.arena.units_index(old_nu + 1) {
                        let ptr = self.arena.alloc_units(i + 1);
                        if ptr == 0 {
                            self.restore_model(c);
                            return;
                        }
                        let old_ptr = self.arena.ctx_stats(c);
                        self.arena.copy_units(ptr, old_ptr, old_nu);
                        self.arena.insert_node(old_ptr, i);
                        self.arena.set_ctx_stats(c, ptr);
                    }
                }
                sum = self.arena.ctx_summ_freq(c) as u32;
                sum += (3 * ns1 + 1 < ns) as u32;
            } else {
                // Binary context becomes a two-state one.
                let st = self.arena.alloc_units(0);
                if st == 0 {
                    self.restore_model(c);
                    return;
                }
                let one = self.arena.one_state(c);
                self.arena.copy_state(st, one);
                self.arena.set_ctx_stats(c, st);
                let mut freq = self.arena.st_freq(st) as u32;
                if freq < MAX_FREQ as u32 / 4 - 1 {
                    freq <<= 1;
                } else {
                    freq = MAX_FREQ as u32 - 4;
                }
                self.arena.set_st_freq(st, freq as u8);
                sum = freq + self.init_esc + (ns > 2) as u32;
            }

            let s1 = self.arena.ctx_stats(c) + (ns1 + 1) * 6;
            let mut cf = 2 * (sum + 6) * f_freq;
            let sf = s0 + sum;
            self.arena.set_st_symbol(s1, f_symbol);
            self.arena.set_ctx_num_stats(c, (ns1 + 1) as u8);
            self.arena.set_st_successor(s1, max_successor);
            self.arena
                .set_ctx_flags(c, self.arena.ctx_flags(c) | flag);
            if cf < 6 * sf {
                cf = 1 + (cf > sf) as u32 + (cf >= 4 * sf) as u32;
                sum += 4;
            } else {
                cf = 4
                    + (cf > 9 * sf) as u32
                    + (cf > 12 * sf) as u32
                    + (cf > 15 * sf) as u32;
                sum += cf;
            }
            self.arena.set_ctx_summ_freq(c, sum as u16);
            self.arena.set_st_freq(s1, cf as u8);
            c = self.arena.ctx_suffix(c);
        }
        self.min_context = min_successor;
        self.max_context = min_successor;
    }

    /// Halves all frequencies of the min context, keeping the stats sorted
    /// and dropping states whose frequency reaches zero.
    fn rescale(&mut self) {
        let mc = self.min_context;
        let stats = self.arena.ctx_stats(mc);
        let mut s = self.found_state;

        if s != stats {
            let tmp = self.arena.state_get(s);
            while s != stats {
                self.arena.copy_state(s, s - 6);
                s -= 6;
            }
            self.arena.state_set(stats, tmp);
        }

        let mut sum_freq = self.arena.st_freq(stats) as u32;
        let mut esc_freq = (self.arena.ctx_summ_freq(mc) as u32).wrapping_sub(sum_freq);
        let adder = (self.order_fall != 0) as u32;
        sum_freq = (sum_freq + 4 + adder) >> 1;
        self.arena.set_st_freq(stats, sum_freq as u8);

        let mut i = self.arena.ctx_num_stats(mc) as u32;
        let mut s = stats;
        loop {
            s += 6;
            let mut freq = self.arena.st_freq(s) as u32;
            esc_freq = esc_freq.wrapping_sub(freq);
            freq = (freq + adder) >> 1;
            sum_freq += freq;
            self.arena.set_st_freq(s, freq as u8);
            if freq > self.arena.st_freq(s - 6) as u32 {
                let tmp = self.arena.state_get(s);
                let mut s1 = s;
                loop {
                    self.arena.copy_state(s1, s1 - 6);
                    s1 -= 6;
                    if !(s1 != stats && freq > self.arena.st_freq(s1 - 6) as u32) {
                        break;
                    }
                }
                self.arena.state_set(s1, tmp);
            }
            i -= 1;
            if i == 0 {
                break;
            }
        }

        if self.arena.st_freq(s) == 0 {
            let mut dropped = 0u32;
            loop {
                dropped += 1;
                s -= 6;
                if self.arena.st_freq(s) != 0 {
                    break;
                }
            }
            esc_freq += dropped;
            let num_stats = self.arena.ctx_num_stats(mc) as u32;
            let num_stats_new = num_stats - dropped;
            self.arena.set_ctx_num_stats(mc, num_stats_new as u8);
            let n0 = (num_stats + 2) >> 1;
            if num_stats_new == 0 {
                let mut freq =
                    (2 * self.arena.st_freq(stats) as u32 + esc_freq - 1) / esc_freq;
                if freq > MAX_FREQ as u32 / 3 {
                    freq = MAX_FREQ as u32 / 3;
                }
                let flags = ((self.arena.ctx_flags(mc) & FLAG_PREV_HIGH) as u32)
                    + (((self.arena.st_symbol(stats) as u32 + 0xC0) >> (8 - 3))
                        & FLAG_HIGH as u32);
                self.arena.set_ctx_flags(mc, flags as u8);
                let one = self.arena.one_state(mc);
                self.arena.copy_state(one, stats);
                self.arena.set_st_freq(one, freq as u8);
                self.found_state = one;
                let indx = self.arena.units_index(n0);
                self.arena.insert_node(stats, indx);
                return;
            }
            let n1 = (num_stats_new + 2) >> 1;
            if n0 != n1 {
                let ptr = self.arena.shrink_units(stats, n0, n1);
                self.arena.set_ctx_stats(mc, ptr);
            }
        }

        self.arena
            .set_ctx_summ_freq(mc, (sum_freq + esc_freq - (esc_freq >> 1)) as u16);
        self.arena
            .set_ctx_flags(mc, self.arena.ctx_flags(mc) | FLAG_RESCALED);
        self.found_state = self.arena.ctx_stats(mc);
    }

    /// Picks the SEE counter for the current escape and returns it together
    /// with the estimated escape frequency.
    fn make_esc_freq(&mut self, num_masked1: u32) -> (SeeSlot, u32) {
        let mc = self.min_context;
        let num_stats = self.arena.ctx_num_stats(mc) as u32;
        if num_stats != 0xFF {
            let i = self.ns2index[(num_stats + 2) as usize] as usize - 3;
            let k = (self.arena.ctx_summ_freq(mc) as u32 > 11 * (num_stats + 1)) as usize
                + 2 * ((2 * num_stats
                    < self.arena.ctx_num_stats(self.arena.ctx_suffix(mc)) as u32 + num_masked1)
                    as usize)
                + self.arena.ctx_flags(mc) as usize;
            let see = &mut self.see[i][k];
            let summ = see.summ as u32;
            let r = summ >> see.shift;
            see.summ = (summ - r) as u16;
            (SeeSlot::Table(i as u8, k as u8), r + (r == 0) as u32)
        } else {
            (SeeSlot::Dummy, 1)
        }
    }

    fn see_mut(&mut self, slot: SeeSlot) -> &mut See {
        match slot {
            SeeSlot::Table(i, k) => &mut self.see[i as usize][k as usize],
            SeeSlot::Dummy => &mut self.dummy_see,
        }
    }

    /// Index of the binary-context escape counter for the current state.
    fn bin_summ_index(&self) -> (usize, usize) {
        let mc = self.min_context;
        let one = self.arena.one_state(mc);
        let i = self.ns2index[(self.arena.st_freq(one) - 1) as usize] as usize;
        let k = self.prev_success as usize
            + ((self.run_length >> 26) & 0x20) as usize
            + self.ns2bs_index[self.arena.ctx_num_stats(self.arena.ctx_suffix(mc)) as usize]
                as usize
            + self.arena.ctx_flags(mc) as usize;
        (i, k)
    }

    /// Masks every symbol of the just-escaped context, from the first state
    /// up to and including `last`.
    fn mask_symbols(&self, char_mask: &mut [u8; 256], last: u32, first: u32) {
        char_mask[self.arena.st_symbol(last) as usize] = 0;
        let mut s = first;
        loop {
            char_mask[self.arena.st_symbol(s) as usize] = 0;
            char_mask[self.arena.st_symbol(s + 6) as usize] = 0;
            s += 12;
            if s >= last {
                break;
            }
        }
    }

    fn next_context(&mut self) {
        let c = self.arena.st_successor(self.found_state);
        if self.order_fall == 0 && c >= self.arena.units_start {
            self.min_context = c;
            self.max_context = c;
        } else {
            self.update_model();
        }
    }

    pub(crate) fn update1(&mut self) {
        let mut s = self.found_state;
        let freq = self.arena.st_freq(s) as u32 + 4;
        self.arena
            .set_ctx_summ_freq(self.min_context, self.arena.ctx_summ_freq(self.min_context) + 4);
        self.arena.set_st_freq(s, freq as u8);
        if freq > self.arena.st_freq(s - 6) as u32 {
            self.arena.swap_states(s, s - 6);
            s -= 6;
            self.found_state = s;
            if freq > MAX_FREQ as u32 {
                self.rescale();
            }
        }
        self.next_context();
    }

    pub(crate) fn update1_0(&mut self) {
        let s = self.found_state;
        let mc = self.min_context;
        let mut freq = self.arena.st_freq(s) as u32;
        let summ_freq = self.arena.ctx_summ_freq(mc) as u32;
        self.prev_success = (2 * freq >= summ_freq) as u32;
        self.run_length += self.prev_success as i32;
        self.arena.set_ctx_summ_freq(mc, (summ_freq + 4) as u16);
        freq += 4;
        self.arena.set_st_freq(s, freq as u8);
        if freq > MAX_FREQ as u32 {
            self.rescale();
        }
        self.next_context();
    }

    pub(crate) fn update2(&mut self) {
        let s = self.found_state;
        let freq = self.arena.st_freq(s) as u32 + 4;
        self.run_length = self.init_rl;
        self.arena
            .set_ctx_summ_freq(self.min_context, self.arena.ctx_summ_freq(self.min_context) + 4);
        self.arena.set_st_freq(s, freq as u8);
        if freq > MAX_FREQ as u32 {
            self.rescale();
        }
        self.update_model();
    }

    pub(crate) fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            min_context: self.min_context,
            max_context: self.max_context,
            found_state: self.found_state,
            order_fall: self.order_fall,
            init_esc: self.init_esc,
            prev_success: self.prev_success,
            run_length: self.run_length,
            init_rl: self.init_rl,
            dummy_see: self.dummy_see,
            see: self.see,
            bin_summ: self.bin_summ,
        }
    }

    pub(crate) fn rollback(&mut self, snap: &ModelSnapshot) {
        self.min_context = snap.min_context;
        self.max_context = snap.max_context;
        self.found_state = snap.found_state;
        self.order_fall = snap.order_fall;
        self.init_esc = snap.init_esc;
        self.prev_success = snap.prev_success;
        self.run_length = snap.run_length;
        self.init_rl = snap.init_rl;
        self.dummy_see = snap.dummy_see;
        self.see = snap.see;
        self.bin_summ = snap.bin_summ;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fresh_model() -> Ppmd8<()> {
        Ppmd8::new((), 6, 1 << 20, RestoreMethod::Restart).unwrap()
    }

    #[test]
    fn root_context_after_restart() {
        let p = fresh_model();
        let root = p.min_context;
        assert_eq!(p.arena.ctx_num_stats(root), 255);
        assert_eq!(p.arena.ctx_summ_freq(root), 257);
        assert_eq!(p.arena.ctx_suffix(root), 0);
        let stats = p.arena.ctx_stats(root);
        for i in 0..256u32 {
            let s = stats + i * 6;
            assert_eq!(p.arena.st_symbol(s), i as u8);
            assert_eq!(p.arena.st_freq(s), 1);
            assert_eq!(p.arena.st_successor(s), 0);
        }
        assert_eq!(p.order_fall, p.max_order);
        assert_eq!(p.run_length, -7);
    }

    #[test]
    fn symbol_count_index_table() {
        let p = fresh_model();
        for i in 0..5 {
            assert_eq!(p.ns2index[i], i as u8);
        }
        // The table widens its buckets as the symbol count grows.
        assert_eq!(p.ns2index[5], 5);
        assert_eq!(p.ns2index[214], 24);
        assert_eq!(p.ns2index[259], 27);
        assert!(p.ns2index.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn see_counter_period_doubles() {
        let mut see = See {
            summ: 100,
            shift: 3,
            count: 1,
        };
        see.update();
        assert_eq!(see.shift, 4);
        assert_eq!(see.summ, 200);
        assert_eq!(see.count, 3 << 3);
    }

    #[test]
    fn snapshot_rollback_restores_scalars() {
        let mut p = fresh_model();
        let snap = p.snapshot();
        p.prev_success = 1;
        p.run_length = 42;
        p.order_fall = 0;
        p.see[3][4].summ = 9;
        p.rollback(&snap);
        assert_eq!(p.prev_success, 0);
        assert_eq!(p.run_length, p.init_rl);
        assert_eq!(p.order_fall, p.max_order);
        assert_ne!(p.see[3][4].summ, 9);
    }
}
