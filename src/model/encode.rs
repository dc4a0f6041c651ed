use super::{
    coder::RangeEncoder, ppmd_update_prob_1, Ppmd8, EXP_ESCAPE, INT_BITS,
};

impl Ppmd8<RangeEncoder> {
    /// Encodes one symbol and updates the model. A negative `symbol` encodes
    /// the end marker: it matches nothing, escapes through every suffix
    /// level and falls out of the root context.
    pub(crate) fn encode_symbol(&mut self, symbol: i32) {
        let mut char_mask = [u8::MAX; 256];

        if self.arena.ctx_num_stats(self.min_context) != 0 {
            let mut s = self.arena.ctx_stats(self.min_context);
            let summ_freq = self
                .rc
                .correct_sum_range(self.arena.ctx_summ_freq(self.min_context) as u32);

            if self.arena.st_symbol(s) as i32 == symbol {
                self.rc.encode(0, self.arena.st_freq(s) as u32, summ_freq);
                self.rc.normalize();
                self.found_state = s;
                self.update1_0();
                return;
            }
            self.prev_success = 0;
            let mut sum = self.arena.st_freq(s) as u32;
            for _ in 0..self.arena.ctx_num_stats(self.min_context) {
                s += 6;
                if self.arena.st_symbol(s) as i32 == symbol {
                    self.rc.encode(sum, self.arena.st_freq(s) as u32, summ_freq);
                    self.rc.normalize();
                    self.found_state = s;
                    self.update1();
                    return;
                }
                sum = sum.wrapping_add(self.arena.st_freq(s) as u32);
            }
            self.rc.encode(sum, summ_freq.wrapping_sub(sum), summ_freq);
            self.mask_symbols(&mut char_mask, s, self.arena.ctx_stats(self.min_context));
        } else {
            let s = self.arena.one_state(self.min_context);
            let (bi, bk) = self.bin_summ_index();
            let mut pr = self.bin_summ[bi][bk] as u32;
            let bound = (self.rc.range >> 14) * pr;
            pr = ppmd_update_prob_1(pr);

            if self.arena.st_symbol(s) as i32 == symbol {
                self.bin_summ[bi][bk] = (pr + (1 << INT_BITS)) as u16;
                self.rc.encode_bit_0(bound);
                self.rc.normalize();
                let freq = self.arena.st_freq(s) as u32;
                let c = self.arena.st_successor(s);
                self.found_state = s;
                self.prev_success = 1;
                self.run_length += 1;
                self.arena.set_st_freq(s, (freq + (freq < 196) as u32) as u8);
                if self.order_fall == 0 && c >= self.arena.units_start {
                    self.min_context = c;
                    self.max_context = c;
                } else {
                    self.update_model();
                }
                return;
            }
            self.bin_summ[bi][bk] = pr as u16;
            self.init_esc = EXP_ESCAPE[(pr >> 10) as usize] as u32;
            self.rc.encode_bit_1(bound);
            char_mask[self.arena.st_symbol(s) as usize] = 0;
            self.prev_success = 0;
        }

        loop {
            self.rc.normalize();

            // Walk up the suffix chain to the next context that has symbols
            // left to offer.
            let mut mc = self.min_context;
            let num_masked = self.arena.ctx_num_stats(mc) as u32;
            loop {
                self.order_fall += 1;
                if self.arena.ctx_suffix(mc) == 0 {
                    // The end marker escaped out of the root.
                    return;
                }
                mc = self.arena.ctx_suffix(mc);
                if self.arena.ctx_num_stats(mc) as u32 != num_masked {
                    break;
                }
            }
            self.min_context = mc;

            let (slot, esc_freq) = self.make_esc_freq(num_masked);
            let mut s = self.arena.ctx_stats(mc);
            let mut sum = 0u32;
            let mut i = self.arena.ctx_num_stats(mc) as u32 + 1;
            loop {
                let cur = self.arena.st_symbol(s);
                if cur as i32 == symbol {
                    let low = sum;
                    let freq = self.arena.st_freq(s) as u32;
                    self.see_mut(slot).update();
                    self.found_state = s;
                    sum += esc_freq;
                    // Complete the total over the remaining unmasked states.
                    let num2 = i / 2;
                    i &= 1;
                    sum = sum.wrapping_add(freq & 0u32.wrapping_sub(i));
                    if num2 != 0 {
                        s += 6 * i;
                        for _ in 0..num2 {
                            let sym0 = self.arena.st_symbol(s) as usize;
                            let sym1 = self.arena.st_symbol(s + 6) as usize;
                            s += 12;
                            sum = sum.wrapping_add(
                                self.arena.st_freq(s - 12) as u32 & char_mask[sym0] as u32,
                            );
                            sum = sum.wrapping_add(
                                self.arena.st_freq(s - 6) as u32 & char_mask[sym1] as u32,
                            );
                        }
                    }
                    let sum = self.rc.correct_sum_range(sum);
                    self.rc.encode(low, freq, sum);
                    self.rc.normalize();
                    self.update2();
                    return;
                }
                sum = sum.wrapping_add(self.arena.st_freq(s) as u32 & char_mask[cur as usize] as u32);
                s += 6;
                i -= 1;
                if i == 0 {
                    break;
                }
            }

            let mut total = sum.wrapping_add(esc_freq);
            let see = self.see_mut(slot);
            see.summ = (see.summ as u32).wrapping_add(total) as u16;
            total = self.rc.correct_sum_range(total);
            self.rc.encode(sum, total.wrapping_sub(sum), total);
            self.mask_symbols(&mut char_mask, s - 6, self.arena.ctx_stats(self.min_context));
        }
    }
}
