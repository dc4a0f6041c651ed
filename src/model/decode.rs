use super::{
    coder::{RangeDecoder, Underflow},
    ppmd_update_prob_1, Ppmd8, EXP_ESCAPE, INT_BITS,
};
use crate::{SYM_END, SYM_ERROR};

impl Ppmd8<RangeDecoder> {
    /// Decodes one symbol and updates the model. Returns the symbol,
    /// [`SYM_END`] when the end marker escaped out of the root, or
    /// [`SYM_ERROR`] when the code register does not fit any interval.
    ///
    /// An [`Underflow`] leaves the coder registers and probability tables
    /// mid-symbol; the caller must roll back to a snapshot taken at the
    /// previous symbol boundary before retrying.
    pub(crate) fn decode_symbol(&mut self) -> Result<i32, Underflow> {
        let mut char_mask = [u8::MAX; 256];

        if self.arena.ctx_num_stats(self.min_context) != 0 {
            let mut s = self.arena.ctx_stats(self.min_context);
            let summ_freq = self
                .rc
                .correct_sum_range(self.arena.ctx_summ_freq(self.min_context) as u32);
            let mut count = self.rc.threshold(summ_freq);
            let hi_cnt = count;

            count = count.wrapping_sub(self.arena.st_freq(s) as u32);
            if (count as i32) < 0 {
                self.rc.decode(0, self.arena.st_freq(s) as u32);
                self.rc.normalize()?;
                self.found_state = s;
                let sym = self.arena.st_symbol(s);
                self.update1_0();
                return Ok(sym as i32);
            }
            self.prev_success = 0;
            let mut i = self.arena.ctx_num_stats(self.min_context) as u32;
            loop {
                s += 6;
                count = count.wrapping_sub(self.arena.st_freq(s) as u32);
                if (count as i32) < 0 {
                    let freq = self.arena.st_freq(s) as u32;
                    self.rc
                        .decode(hi_cnt.wrapping_sub(count).wrapping_sub(freq), freq);
                    self.rc.normalize()?;
                    self.found_state = s;
                    let sym = self.arena.st_symbol(s);
                    self.update1();
                    return Ok(sym as i32);
                }
                i -= 1;
                if i == 0 {
                    break;
                }
            }
            if hi_cnt >= summ_freq {
                return Ok(SYM_ERROR);
            }
            let hi_cnt = hi_cnt.wrapping_sub(count);
            self.rc.decode(hi_cnt, summ_freq.wrapping_sub(hi_cnt));
            self.mask_symbols(&mut char_mask, s, self.arena.ctx_stats(self.min_context));
        } else {
            let s = self.arena.one_state(self.min_context);
            let (bi, bk) = self.bin_summ_index();
            let mut pr = self.bin_summ[bi][bk] as u32;
            let size0 = (self.rc.range >> 14) * pr;
            pr = ppmd_update_prob_1(pr);

            if self.rc.code < size0 {
                self.bin_summ[bi][bk] = (pr + (1 << INT_BITS)) as u16;
                self.rc.decode_bit_0(size0);
                self.rc.normalize()?;
                let freq = self.arena.st_freq(s) as u32;
                let c = self.arena.st_successor(s);
                let sym = self.arena.st_symbol(s);
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
                return Ok(sym as i32);
            }
            self.bin_summ[bi][bk] = pr as u16;
            self.init_esc = EXP_ESCAPE[(pr >> 10) as usize] as u32;
            self.rc.decode_bit_1(size0);
            char_mask[self.arena.st_symbol(s) as usize] = 0;
            self.prev_success = 0;
        }

        loop {
            self.rc.normalize()?;

            let mut mc = self.min_context;
            let num_masked = self.arena.ctx_num_stats(mc) as u32;
            loop {
                self.order_fall += 1;
                if self.arena.ctx_suffix(mc) == 0 {
                    return Ok(SYM_END);
                }
                mc = self.arena.ctx_suffix(mc);
                if self.arena.ctx_num_stats(mc) as u32 != num_masked {
                    break;
                }
            }

            // Pairwise total over the unmasked states.
            let stats = self.arena.ctx_stats(mc);
            let mut num = self.arena.ctx_num_stats(mc) as u32 + 1;
            let mut num2 = num / 2;
            num &= 1;
            let mut hi_cnt = self.arena.st_freq(stats) as u32
                & char_mask[self.arena.st_symbol(stats) as usize] as u32
                & 0u32.wrapping_sub(num);
            let mut s = stats + 6 * num;
            self.min_context = mc;
            loop {
                let sym0 = self.arena.st_symbol(s) as usize;
                let sym1 = self.arena.st_symbol(s + 6) as usize;
                s += 12;
                hi_cnt = hi_cnt
                    .wrapping_add(self.arena.st_freq(s - 12) as u32 & char_mask[sym0] as u32);
                hi_cnt = hi_cnt
                    .wrapping_add(self.arena.st_freq(s - 6) as u32 & char_mask[sym1] as u32);
                num2 -= 1;
                if num2 == 0 {
                    break;
                }
            }

            let (slot, esc_freq) = self.make_esc_freq(num_masked);
            let freq_sum = esc_freq.wrapping_add(hi_cnt);
            let freq_sum2 = self.rc.correct_sum_range(freq_sum);
            let mut count = self.rc.threshold(freq_sum2);

            if count < hi_cnt {
                let start = count;
                let mut s = self.arena.ctx_stats(self.min_context);
                loop {
                    count = count.wrapping_sub(
                        self.arena.st_freq(s) as u32
                            & char_mask[self.arena.st_symbol(s) as usize] as u32,
                    );
                    s += 6;
                    if (count as i32) < 0 {
                        break;
                    }
                }
                s -= 6;
                let freq = self.arena.st_freq(s) as u32;
                self.rc
                    .decode(start.wrapping_sub(count).wrapping_sub(freq), freq);
                self.rc.normalize()?;
                self.see_mut(slot).update();
                self.found_state = s;
                let sym = self.arena.st_symbol(s);
                self.update2();
                return Ok(sym as i32);
            }
            if count >= freq_sum2 {
                return Ok(SYM_ERROR);
            }
            self.rc.decode(hi_cnt, freq_sum2.wrapping_sub(hi_cnt));
            let see = self.see_mut(slot);
            see.summ = (see.summ as u32).wrapping_add(freq_sum) as u16;

            let mut s = self.arena.ctx_stats(self.min_context);
            let end = s + (self.arena.ctx_num_stats(self.min_context) as u32 + 1) * 6;
            while s < end {
                char_mask[self.arena.st_symbol(s) as usize] = 0;
                s += 6;
            }
        }
    }
}
