//! Carry-less range coder (Dmitry Subbotin's variant).
//!
//! Both directions keep 32 bit `low`/`range` registers and renormalize a
//! byte at a time. Carries are avoided by clipping `range` at the `BOT`
//! boundary instead of propagating them, which is why encoder and decoder
//! must renormalize at exactly the same points.

const TOP_VALUE: u32 = 1 << 24;
const BOT_VALUE: u32 = 1 << 15;

/// The original PPMd var.I coder can run into a divide by zero when the
/// frequency total exceeds `range`. Clamping the total the same way on both
/// sides keeps the streams compatible and the division safe.
#[inline(always)]
fn correct_sum_range(range: u32, sum: u32) -> u32 {
    if sum > range { range } else { sum }
}

pub(crate) struct RangeEncoder {
    pub(crate) range: u32,
    pub(crate) low: u32,
    pub(crate) out: Vec<u8>,
}

impl RangeEncoder {
    pub(crate) fn new() -> Self {
        Self {
            range: 0xFFFF_FFFF,
            low: 0,
            out: Vec::new(),
        }
    }

    #[inline(always)]
    pub(crate) fn correct_sum_range(&self, sum: u32) -> u32 {
        correct_sum_range(self.range, sum)
    }

    #[inline(always)]
    pub(crate) fn encode(&mut self, start: u32, size: u32, total: u32) {
        self.range /= total;
        self.low = self.low.wrapping_add(start * self.range);
        self.range *= size;
    }

    /// Binary contexts size the interval directly, without a division.
    #[inline(always)]
    pub(crate) fn encode_bit_0(&mut self, size0: u32) {
        self.range = size0;
    }

    #[inline(always)]
    pub(crate) fn encode_bit_1(&mut self, size0: u32) {
        self.low = self.low.wrapping_add(size0);
        self.range = (self.range & !(BOT_VALUE - 1)).wrapping_sub(size0);
    }

    pub(crate) fn normalize(&mut self) {
        while self.low ^ self.low.wrapping_add(self.range) < TOP_VALUE
            || self.range < BOT_VALUE && {
                self.range = 0u32.wrapping_sub(self.low) & (BOT_VALUE - 1);
                true
            }
        {
            self.out.push((self.low >> 24) as u8);
            self.range <<= 8;
            self.low <<= 8;
        }
    }

    pub(crate) fn flush(&mut self) {
        for _ in 0..4 {
            self.out.push((self.low >> 24) as u8);
            self.low <<= 8;
        }
    }
}

/// Raised when the input buffer runs dry in the middle of a symbol. The
/// caller rolls the model back to the last symbol boundary and waits for
/// more data.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Underflow;

pub(crate) struct RangeDecoder {
    pub(crate) range: u32,
    pub(crate) code: u32,
    pub(crate) low: u32,
    buf: Vec<u8>,
    pos: usize,
}

impl RangeDecoder {
    pub(crate) fn new() -> Self {
        Self {
            range: 0xFFFF_FFFF,
            code: 0,
            low: 0,
            buf: Vec::new(),
            pos: 0,
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes not yet consumed.
    pub(crate) fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn input_pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn set_input_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Drops the consumed prefix. Valid only at a symbol boundary, where no
    /// rollback can reach back before the current position.
    pub(crate) fn compact(&mut self) {
        if self.pos != 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    #[inline(always)]
    fn read_byte(&mut self) -> Result<u32, Underflow> {
        let byte = *self.buf.get(self.pos).ok_or(Underflow)?;
        self.pos += 1;
        Ok(byte as u32)
    }

    /// Fills the code register from the first four stream bytes.
    pub(crate) fn init(&mut self) -> Result<bool, Underflow> {
        for _ in 0..4 {
            self.code = self.code << 8 | self.read_byte()?;
        }
        Ok(self.code != 0xFFFF_FFFF)
    }

    #[inline(always)]
    pub(crate) fn correct_sum_range(&self, sum: u32) -> u32 {
        correct_sum_range(self.range, sum)
    }

    /// Narrows `range` to 1/total and returns the frequency threshold for
    /// the current code register.
    #[inline(always)]
    pub(crate) fn threshold(&mut self, total: u32) -> u32 {
        self.range /= total;
        self.code / self.range
    }

    #[inline(always)]
    pub(crate) fn decode(&mut self, start: u32, size: u32) {
        let start = start * self.range;
        self.low = self.low.wrapping_add(start);
        self.code = self.code.wrapping_sub(start);
        self.range *= size;
    }

    #[inline(always)]
    pub(crate) fn decode_bit_0(&mut self, size0: u32) {
        self.range = size0;
    }

    #[inline(always)]
    pub(crate) fn decode_bit_1(&mut self, size0: u32) {
        self.low = self.low.wrapping_add(size0);
        self.code = self.code.wrapping_sub(size0);
        self.range = (self.range & !(BOT_VALUE - 1)).wrapping_sub(size0);
    }

    pub(crate) fn normalize(&mut self) -> Result<(), Underflow> {
        while self.low ^ self.low.wrapping_add(self.range) < TOP_VALUE
            || self.range < BOT_VALUE && {
                self.range = 0u32.wrapping_sub(self.low) & (BOT_VALUE - 1);
                true
            }
        {
            self.code = self.code << 8 | self.read_byte()?;
            self.range <<= 8;
            self.low <<= 8;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_decode_intervals() {
        let mut enc = RangeEncoder::new();
        let freqs = [(0u32, 10u32, 50u32), (10, 5, 50), (40, 10, 50), (15, 25, 50)];
        for &(start, size, total) in &freqs {
            enc.encode(start, size, total);
            enc.normalize();
        }
        enc.flush();

        let mut dec = RangeDecoder::new();
        dec.feed(&enc.out);
        assert!(dec.init().unwrap());
        for &(start, size, total) in &freqs {
            let count = dec.threshold(total);
            assert!(count >= start && count < start + size);
            dec.decode(start, size);
            dec.normalize().unwrap();
        }
    }

    #[test]
    fn init_underflow_reported() {
        let mut dec = RangeDecoder::new();
        dec.feed(&[0x12, 0x34]);
        assert!(matches!(dec.init(), Err(Underflow)));
    }

    #[test]
    fn all_ones_init_rejected() {
        let mut dec = RangeDecoder::new();
        dec.feed(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(!dec.init().unwrap());
    }
}
