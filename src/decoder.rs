use crate::{
    model::{ModelSnapshot, Ppmd8, RangeDecoder},
    Error, Result, RestoreMethod, MAX_MEM_SIZE, MAX_ORDER, MIN_MEM_SIZE, MIN_ORDER, SYM_END,
};

/// Worst case number of input bytes a single symbol can consume. Once the
/// buffered input falls below this, every symbol decode is preceded by a
/// checkpoint so an underflow mid-symbol can be rolled back and retried
/// when more input arrives.
const SNAPSHOT_MARGIN: usize = 512;

struct Checkpoint {
    model: ModelSnapshot,
    range: u32,
    code: u32,
    low: u32,
    input_pos: usize,
}

/// An incremental PPMd8 (PPMdI rev.1) decoder.
///
/// Feed compressed bytes with [`decode`](Self::decode); partial input is
/// buffered, so the stream can be supplied in arbitrary chunks. The model
/// parameters must match the ones the stream was encoded with.
pub struct Ppmd8Decoder {
    ppmd: Ppmd8<RangeDecoder>,
    endmark: bool,
    inited: bool,
    reached_end: bool,
    failed: bool,
    want_input: bool,
}

impl Ppmd8Decoder {
    /// Creates a new [`Ppmd8Decoder`]. The parameters mirror
    /// [`Ppmd8Encoder::new`](crate::Ppmd8Encoder::new).
    pub fn new(
        order: u32,
        mem_size: u32,
        restore_method: RestoreMethod,
        endmark: bool,
    ) -> Result<Self> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order)
            || !(MIN_MEM_SIZE..=MAX_MEM_SIZE).contains(&mem_size)
        {
            return Err(Error::InvalidParameter);
        }

        let ppmd = Ppmd8::new(RangeDecoder::new(), order, mem_size, restore_method)?;

        Ok(Self {
            ppmd,
            endmark,
            inited: false,
            reached_end: false,
            failed: false,
            want_input: true,
        })
    }

    /// Decompresses `data` plus any input buffered from earlier calls and
    /// returns the bytes that could be decoded. At most `max_length` bytes
    /// are produced when a limit is given; the rest of the input stays
    /// buffered for the next call.
    pub fn decode(&mut self, data: &[u8], max_length: Option<usize>) -> Result<Vec<u8>> {
        if self.failed {
            return Err(Error::SessionFinished);
        }
        self.ppmd.rc.feed(data);
        if self.reached_end {
            return Ok(Vec::new());
        }

        if !self.inited {
            if self.ppmd.rc.pending() < 4 {
                self.want_input = true;
                return Ok(Vec::new());
            }
            match self.ppmd.rc.init() {
                Ok(true) => self.inited = true,
                _ => {
                    self.failed = true;
                    return Err(Error::CorruptStream);
                }
            }
        }

        let mut out = Vec::new();
        self.want_input = false;
        loop {
            if max_length.is_some_and(|limit| out.len() >= limit) {
                break;
            }

            // Cheap while plenty of input is buffered: only take a
            // checkpoint once a mid-symbol underflow becomes possible.
            let checkpoint = (self.ppmd.rc.pending() < SNAPSHOT_MARGIN).then(|| Checkpoint {
                model: self.ppmd.snapshot(),
                range: self.ppmd.rc.range,
                code: self.ppmd.rc.code,
                low: self.ppmd.rc.low,
                input_pos: self.ppmd.rc.input_pos(),
            });

            match self.ppmd.decode_symbol() {
                Ok(sym) if sym >= 0 => out.push(sym as u8),
                Ok(SYM_END) if self.endmark => {
                    self.reached_end = true;
                    break;
                }
                Ok(_) => {
                    self.failed = true;
                    return Err(Error::CorruptStream);
                }
                Err(_) => match checkpoint {
                    Some(cp) => {
                        self.ppmd.rollback(&cp.model);
                        self.ppmd.rc.range = cp.range;
                        self.ppmd.rc.code = cp.code;
                        self.ppmd.rc.low = cp.low;
                        self.ppmd.rc.set_input_pos(cp.input_pos);
                        self.want_input = true;
                        break;
                    }
                    None => {
                        self.failed = true;
                        return Err(Error::CorruptStream);
                    }
                },
            }
        }

        self.ppmd.rc.compact();
        Ok(out)
    }

    /// Returns true once the end marker of the stream was decoded.
    pub fn eof(&self) -> bool {
        self.reached_end
    }

    /// Returns true if the buffered input is exhausted and more is needed
    /// to make progress.
    pub fn needs_input(&self) -> bool {
        !self.reached_end && self.want_input
    }
}

#[cfg(test)]
mod test {
    use super::Ppmd8Decoder;
    use crate::{Error, RestoreMethod};

    const SOURCE: &[u8] = b"This file is located in a folder.This file is located in the root.\n";

    const ENCODED: &[u8] = &[
        0x54, 0x16, 0x43, 0x6d, 0x5c, 0xd8, 0xd7, 0x3a, 0xb3, 0x58, 0x31, 0xac, 0x1d, 0x09,
        0x23, 0xfd, 0x11, 0xd5, 0x72, 0x62, 0x73, 0x13, 0xb6, 0xce, 0xb2, 0xe7, 0x6a, 0xb9,
        0xf6, 0xe8, 0x66, 0xf5, 0x08, 0xc3, 0x0a, 0x09, 0x36, 0x12, 0xeb, 0xda, 0xda, 0xba,
    ];

    const ENCODED_EM: &[u8] = &[
        0x54, 0x16, 0x43, 0x6d, 0x5c, 0xd8, 0xd7, 0x3a, 0xb3, 0x58, 0x31, 0xac, 0x1d, 0x09,
        0x23, 0xfd, 0x11, 0xd5, 0x72, 0x62, 0x73, 0x13, 0xb6, 0xce, 0xb2, 0xe7, 0x6a, 0xb9,
        0xf6, 0xe8, 0x66, 0xf5, 0x08, 0xc3, 0x0a, 0x09, 0x36, 0x12, 0x33, 0x42, 0x9a, 0xf7,
        0x94, 0xda,
    ];

    #[test]
    fn decode_known_stream_with_endmark() {
        let mut decoder = Ppmd8Decoder::new(6, 8 << 20, RestoreMethod::Restart, true).unwrap();
        let result = decoder.decode(ENCODED_EM, None).unwrap();
        assert_eq!(result, SOURCE);
        assert!(decoder.eof());
        assert!(!decoder.needs_input());
    }

    #[test]
    fn decode_known_stream_chunked() {
        let mut decoder = Ppmd8Decoder::new(6, 8 << 20, RestoreMethod::Restart, true).unwrap();
        let mut result = decoder.decode(&ENCODED_EM[..20], None).unwrap();
        assert!(!decoder.eof());
        result.extend(decoder.decode(&ENCODED_EM[20..], None).unwrap());
        assert_eq!(result, SOURCE);
        assert!(decoder.eof());
    }

    #[test]
    fn decode_known_stream_byte_by_byte() {
        let mut decoder = Ppmd8Decoder::new(6, 8 << 20, RestoreMethod::Restart, true).unwrap();
        let mut result = Vec::new();
        for &byte in ENCODED_EM {
            result.extend(decoder.decode(&[byte], None).unwrap());
        }
        assert_eq!(result, SOURCE);
        assert!(decoder.eof());
    }

    #[test]
    fn decode_with_length_limit() {
        let mut decoder = Ppmd8Decoder::new(6, 8 << 20, RestoreMethod::Restart, false).unwrap();
        let mut result = decoder.decode(ENCODED, Some(16)).unwrap();
        assert_eq!(result, &SOURCE[..16]);
        while result.len() < SOURCE.len() {
            let chunk = decoder.decode(&[], Some(SOURCE.len() - result.len())).unwrap();
            assert!(!chunk.is_empty());
            result.extend(chunk);
        }
        assert_eq!(result, SOURCE);
    }

    #[test]
    fn all_ones_header_is_corrupt() {
        let mut decoder = Ppmd8Decoder::new(6, 1 << 20, RestoreMethod::Restart, true).unwrap();
        assert!(matches!(
            decoder.decode(&[0xff, 0xff, 0xff, 0xff], None),
            Err(Error::CorruptStream)
        ));
        assert!(matches!(
            decoder.decode(&[0x00], None),
            Err(Error::SessionFinished)
        ));
    }

    #[test]
    fn short_header_reports_needs_input() {
        let mut decoder = Ppmd8Decoder::new(6, 1 << 20, RestoreMethod::Restart, true).unwrap();
        assert!(decoder.decode(&ENCODED_EM[..3], None).unwrap().is_empty());
        assert!(decoder.needs_input());
    }
}
