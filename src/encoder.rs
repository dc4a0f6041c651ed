use std::mem;

use crate::{
    model::{Ppmd8, RangeEncoder},
    Error, Result, RestoreMethod, MAX_MEM_SIZE, MAX_ORDER, MIN_MEM_SIZE, MIN_ORDER, SYM_END,
};

/// An incremental PPMd8 (PPMdI rev.1) encoder.
///
/// Feed input with [`encode`](Self::encode) and terminate the stream with
/// [`flush`](Self::flush). Both return the compressed bytes that became
/// available; their concatenation is the compressed stream.
pub struct Ppmd8Encoder {
    ppmd: Ppmd8<RangeEncoder>,
    endmark: bool,
    finished: bool,
}

impl Ppmd8Encoder {
    /// Creates a new [`Ppmd8Encoder`].
    ///
    /// `order` is the maximum model order (2..=64), `mem_size` the model
    /// arena size in bytes. When `endmark` is set, [`flush`](Self::flush)
    /// codes an end marker so the decoder can detect the end of the stream
    /// without knowing the uncompressed length.
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

        let ppmd = Ppmd8::new(RangeEncoder::new(), order, mem_size, restore_method)?;

        Ok(Self {
            ppmd,
            endmark,
            finished: false,
        })
    }

    /// Compresses `data` and returns the output bytes produced so far. The
    /// stream is incomplete until [`flush`](Self::flush) was called.
    pub fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.finished {
            return Err(Error::SessionFinished);
        }
        for &byte in data {
            self.ppmd.encode_symbol(byte as i32);
        }
        Ok(mem::take(&mut self.ppmd.rc.out))
    }

    /// Terminates the stream and returns the remaining output bytes. The
    /// encoder cannot be used afterwards.
    pub fn flush(&mut self) -> Result<Vec<u8>> {
        if self.finished {
            return Err(Error::SessionFinished);
        }
        self.finished = true;
        if self.endmark {
            self.ppmd.encode_symbol(SYM_END);
        }
        self.ppmd.rc.flush();
        Ok(mem::take(&mut self.ppmd.rc.out))
    }
}

#[cfg(test)]
mod test {
    use super::Ppmd8Encoder;
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
    fn encode_known_stream() {
        let mut encoder =
            Ppmd8Encoder::new(6, 8 << 20, RestoreMethod::Restart, false).unwrap();
        let mut result = encoder.encode(SOURCE).unwrap();
        result.extend(encoder.flush().unwrap());
        assert_eq!(result, ENCODED);
    }

    #[test]
    fn encode_known_stream_chunked() {
        let mut encoder =
            Ppmd8Encoder::new(6, 8 << 20, RestoreMethod::Restart, false).unwrap();
        let mut result = encoder.encode(&SOURCE[..33]).unwrap();
        result.extend(encoder.encode(&SOURCE[33..]).unwrap());
        result.extend(encoder.flush().unwrap());
        assert_eq!(result, ENCODED);
    }

    #[test]
    fn encode_known_stream_with_endmark() {
        let mut encoder = Ppmd8Encoder::new(6, 8 << 20, RestoreMethod::Restart, true).unwrap();
        let mut result = encoder.encode(&SOURCE[..33]).unwrap();
        result.extend(encoder.encode(&SOURCE[33..]).unwrap());
        result.extend(encoder.flush().unwrap());
        assert_eq!(result, ENCODED_EM);
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(matches!(
            Ppmd8Encoder::new(1, 8 << 20, RestoreMethod::Restart, false),
            Err(Error::InvalidParameter)
        ));
        assert!(matches!(
            Ppmd8Encoder::new(65, 8 << 20, RestoreMethod::Restart, false),
            Err(Error::InvalidParameter)
        ));
        assert!(matches!(
            Ppmd8Encoder::new(6, 2047, RestoreMethod::Restart, false),
            Err(Error::InvalidParameter)
        ));
    }

    #[test]
    fn use_after_flush_fails() {
        let mut encoder = Ppmd8Encoder::new(6, 1 << 20, RestoreMethod::Restart, false).unwrap();
        encoder.encode(b"data").unwrap();
        encoder.flush().unwrap();
        assert!(matches!(encoder.encode(b"more"), Err(Error::SessionFinished)));
        assert!(matches!(encoder.flush(), Err(Error::SessionFinished)));
    }
}
