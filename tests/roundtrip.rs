use ppmd8::{Ppmd8Decoder, Ppmd8Encoder, RestoreMethod};
use sha2::{Digest, Sha256};

/// Deterministic mixed payload: compressible prose interleaved with
/// pseudo-random noise, large enough to force model recovery at the
/// smaller arena sizes.
fn sample_data(len: usize) -> Vec<u8> {
    const PROSE: &[u8] = b"The quick brown fox jumps over the lazy dog. \
        Portez ce vieux whisky au juge blond qui fume. \
        Franz jagt im komplett verwahrlosten Taxi quer durch Bayern. ";

    let mut data = Vec::with_capacity(len);
    let mut seed = 0x9e37_79b9_7f4a_7c15_u64;
    while data.len() < len {
        let take = PROSE.len().min(len - data.len());
        data.extend_from_slice(&PROSE[..take]);
        for _ in 0..32 {
            if data.len() == len {
                break;
            }
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            data.push((seed >> 33) as u8);
        }
    }
    data
}

fn roundtrip(data: &[u8], order: u32, mem_size: u32, method: RestoreMethod) {
    let mut encoder = Ppmd8Encoder::new(order, mem_size, method, true).unwrap();
    let mut compressed = Vec::new();
    for chunk in data.chunks(64 * 1024) {
        compressed.extend(encoder.encode(chunk).unwrap());
    }
    compressed.extend(encoder.flush().unwrap());

    let mut decoder = Ppmd8Decoder::new(order, mem_size, method, true).unwrap();
    let mut decoded = Vec::new();
    for chunk in compressed.chunks(64 * 1024) {
        decoded.extend(decoder.decode(chunk, None).unwrap());
    }
    assert!(decoder.eof());
    assert_eq!(decoded.len(), data.len());
    assert_eq!(Sha256::digest(&decoded), Sha256::digest(data));
}

#[test]
fn roundtrip_large_restart() {
    let data = sample_data(1_200_000);
    roundtrip(&data, 6, 8 << 20, RestoreMethod::Restart);
}

#[test]
fn roundtrip_large_cut_off() {
    let data = sample_data(1_200_000);
    roundtrip(&data, 6, 8 << 20, RestoreMethod::CutOff);
}

#[test]
fn roundtrip_small_arena_restart() {
    let data = sample_data(1_200_000);
    roundtrip(&data, 6, 1 << 20, RestoreMethod::Restart);
}

#[test]
fn roundtrip_small_arena_cut_off() {
    let data = sample_data(1_200_000);
    roundtrip(&data, 6, 1 << 20, RestoreMethod::CutOff);
}

#[test]
fn roundtrip_minimum_arena() {
    let data = sample_data(64 * 1024);
    roundtrip(&data, 2, 2048, RestoreMethod::Restart);
    roundtrip(&data, 2, 2048, RestoreMethod::CutOff);
}

#[test]
fn roundtrip_order_bounds() {
    let data = sample_data(128 * 1024);
    roundtrip(&data, 2, 1 << 20, RestoreMethod::Restart);
    roundtrip(&data, 64, 1 << 20, RestoreMethod::Restart);
}

#[test]
fn roundtrip_empty_input() {
    let mut encoder = Ppmd8Encoder::new(6, 1 << 20, RestoreMethod::Restart, true).unwrap();
    let mut compressed = encoder.encode(&[]).unwrap();
    compressed.extend(encoder.flush().unwrap());

    let mut decoder = Ppmd8Decoder::new(6, 1 << 20, RestoreMethod::Restart, true).unwrap();
    let decoded = decoder.decode(&compressed, None).unwrap();
    assert!(decoded.is_empty());
    assert!(decoder.eof());
}

#[test]
fn roundtrip_without_endmark_by_length() {
    let data = sample_data(4096);

    let mut encoder = Ppmd8Encoder::new(6, 1 << 20, RestoreMethod::Restart, false).unwrap();
    let mut compressed = encoder.encode(&data).unwrap();
    compressed.extend(encoder.flush().unwrap());

    let mut decoder = Ppmd8Decoder::new(6, 1 << 20, RestoreMethod::Restart, false).unwrap();
    let decoded = decoder.decode(&compressed, Some(data.len())).unwrap();
    assert_eq!(decoded, data);
    assert!(!decoder.eof());
}

#[test]
fn truncated_stream_waits_for_input() {
    let data = sample_data(4096);

    let mut encoder = Ppmd8Encoder::new(6, 1 << 20, RestoreMethod::Restart, true).unwrap();
    let mut compressed = encoder.encode(&data).unwrap();
    compressed.extend(encoder.flush().unwrap());

    let mut decoder = Ppmd8Decoder::new(6, 1 << 20, RestoreMethod::Restart, true).unwrap();
    let half = compressed.len() / 2;
    let mut decoded = decoder.decode(&compressed[..half], None).unwrap();
    assert!(!decoder.eof());

    decoded.extend(decoder.decode(&compressed[half..], None).unwrap());
    assert_eq!(decoded, data);
    assert!(decoder.eof());
}
