//! Cipher-suite properties: symmetry under arbitrary advance patterns,
//! skip equivalence, and multi-key detection.

use std::sync::Arc;

use crossplay_gateway::crypto::{
    Cipher, ConsoleCipher, LegacyCipher, MultiKeyImitator, OnlineCipher, StreamKeyFile, SEED_SIZE,
};
use crossplay_gateway::crypto::detect::{shared_detector, SharedDetectorCipher};

fn chunk_pattern(block: usize, total: usize, weights: &[usize]) -> Vec<usize> {
    // Deterministic block-aligned split of `total` bytes.
    let mut chunks = Vec::new();
    let mut remaining = total;
    let mut i = 0;
    while remaining > 0 {
        let want = (weights[i % weights.len()] * block).min(remaining);
        chunks.push(want.max(block).min(remaining));
        remaining -= chunks.last().copied().unwrap();
        i += 1;
    }
    chunks
}

fn assert_symmetric(make: impl Fn() -> Box<dyn Cipher>, block: usize) {
    let total = block * 96;
    let plain: Vec<u8> = (0..total).map(|i| (i * 31 % 251) as u8).collect();

    let mut enc = make();
    let mut wire = plain.clone();
    // Encrypt in one sweep...
    enc.encrypt(&mut wire, true).unwrap();
    assert_ne!(wire, plain);

    // ...decrypt in a ragged block-aligned pattern.
    let mut dec = make();
    let mut pos = 0;
    for chunk in chunk_pattern(block, total, &[1, 3, 2, 7, 5]) {
        dec.decrypt(&mut wire[pos..pos + chunk], true).unwrap();
        pos += chunk;
    }
    assert_eq!(wire, plain);
}

#[test]
fn all_three_variants_are_symmetric_under_ragged_advances() {
    assert_symmetric(|| Box::new(LegacyCipher::new(0x1234_5678)), 4);
    assert_symmetric(|| Box::new(ConsoleCipher::new(0x8765_4321)), 4);
    let key = StreamKeyFile::test_key(42);
    let seed = [0x11u8; SEED_SIZE];
    assert_symmetric(move || Box::new(OnlineCipher::new(&key, &seed)), 8);
}

#[test]
fn skip_is_equivalent_to_discarded_decryption() {
    let mut a = LegacyCipher::new(77);
    let mut b = LegacyCipher::new(77);
    let mut scratch = vec![0u8; 100];
    a.decrypt(&mut scratch, true).unwrap();
    b.skip(100).unwrap();
    let mut buf_a = [5u8; 16];
    let mut buf_b = [5u8; 16];
    a.encrypt(&mut buf_a, true).unwrap();
    b.encrypt(&mut buf_b, true).unwrap();
    assert_eq!(buf_a, buf_b);
}

#[test]
fn non_advancing_calls_do_not_move_the_stream() {
    let mut cipher = ConsoleCipher::new(3);
    let mut reference = ConsoleCipher::new(3);

    let mut peeked = [0xAAu8; 8];
    for _ in 0..5 {
        let mut copy = peeked;
        cipher.decrypt(&mut copy, false).unwrap();
    }
    cipher.encrypt(&mut peeked, true).unwrap();
    let mut expected = [0xAAu8; 8];
    reference.encrypt(&mut expected, true).unwrap();
    assert_eq!(peeked, expected);
}

#[test]
fn detector_and_imitator_form_a_working_v4_pair() {
    let keys: Vec<_> = (0..6).map(|i| Arc::new(StreamKeyFile::test_key(i))).collect();
    let client_key_file = keys[4].clone();
    let client_seed = [3u8; SEED_SIZE];
    let server_seed = [4u8; SEED_SIZE];

    // The client encrypts its first frame with its own key file.
    let mut first_frame = vec![0u8; 16];
    first_frame[0] = 0x10;
    first_frame[2] = 0x93;
    let mut client_out = OnlineCipher::new(&client_key_file, &client_seed);
    client_out.encrypt(&mut first_frame, true).unwrap();

    let detector = shared_detector(keys, client_seed);
    let mut crypt_in = SharedDetectorCipher(detector.clone());
    let mut crypt_out = MultiKeyImitator::new(detector, server_seed);

    crypt_in.decrypt(&mut first_frame, true).unwrap();
    assert_eq!(first_frame[2], 0x93);

    // Server reply decrypts on the client side with the same key file.
    let mut reply = b"welcome!".to_vec();
    crypt_out.encrypt(&mut reply, true).unwrap();
    let mut client_in = OnlineCipher::new(&client_key_file, &server_seed);
    client_in.decrypt(&mut reply, true).unwrap();
    assert_eq!(reply, b"welcome!");
}
