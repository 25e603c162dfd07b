//! # Stream Cipher
//!
//! AES-128 in CFB-128 mode with byte-granular state, driving the
//! optional at-rest encryption of the log region.
//!
//! ## Why CFB
//!
//! The log is append-only: each write encrypts only the freshly
//! serialized entry, continuing the keystream where the previous write
//! stopped. CFB makes that cheap because the cipher state after
//! processing N bytes is a function of the ciphertext alone — after
//! *decrypting* the existing log on load, the crypter is positioned to
//! *encrypt* the next append with no extra bookkeeping. The feedback
//! register plus an intra-block offset is the entire state.
//!
//! ## Keys and IVs
//!
//! Keys are truncated or zero-padded to 16 bytes. A freshly constructed
//! crypter seeds its feedback register from the padded key; stores at
//! version `V3_RANDOM_IV` and above overwrite it with the random IV
//! recorded in the sidecar before any bytes flow.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;

/// AES-128 key and block length in bytes.
pub const KEY_LEN: usize = 16;

/// Stateful AES-CFB byte stream.
///
/// `encrypt_in_place` and `decrypt` share the feedback register, so
/// interleaving them continues a single ciphertext stream — exactly the
/// load-then-append access pattern of the store.
pub struct StreamCrypter {
    cipher: Aes128,
    key: [u8; KEY_LEN],
    key_len: usize,
    vector: [u8; KEY_LEN],
    keystream: [u8; KEY_LEN],
    offset: usize,
}

impl StreamCrypter {
    /// Build a crypter from a caller-supplied key, truncated or
    /// zero-padded to [`KEY_LEN`] bytes.
    pub fn new(key: &[u8]) -> Self {
        let mut padded = [0u8; KEY_LEN];
        let key_len = key.len().min(KEY_LEN);
        padded[..key_len].copy_from_slice(&key[..key_len]);

        StreamCrypter {
            cipher: Aes128::new(&GenericArray::from(padded)),
            key: padded,
            key_len,
            vector: padded,
            keystream: [0u8; KEY_LEN],
            offset: 0,
        }
    }

    /// The key as originally supplied (without padding).
    pub fn key(&self) -> &[u8] {
        &self.key[..self.key_len]
    }

    /// Rewind the stream to a fresh IV.
    pub fn reset(&mut self, iv: &[u8; KEY_LEN]) {
        self.vector = *iv;
        self.offset = 0;
    }

    /// Rewind the stream to the key-derived IV used before a random IV
    /// has ever been recorded.
    pub fn reset_to_key_iv(&mut self) {
        let key = self.key;
        self.reset(&key);
    }

    /// Fill `iv` with random bytes.
    pub fn fill_random_iv(iv: &mut [u8; KEY_LEN]) {
        rand::thread_rng().fill_bytes(iv);
    }

    /// Encrypt `data` in place, advancing the stream by `data.len()`.
    pub fn encrypt_in_place(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.offset == 0 {
                self.refill_keystream();
            }
            let cipher_byte = *byte ^ self.keystream[self.offset];
            self.vector[self.offset] = cipher_byte;
            *byte = cipher_byte;
            self.offset = (self.offset + 1) % KEY_LEN;
        }
    }

    /// Decrypt `data` into a fresh buffer, advancing the stream by
    /// `data.len()`. The input (the on-disk bytes) is left untouched.
    pub fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for &cipher_byte in data {
            if self.offset == 0 {
                self.refill_keystream();
            }
            out.push(cipher_byte ^ self.keystream[self.offset]);
            self.vector[self.offset] = cipher_byte;
            self.offset = (self.offset + 1) % KEY_LEN;
        }
        out
    }

    fn refill_keystream(&mut self) {
        let mut block = GenericArray::from(self.vector);
        self.cipher.encrypt_block(&mut block);
        self.keystream.copy_from_slice(&block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_in_one_call() {
        let mut enc = StreamCrypter::new(b"secret");
        let mut dec = StreamCrypter::new(b"secret");

        let mut data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let plain = data.clone();
        enc.encrypt_in_place(&mut data);
        assert_ne!(data, plain);
        assert_eq!(dec.decrypt(&data), plain);
    }

    #[test]
    fn chunked_stream_matches_single_shot() {
        let mut one_shot = StreamCrypter::new(b"k");
        let mut chunked = StreamCrypter::new(b"k");

        let plain: Vec<u8> = (0u8..=255).collect();
        let mut whole = plain.clone();
        one_shot.encrypt_in_place(&mut whole);

        let mut pieces = plain.clone();
        // deliberately misaligned with the 16-byte block size
        let (head, tail) = pieces.split_at_mut(7);
        chunked.encrypt_in_place(head);
        let (mid, rest) = tail.split_at_mut(21);
        chunked.encrypt_in_place(mid);
        chunked.encrypt_in_place(rest);

        assert_eq!(whole, pieces);
    }

    #[test]
    fn decrypt_positions_stream_for_append() {
        // Encrypt a log in two appends, then decrypt the first part with
        // a fresh crypter and encrypt a second part: the ciphertexts must
        // agree, which is what lets the store append after a cold load.
        let mut writer = StreamCrypter::new(b"key");
        let mut part1 = b"first entry".to_vec();
        let mut part2 = b"second entry".to_vec();
        writer.encrypt_in_place(&mut part1);
        writer.encrypt_in_place(&mut part2);

        let mut loader = StreamCrypter::new(b"key");
        assert_eq!(loader.decrypt(&part1), b"first entry");
        let mut appended = b"second entry".to_vec();
        loader.encrypt_in_place(&mut appended);
        assert_eq!(appended, part2);
    }

    #[test]
    fn reset_restarts_the_stream() {
        let mut crypter = StreamCrypter::new(b"key");
        let iv = [7u8; KEY_LEN];

        crypter.reset(&iv);
        let mut first = b"payload".to_vec();
        crypter.encrypt_in_place(&mut first);

        crypter.reset(&iv);
        let mut second = b"payload".to_vec();
        crypter.encrypt_in_place(&mut second);

        assert_eq!(first, second);
    }

    #[test]
    fn wrong_key_garbles() {
        let mut enc = StreamCrypter::new(b"right");
        let mut data = b"sensitive".to_vec();
        enc.encrypt_in_place(&mut data);

        let mut dec = StreamCrypter::new(b"wrong");
        assert_ne!(dec.decrypt(&data), b"sensitive");
    }

    #[test]
    fn key_is_reported_unpadded() {
        let crypter = StreamCrypter::new(b"abc");
        assert_eq!(crypter.key(), b"abc");

        let long = StreamCrypter::new(b"0123456789abcdefXYZ");
        assert_eq!(long.key(), b"0123456789abcdef");
    }
}
