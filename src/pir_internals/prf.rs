use crate::pir_internals::params::SET_KEY_BYTE_LEN;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake128,
};

/// Pseudorandom key of one hint row. The offsets the row selects, one per
/// chunk, are derived from this key alone, so a row costs 16 bytes of client
/// storage no matter how many chunks the database has.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetKey([u8; SET_KEY_BYTE_LEN]);

impl SetKey {
    pub fn random<R: RngCore>(rng: &mut R) -> SetKey {
        let mut key = [0u8; SET_KEY_BYTE_LEN];
        rng.fill_bytes(&mut key);
        SetKey(key)
    }

    /// Chunk-local offset this key selects in `chunk`, uniform over
    /// `[0, chunk_entry_count)`.
    pub fn offset(&self, chunk: u64, chunk_entry_count: u64) -> u64 {
        let mut hasher = Shake128::default();
        hasher.update(&self.0);
        hasher.update(&chunk.to_le_bytes());

        let mut word = [0u8; 8];
        hasher.finalize_xof().read(&mut word);

        u64::from_le_bytes(word) % chunk_entry_count
    }
}

/// Hashes a token together with a choice index to a u64: the first 8 bytes,
/// big-endian, of SHA-256 over the token bytes followed by the big-endian
/// 32-bit choice. The same function places tokens into bins at indexing time
/// and addresses bins at query time.
pub fn hash_token_choice(token: &str, choice: u32) -> u64 {
    let mut hasher = Sha256::new();
    Digest::update(&mut hasher, token.as_bytes());
    Digest::update(&mut hasher, choice.to_be_bytes());

    let digest = hasher.finalize();

    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(word)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn set_key_offsets_are_deterministic_and_in_range() {
        let mut rng = ChaCha8Rng::from_seed([7u8; 32]);
        let key = SetKey::random(&mut rng);

        for chunk in 0..64u64 {
            let a = key.offset(chunk, 37);
            let b = key.offset(chunk, 37);
            assert_eq!(a, b);
            assert!(a < 37);
        }
    }

    #[test]
    fn distinct_keys_disagree_somewhere() {
        let mut rng = ChaCha8Rng::from_seed([9u8; 32]);
        let key_a = SetKey::random(&mut rng);
        let key_b = SetKey::random(&mut rng);

        let differs = (0..128u64).any(|c| key_a.offset(c, 1 << 20) != key_b.offset(c, 1 << 20));
        assert!(differs);
    }

    #[test]
    fn token_choice_hash_matches_known_vector() {
        assert_eq!(hash_token_choice("retrieval", 0), 0xe0f992b6b91d478f);
        assert_eq!(hash_token_choice("retrieval", 0) % 5000, 2999);
    }

    #[test]
    fn token_choice_hash_separates_choices_and_tokens() {
        assert_ne!(hash_token_choice("alpha", 0), hash_token_choice("alpha", 1));
        assert_ne!(hash_token_choice("alpha", 0), hash_token_choice("beta", 0));
    }
}
