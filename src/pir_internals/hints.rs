use crate::pir_internals::prf::SetKey;

/// One row of the primary hint table: a set key selecting one offset per
/// chunk, and the XOR of the entries the set addresses. A refreshed row keeps
/// covering the offset it was consumed for through `programmed`, which
/// overrides the key-derived offset in that single chunk.
#[derive(Clone, Debug)]
pub struct PrimaryHint {
    pub key: SetKey,
    pub acc: Vec<u64>,
    pub programmed: Option<(u64, u64)>,
}

impl PrimaryHint {
    pub fn fresh(key: SetKey, entry_words: usize) -> PrimaryHint {
        PrimaryHint {
            key,
            acc: vec![0u64; entry_words],
            programmed: None,
        }
    }

    /// Offset this row selects in `chunk`, honouring a programmed override.
    #[inline]
    pub fn offset_at(&self, chunk: u64, chunk_entry_count: u64) -> u64 {
        match self.programmed {
            Some((c, offset)) if c == chunk => offset,
            _ => self.key.offset(chunk, chunk_entry_count),
        }
    }
}

/// Spare hint assigned to one chunk. Its accumulator spans every chunk except
/// its own, so promoting it to a primary row after a query only needs the
/// queried entry XORed in.
#[derive(Clone, Debug)]
pub struct BackupHint {
    pub key: SetKey,
    pub acc: Vec<u64>,
}

impl BackupHint {
    pub fn fresh(key: SetKey, entry_words: usize) -> BackupHint {
        BackupHint {
            key,
            acc: vec![0u64; entry_words],
        }
    }
}

/// A pre-sampled uniform offset in one chunk together with that entry's
/// value. A real query sends the offset in the target-chunk slot and uses the
/// stored value to cancel it out of the server's response.
#[derive(Clone, Debug)]
pub struct Replacement {
    pub offset: u64,
    pub value: Vec<u64>,
}

#[inline]
pub fn xor_words(acc: &mut [u64], words: &[u64]) {
    debug_assert_eq!(acc.len(), words.len());
    for (a, w) in acc.iter_mut().zip(words.iter()) {
        *a ^= w;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn programmed_offset_shadows_only_its_chunk() {
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        let mut hint = PrimaryHint::fresh(SetKey::random(&mut rng), 1);
        hint.programmed = Some((2, 5));

        assert_eq!(hint.offset_at(2, 100), 5);
        assert_eq!(hint.offset_at(3, 100), hint.key.offset(3, 100));
    }

    #[test]
    fn xor_words_is_an_involution() {
        let mut acc = vec![0u64; 4];
        let words = vec![0xdead, 0xbeef, 0, u64::MAX];

        xor_words(&mut acc, &words);
        assert_eq!(acc, words);

        xor_words(&mut acc, &words);
        assert_eq!(acc, vec![0u64; 4]);
    }
}
