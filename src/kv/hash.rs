//! Rolling block hashes for prefix matching.
//!
//! Each full block of tokens gets one hash that folds in the previous
//! block's hash, so a block hash identifies the entire token prefix up to
//! and including that block. The hash is a fixed-constant FNV-1a chain:
//! run-to-run stability is part of the determinism contract, so nothing
//! here depends on hasher seeding.

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(state: u64, bytes: &[u8]) -> u64 {
    let mut hash = state;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hash one block of tokens, chained onto the previous block's hash.
pub fn chain_block_hash(prev: u64, block: &[u32]) -> u64 {
    let mut hash = fnv1a(FNV_OFFSET, &prev.to_le_bytes());
    for &token in block {
        hash = fnv1a(hash, &token.to_le_bytes());
    }
    hash
}

/// Hashes for every *full* block in the token sequence, in order. A
/// trailing partial block gets no hash; only complete blocks are
/// addressable in the prefix index.
pub fn block_hashes(tokens: &[u32], block_size: usize) -> Vec<u64> {
    let full_blocks = tokens.len() / block_size;
    let mut hashes = Vec::with_capacity(full_blocks);
    let mut prev = 0u64;
    for i in 0..full_blocks {
        let block = &tokens[i * block_size..(i + 1) * block_size];
        let hash = chain_block_hash(prev, block);
        hashes.push(hash);
        prev = hash;
    }
    hashes
}
