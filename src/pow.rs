use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::constants::{RUNTIME_IDENTITY_FALLBACK, RUNTIME_IDENTITY_MAX_LEN};
use crate::error::{E2eError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowSolution {
    pub solution: String,
    pub attempts: u64,
}

pub fn compute_pow_hash(nonce: &str, solution: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(b":");
    hasher.update(solution.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn meets_difficulty(hash_hex: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash_hex.len() >= difficulty && hash_hex.bytes().take(difficulty).all(|b| b == b'0')
}

/// Searches `0, 1, 2, ...` for the first candidate whose `nonce:candidate`
/// digest starts with `difficulty` hex zeros.
pub fn solve_pow(nonce: &str, difficulty: u32, max_iters: u64) -> Result<PowSolution> {
    for i in 0..max_iters {
        let candidate = i.to_string();
        if meets_difficulty(&compute_pow_hash(nonce, &candidate), difficulty) {
            return Ok(PowSolution {
                solution: candidate,
                attempts: i + 1,
            });
        }
    }
    Err(E2eError::PowExhausted {
        difficulty,
        max_iters,
    })
}

/// Runs [`solve_pow`] on the blocking pool so the async workers stay free.
pub fn spawn_solve_pow(
    nonce: String,
    difficulty: u32,
    max_iters: u64,
) -> JoinHandle<Result<PowSolution>> {
    tokio::task::spawn_blocking(move || solve_pow(&nonce, difficulty, max_iters))
}

pub fn runtime_identity_from_label(label: &str) -> String {
    let normalized: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(RUNTIME_IDENTITY_MAX_LEN)
        .collect();
    if normalized.is_empty() {
        return RUNTIME_IDENTITY_FALLBACK.to_string();
    }
    normalized
}
