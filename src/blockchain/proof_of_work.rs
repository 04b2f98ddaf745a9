use log::debug;
use sha2::{Digest, Sha256};

/// Number of leading zero hex digits a valid proof hash must have
pub const DIFFICULTY: usize = 4;

/// How many candidates are tried between abort checks
const ABORT_CHECK_INTERVAL: u64 = 10_000;

/// Validates the proof: does sha256("{last_proof}{proof}") start with
/// `DIFFICULTY` zeroes?
pub fn valid_proof(last_proof: u64, proof: u64) -> bool {
    let guess = format!("{}{}", last_proof, proof);
    let guess_hash = format!("{:x}", Sha256::digest(guess.as_bytes()));
    guess_hash.bytes().take(DIFFICULTY).all(|digit| digit == b'0')
}

/// Finds the smallest proof satisfying [`valid_proof`] for `last_proof`
#[cfg(test)]
pub fn proof_of_work(last_proof: u64) -> u64 {
    let mut proof = 0;
    while !valid_proof(last_proof, proof) {
        proof += 1;
    }
    proof
}

/// Finds the smallest proof satisfying [`valid_proof`], giving up when
/// `should_abort` returns true. The predicate is polled every few thousand
/// candidates.
pub fn proof_of_work_with_abort<F>(last_proof: u64, should_abort: F) -> Option<u64>
where
    F: Fn() -> bool,
{
    let mut proof = 0;
    loop {
        if proof % ABORT_CHECK_INTERVAL == 0 && should_abort() {
            debug!("Proof search over {} aborted at candidate {}", last_proof, proof);
            return None;
        }

        if valid_proof(last_proof, proof) {
            return Some(proof);
        }

        proof += 1;
    }
}
