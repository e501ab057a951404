//! Job id generation.
//!
//! Ids look like `1z-k3j9x0qa`: a process-wide counter in base36, a dash,
//! and eight random characters. The counter makes ids unique for the life
//! of the process; the suffix keeps them unguessable across restarts. The
//! alphabet is lowercase alphanumerics only, so an id is safe as a file
//! name, a path segment and a query value on case-insensitive filesystems.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 8;

/// Hands out job ids. One per process.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", to_base36(n), random_suffix())
    }
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// True if `id` could have come from `IdGenerator`. Used to reject
/// path traversal through id-bearing routes.
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.bytes().all(|b| ALPHABET.contains(&b) || b == b'-')
        && !id.starts_with('-')
}
