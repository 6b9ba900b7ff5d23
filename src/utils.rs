//! Small helpers shared by the gateway and the REST surface.

use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;

/// Alphabet for invite codes. No ambiguous pairs (`0`/`O`, `1`/`l`).
const INVITE_ALPHABET: &[u8] = b"abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const INVITE_CODE_LEN: usize = 7;

/// Generate a random invite code. Uniqueness is the caller's problem
/// (retry on collision at issuance).
pub fn random_invite_code() -> String {
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LEN)
        .map(|_| INVITE_ALPHABET[rng.gen_range(0..INVITE_ALPHABET.len())] as char)
        .collect()
}

/// Generate a random 32 character hex session id.
pub fn random_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// The process-wide time source.
///
/// Wall-clock readings are anchored once at startup and advanced with the
/// monotonic clock, so the invite janitor and invite validation always agree
/// on "now" even if the system clock is stepped underneath us.
#[derive(Debug, Clone)]
pub struct Clock {
    base_wall: DateTime<Utc>,
    base_mono: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            base_wall: Utc::now(),
            base_mono: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = self.base_mono.elapsed();
        self.base_wall + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn now_millis(&self) -> u64 {
        self.now().timestamp_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a unix millisecond timestamp back to a `DateTime`.
pub fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis(millis as i64)
}
