//! Page to Partition Mapping
//!
//! Pages of a channel are numbered sequentially, so a naive `page % partitions`
//! mapping would walk every channel across the same partitions in lock step.
//! Instead each channel multiplies the page id by its own large prime before
//! taking the remainder:
//!
//! ```text
//! partition(channel, page) = (page * prime(channel)) mod partition_count
//! ```
//!
//! `prime(channel)` is the `channel`-th prime strictly greater than
//! [`PRIME_SEED`]. Distinct primes give each channel a different stride through
//! the partitions, so consecutive pages spread out and two channels rarely land
//! the same page on the same partition.
//!
//! ## Properties
//! - Pure: depends only on `(channel, page, partition_count)`
//! - Periodic: `partition(c, p) == partition(c, p + partition_count)`
//! - Never overflows: computed in 128-bit arithmetic with a Euclidean remainder

use parking_lot::RwLock;
use twox_hash::XxHash32;

/// Lower bound for the per-channel primes
pub const PRIME_SEED: i64 = 65_536;

/// Primes found so far, index `n` holds the `n`-th prime above the seed
static PRIMES: RwLock<Vec<i64>> = parking_lot::const_rwlock(Vec::new());

/// The prime multiplier used by `channel`
pub fn channel_prime(channel: u32) -> i64 {
    let index = channel as usize;
    if let Some(prime) = PRIMES.read().get(index) {
        return *prime;
    }

    let mut primes = PRIMES.write();
    while primes.len() <= index {
        let mut candidate = primes.last().copied().unwrap_or(PRIME_SEED) + 1;
        while !is_prime(candidate) {
            candidate += 1;
        }
        primes.push(candidate);
    }
    primes[index]
}

/// Partition owning `page` of `channel`
pub fn partition_for_page(channel: u32, page: i64, partition_count: u32) -> u32 {
    debug_assert!(partition_count > 0, "partition count must be positive");
    let product = page as i128 * channel_prime(channel) as i128;
    product.rem_euclid(partition_count.max(1) as i128) as u32
}

/// The first page id of a new topic
///
/// Derived from the topic name so that topics sharing a service start their
/// page chains on different partitions.
pub fn base_page(topic: &str, partition_count: u32) -> i64 {
    let hash = XxHash32::oneshot(0, topic.as_bytes());
    (hash % partition_count.max(1)) as i64
}

fn is_prime(n: i64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut divisor = 3;
    while divisor * divisor <= n {
        if n % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}
