//! Allocation receipts.
//!
//! A receipt is a fixed-length digest over `(address, size, timestamp, tag)`.
//! The hash function is pluggable; the only hard requirements are determinism
//! and a fixed 32-byte output. Neither hasher here is meant as a security
//! boundary.

use blake3::Hasher;
use serde::{Deserialize, Serialize};

/// Digest length in bytes.
pub const RECEIPT_LEN: usize = 32;

/// Hex rendering length (two chars per byte).
pub const RECEIPT_HEX_LEN: usize = RECEIPT_LEN * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt(pub [u8; RECEIPT_LEN]);

impl Receipt {
    /// All-zero receipt used for scrubbed metadata.
    pub const ZERO: Receipt = Receipt([0u8; RECEIPT_LEN]);

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(RECEIPT_HEX_LEN);
        for b in &self.0 {
            use std::fmt::Write as _;
            let _ = write!(&mut s, "{:02x}", b);
        }
        s
    }

    /// Fold the digest down to one word (used to derive boundary sentinels).
    pub fn fold_u64(&self) -> u64 {
        self.0
            .chunks_exact(8)
            .map(|c| {
                let mut w = [0u8; 8];
                w.copy_from_slice(c);
                u64::from_le_bytes(w)
            })
            .fold(0u64, |acc, w| acc ^ w)
    }
}

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The fields a receipt binds.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptInput<'a> {
    pub address: usize,
    pub size: usize,
    pub timestamp_ns: u64,
    pub tag: &'a str,
}

impl ReceiptInput<'_> {
    /// Canonical, unambiguous byte encoding (tag is length-prefixed).
    fn encode(&self) -> Vec<u8> {
        let tag = self.tag.as_bytes();
        let mut out = Vec::with_capacity(8 * 4 + tag.len());
        out.extend_from_slice(&(self.address as u64).to_le_bytes());
        out.extend_from_slice(&(self.size as u64).to_le_bytes());
        out.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        out.extend_from_slice(&(tag.len() as u64).to_le_bytes());
        out.extend_from_slice(tag);
        out
    }
}

/// Pluggable receipt function.
pub trait ReceiptHasher: Send + Sync {
    fn digest(&self, input: &ReceiptInput<'_>) -> Receipt;

    fn name(&self) -> &'static str;
}

/// Default hasher: BLAKE3 over the canonical encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Receipts;

impl ReceiptHasher for Blake3Receipts {
    fn digest(&self, input: &ReceiptInput<'_>) -> Receipt {
        let mut h = Hasher::new();
        h.update(&input.encode());
        Receipt(h.finalize().into())
    }

    fn name(&self) -> &'static str {
        "blake3"
    }
}

/// Cheap XOR/multiplicative fold. Deterministic and fixed-length, nothing more.
#[derive(Debug, Clone, Copy, Default)]
pub struct FoldReceipts;

impl ReceiptHasher for FoldReceipts {
    fn digest(&self, input: &ReceiptInput<'_>) -> Receipt {
        const PRIME: u64 = 0x0000_0100_0000_01B3;
        let mut lanes: [u64; 4] = [
            0xcbf2_9ce4_8422_2325,
            0x8422_2325_cbf2_9ce4,
            0x9e37_79b9_7f4a_7c15,
            0x7f4a_7c15_9e37_79b9,
        ];
        for (i, b) in input.encode().iter().enumerate() {
            let lane = &mut lanes[i % 4];
            *lane ^= u64::from(*b);
            *lane = lane.wrapping_mul(PRIME);
        }
        // Cross-mix so every input byte reaches every lane.
        for i in 0..4 {
            lanes[i] ^= lanes[(i + 1) % 4].rotate_left(17 + i as u32 * 8);
            lanes[i] = lanes[i].wrapping_mul(PRIME);
        }
        let mut out = [0u8; RECEIPT_LEN];
        for (i, lane) in lanes.iter().enumerate() {
            out[i * 8..(i + 1) * 8].copy_from_slice(&lane.to_le_bytes());
        }
        Receipt(out)
    }

    fn name(&self) -> &'static str {
        "fold"
    }
}

pub fn compute_receipt(hasher: &dyn ReceiptHasher, input: &ReceiptInput<'_>) -> Receipt {
    hasher.digest(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(tag: &str) -> ReceiptInput<'_> {
        ReceiptInput {
            address: 0x7f00_dead_b000,
            size: 4096,
            timestamp_ns: 1_700_000_000_000,
            tag,
        }
    }

    #[test]
    fn both_hashers_are_deterministic() {
        for hasher in [&Blake3Receipts as &dyn ReceiptHasher, &FoldReceipts] {
            let a = hasher.digest(&input("buf"));
            let b = hasher.digest(&input("buf"));
            assert_eq!(a, b, "{} not deterministic", hasher.name());
            assert_eq!(a.to_hex().len(), RECEIPT_HEX_LEN);
        }
    }

    #[test]
    fn every_field_changes_the_digest() {
        for hasher in [&Blake3Receipts as &dyn ReceiptHasher, &FoldReceipts] {
            let base = hasher.digest(&input("buf"));
            let mut i = input("buf");
            i.address += 16;
            assert_ne!(base, hasher.digest(&i));
            let mut i = input("buf");
            i.size += 1;
            assert_ne!(base, hasher.digest(&i));
            let mut i = input("buf");
            i.timestamp_ns += 1;
            assert_ne!(base, hasher.digest(&i));
            assert_ne!(base, hasher.digest(&input("buf2")));
        }
    }
}
