//! Token randomness analysis: per-bit-position Shannon entropy over a sample of tokens, reduced
//! to a coarse quality verdict.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceQuality {
	Excellent,
	Good,
	Fair,
	Poor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceReport {
	pub sample_size: usize,
	pub bit_length: usize,
	/// Shannon entropy in bits, one entry per bit position across the sample.
	pub bit_entropy: Vec<f64>,
	pub mean_entropy: f64,
	pub quality: SequenceQuality,
}

/// Computes per-bit-position entropy over `tokens`, truncating every token to the length of the
/// shortest one so bit positions line up. Returns `None` if fewer than two tokens are given or
/// any token is empty.
pub fn analyze_sequence(tokens: &[Vec<u8>]) -> Option<SequenceReport> {
	if tokens.len() < 2 {
		return None;
	}
	let min_bytes = tokens.iter().map(Vec::len).min()?;
	if min_bytes == 0 {
		return None;
	}
	let bit_length = min_bytes * 8;

	let mut bit_entropy = Vec::with_capacity(bit_length);
	for bit_index in 0..bit_length {
		let byte_index = bit_index / 8;
		let mask = 1u8 << (7 - (bit_index % 8));
		let ones = tokens.iter().filter(|t| t[byte_index] & mask != 0).count();
		bit_entropy.push(binary_entropy(ones, tokens.len()));
	}

	let mean_entropy = bit_entropy.iter().sum::<f64>() / bit_entropy.len() as f64;
	let quality = match mean_entropy {
		e if e >= 0.97 => SequenceQuality::Excellent,
		e if e >= 0.90 => SequenceQuality::Good,
		e if e >= 0.75 => SequenceQuality::Fair,
		_ => SequenceQuality::Poor,
	};

	Some(SequenceReport { sample_size: tokens.len(), bit_length, bit_entropy, mean_entropy, quality })
}

/// Shannon entropy, normalized to [0, 1], of a Bernoulli variable observed `ones` times out of
/// `total` trials.
fn binary_entropy(ones: usize, total: usize) -> f64 {
	if total == 0 {
		return 0.0;
	}
	let p = ones as f64 / total as f64;
	if p <= 0.0 || p >= 1.0 {
		return 0.0;
	}
	-(p * p.log2() + (1.0 - p) * (1.0 - p).log2())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn constant_tokens_have_zero_entropy() {
		let tokens = vec![vec![0u8; 4]; 10];
		let report = analyze_sequence(&tokens).unwrap();
		assert_eq!(report.mean_entropy, 0.0);
		assert_eq!(report.quality, SequenceQuality::Poor);
	}

	#[test]
	fn alternating_bit_is_maximally_random() {
		let tokens: Vec<Vec<u8>> = (0u8..20).map(|i| vec![if i % 2 == 0 { 0x00 } else { 0xFF }]).collect();
		let report = analyze_sequence(&tokens).unwrap();
		assert!(report.mean_entropy > 0.99);
		assert_eq!(report.quality, SequenceQuality::Excellent);
	}

	#[test]
	fn fewer_than_two_tokens_returns_none() {
		assert!(analyze_sequence(&[vec![1, 2, 3]]).is_none());
	}
}
