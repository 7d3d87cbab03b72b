//! Byte- and word-level diff between two buffers, wrapping the `diff` crate's LCS computation
//! in the project's tagged span types.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareSource {
	Request,
	Response,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffSpanKind {
	Equal,
	Insert,
	Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffSpan {
	pub kind: DiffSpanKind,
	pub text: String,
}

/// Word-level diff (split on whitespace runs, preserved as part of the token) between `left` and
/// `right`. `Replace` is represented as an adjacent `Delete` followed by `Insert`, matching how
/// the `diff` crate itself reports substitutions.
pub fn compare(left: &str, right: &str) -> Vec<DiffSpan> {
	let left_words: Vec<&str> = split_words(left);
	let right_words: Vec<&str> = split_words(right);

	diff::slice(&left_words, &right_words)
		.into_iter()
		.map(|result| match result {
			diff::Result::Left(w) => DiffSpan { kind: DiffSpanKind::Delete, text: w.to_string() },
			diff::Result::Right(w) => DiffSpan { kind: DiffSpanKind::Insert, text: w.to_string() },
			diff::Result::Both(w, _) => DiffSpan { kind: DiffSpanKind::Equal, text: w.to_string() },
		})
		.collect()
}

fn split_words(text: &str) -> Vec<&str> {
	let mut words = Vec::new();
	let mut start = 0;
	let mut in_space = text.as_bytes().first().map(|b| b.is_ascii_whitespace()).unwrap_or(false);
	for (i, c) in text.char_indices() {
		let is_space = c.is_whitespace();
		if is_space != in_space {
			if i > start {
				words.push(&text[start..i]);
			}
			start = i;
			in_space = is_space;
		}
	}
	if start < text.len() {
		words.push(&text[start..]);
	}
	words
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identical_text_is_all_equal() {
		let spans = compare("the quick fox", "the quick fox");
		assert!(spans.iter().all(|s| s.kind == DiffSpanKind::Equal));
	}

	#[test]
	fn single_word_substitution_is_delete_then_insert() {
		let spans = compare("the quick fox", "the slow fox");
		let kinds: Vec<_> = spans.iter().map(|s| s.kind).collect();
		assert!(kinds.contains(&DiffSpanKind::Delete));
		assert!(kinds.contains(&DiffSpanKind::Insert));
		assert_eq!(kinds.iter().filter(|k| **k == DiffSpanKind::Equal).count(), 4);
	}

	#[test]
	fn split_words_preserves_whitespace_tokens() {
		let words = split_words("a  b");
		assert_eq!(words, vec!["a", "  ", "b"]);
	}
}
