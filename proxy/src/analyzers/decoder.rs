//! URL/base64/base64url/HTML/hex/gzip encode-decode pair used by the Decoder panel.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingType {
	Url,
	Base64,
	Base64Url,
	Html,
	Hex,
	Gzip,
}

#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("invalid base64: {0}")]
	Base64(#[from] base64::DecodeError),
	#[error("invalid hex: {0}")]
	Hex(#[from] hex::FromHexError),
	#[error("invalid gzip stream: {0}")]
	Gzip(String),
	#[error("not valid utf-8: {0}")]
	Utf8(#[from] std::string::FromUtf8Error),
}

pub fn encode(input: &[u8], encoding: EncodingType) -> Result<Vec<u8>, DecodeError> {
	Ok(match encoding {
		EncodingType::Url => percent_encoding::utf8_percent_encode(&String::from_utf8_lossy(input), percent_encoding::NON_ALPHANUMERIC).to_string().into_bytes(),
		EncodingType::Base64 => STANDARD.encode(input).into_bytes(),
		EncodingType::Base64Url => URL_SAFE.encode(input).into_bytes(),
		EncodingType::Html => html_escape(input).into_bytes(),
		EncodingType::Hex => hex::encode(input).into_bytes(),
		EncodingType::Gzip => gzip_compress(input),
	})
}

pub fn decode(input: &[u8], encoding: EncodingType) -> Result<Vec<u8>, DecodeError> {
	Ok(match encoding {
		EncodingType::Url => {
			let text = String::from_utf8(input.to_vec())?;
			percent_encoding::percent_decode_str(&text).collect()
		}
		EncodingType::Base64 => STANDARD.decode(input)?,
		EncodingType::Base64Url => URL_SAFE.decode(input)?,
		EncodingType::Html => html_unescape(&String::from_utf8(input.to_vec())?).into_bytes(),
		EncodingType::Hex => hex::decode(input)?,
		EncodingType::Gzip => gzip_decompress(input)?,
	})
}

fn html_escape(input: &[u8]) -> String {
	String::from_utf8_lossy(input).chars().fold(String::new(), |mut out, c| {
		match c {
			'&' => out.push_str("&amp;"),
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			'"' => out.push_str("&quot;"),
			'\'' => out.push_str("&#39;"),
			_ => out.push(c),
		}
		out
	})
}

fn html_unescape(input: &str) -> String {
	input.replace("&amp;", "&").replace("&lt;", "<").replace("&gt;", ">").replace("&quot;", "\"").replace("&#39;", "'")
}

fn gzip_compress(input: &[u8]) -> Vec<u8> {
	use flate2::Compression;
	use flate2::write::GzEncoder;
	use std::io::Write;
	let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
	let _ = encoder.write_all(input);
	encoder.finish().unwrap_or_default()
}

fn gzip_decompress(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
	use flate2::read::GzDecoder;
	use std::io::Read;
	let mut decoder = GzDecoder::new(input);
	let mut out = Vec::new();
	decoder.read_to_end(&mut out).map_err(|e| DecodeError::Gzip(e.to_string()))?;
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test_case(EncodingType::Url; "url")]
	#[test_case(EncodingType::Base64; "base64")]
	#[test_case(EncodingType::Base64Url; "base64url")]
	#[test_case(EncodingType::Html; "html")]
	#[test_case(EncodingType::Hex; "hex")]
	#[test_case(EncodingType::Gzip; "gzip")]
	fn round_trips(encoding: EncodingType) {
		let input = b"hello, world! <tag attr=\"x&y\">";
		let encoded = encode(input, encoding).unwrap();
		let decoded = decode(&encoded, encoding).unwrap();
		assert_eq!(decoded, input);
	}

	#[test]
	fn decode_rejects_malformed_base64() {
		assert!(decode(b"not-valid-base64!!", EncodingType::Base64).is_err());
	}
}
