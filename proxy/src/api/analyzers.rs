//! `/decoder`, `/sequencer`, `/comparer`: stateless transforms over attacker-supplied bytes/text.

use axum::Json;
use axum::routing::post;
use axum::Router;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::ApiContext;
use crate::analyzers::{DiffSpan, EncodingType, SequenceReport, compare, decode, encode};
use crate::error::ApiError;

pub fn router() -> Router<ApiContext> {
	Router::new()
		.route("/decoder/encode", post(decoder_encode))
		.route("/decoder/decode", post(decoder_decode))
		.route("/sequencer/analyze", post(sequencer_analyze))
		.route("/comparer/compare", post(comparer_compare))
}

#[derive(Deserialize)]
struct DecoderBody {
	input_b64: String,
	encoding: EncodingType,
}

#[derive(Serialize)]
struct DecoderResponse {
	output_b64: String,
}

async fn decoder_encode(Json(body): Json<DecoderBody>) -> Result<Json<DecoderResponse>, ApiError> {
	let input = STANDARD.decode(&body.input_b64).map_err(|e| ApiError::BadRequest(e.to_string()))?;
	let output = encode(&input, body.encoding).map_err(|e| ApiError::BadRequest(e.to_string()))?;
	Ok(Json(DecoderResponse { output_b64: STANDARD.encode(&output) }))
}

async fn decoder_decode(Json(body): Json<DecoderBody>) -> Result<Json<DecoderResponse>, ApiError> {
	let input = STANDARD.decode(&body.input_b64).map_err(|e| ApiError::BadRequest(e.to_string()))?;
	let output = decode(&input, body.encoding).map_err(|e| ApiError::BadRequest(e.to_string()))?;
	Ok(Json(DecoderResponse { output_b64: STANDARD.encode(&output) }))
}

#[derive(Deserialize)]
struct SequencerBody {
	tokens_b64: Vec<String>,
}

async fn sequencer_analyze(Json(body): Json<SequencerBody>) -> Result<Json<SequenceReport>, ApiError> {
	let tokens: Vec<Vec<u8>> = body.tokens_b64.iter().map(|t| STANDARD.decode(t)).collect::<Result<_, _>>().map_err(|e| ApiError::BadRequest(e.to_string()))?;
	let report = analyze_or_reject(&tokens)?;
	Ok(Json(report))
}

fn analyze_or_reject(tokens: &[Vec<u8>]) -> Result<SequenceReport, ApiError> {
	crate::analyzers::analyze_sequence(tokens).ok_or_else(|| ApiError::BadRequest("need at least two non-empty tokens of equal minimum length".into()))
}

#[derive(Deserialize)]
struct ComparerBody {
	left: String,
	right: String,
}

#[derive(Serialize)]
struct ComparerResponse {
	spans: Vec<DiffSpan>,
}

async fn comparer_compare(Json(body): Json<ComparerBody>) -> Json<ComparerResponse> {
	Json(ComparerResponse { spans: compare(&body.left, &body.right) })
}
