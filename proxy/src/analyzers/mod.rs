//! Pure-function analysis kernels used by the decoder, sequencer, and comparer API surfaces.
//! None of these touch the network or storage; each is a deterministic transform over bytes.

pub mod comparer;
pub mod decoder;
pub mod sequencer;

pub use comparer::{CompareSource, DiffSpan, DiffSpanKind, compare};
pub use decoder::{DecodeError, EncodingType, decode, encode};
pub use sequencer::{SequenceQuality, SequenceReport, analyze_sequence};
