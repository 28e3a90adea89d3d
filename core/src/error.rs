//! Error taxonomy for the decoder core.
//!
//! Errors below `Capacity` are surfaced only at utterance boundaries; inside
//! the per-frame path only programmer-error conditions abort (as debug
//! assertions). Capacity overruns degrade recall and are reported once per
//! utterance through `tracing` rather than failing the frame.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Unknown option, out-of-range numeric, or missing model piece at init.
    #[error("configuration error: {0}")]
    Config(String),

    /// Dictionary/LM mismatch or malformed pronunciation at lexicon compile.
    #[error("lexicon error: {0}")]
    Lexicon(String),

    /// A bounded table filled up; the result may be incomplete.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// An operation was requested in the wrong utterance state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A dumped lattice file could not be parsed.
    #[error("lattice format error: {0}")]
    LatticeFormat(String),

    /// N-best requested without a saved lattice.
    #[error("no saved lattice")]
    NoLattice,

    /// Best-path rescoring requested after in-pass renormalization.
    #[error("scores were renormalized; lattice rescoring would compare across epochs")]
    Renormalized,
}
