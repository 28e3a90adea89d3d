//! trellis-core
//!
//! Frame-synchronous Viterbi beam-search core for a speaker-independent,
//! large-vocabulary continuous-speech recognizer built on semi-continuous
//! HMMs and an N-gram language model.
//!
//! The crate decodes per-frame senone score vectors against a statically
//! compiled pronunciation lexicon in up to three passes: an approximate
//! first pass over a prefix-sharing tree of triphone HMMs, a tighter second
//! pass over a flat lexicon restricted to the first pass's word lattice, and
//! an exact-trigram best-path rescoring of the final lattice DAG.
//!
//! Front-end audio, MFCC computation, Gaussian scoring, and model-file
//! parsing are external collaborators; see the `SenoneScorer` and
//! `LanguageModel` traits for the seams.
//!
//! Public API:
//! - `Decoder` - per-utterance decoding state machine and result access
//! - `Config` - typed decoding configuration (TOML loadable)
//! - `AcousticModel` - phones, transition matrices, senone sequences
//! - `Dictionary` - compiled pronunciation lexicon with cross-word tables
//! - `LanguageModel` / `NGramModel` / `CachedLm` - N-gram query interface
//! - `Lattice` - word lattice DAG with text dump/load
//! - `Hypothesis` / `Segment` - time-aligned recognition results

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::DecodeError;

pub mod amodel;
pub use amodel::{AcousticModel, AcousticModelBuilder, WordPosition};

pub mod dict;
pub use dict::{DictEntry, Dictionary, DictionaryBuilder};

pub mod lm;
pub use lm::{CachedLm, LanguageModel, NGramModel};

pub mod hmm;
pub use hmm::Hmm;

pub mod senone;
pub use senone::{SenoneActiveSet, SenoneScorer};

pub mod history;
pub use history::{HistEntry, HistoryTable};

pub mod lextree;
pub use lextree::LexTree;

pub mod fwdtree;
pub use fwdtree::FwdtreeSearch;

pub mod fwdflat;
pub use fwdflat::FwdflatSearch;

pub mod lattice;
pub use lattice::{LatLink, LatNode, Lattice};

pub mod bestpath;
pub use bestpath::BestPath;

pub mod nbest;

pub mod segment;
pub use segment::{Hypothesis, Segment};

pub mod decoder;
pub use decoder::{Decoder, SearchStats};

/// Dictionary word id. Non-negative; `NO_WORD` marks absence.
pub type WordId = i32;
/// Context-independent phone id.
pub type PhoneId = i32;
/// Senone-sequence id keying a per-state vector of senone ids.
pub type SsId = i32;
/// Tied emission density (senone) id.
pub type SenId = i32;
/// Transition matrix id (one per CI phone).
pub type TmatId = i32;
/// Frame index within an utterance.
pub type FrameId = i32;

pub const NO_WORD: WordId = -1;
pub const NO_SSID: SsId = -1;
/// Absent backpointer-table index.
pub const NO_BP: i32 = -1;

/// Integer log-probability domain shared by acoustic and language scores.
///
/// Scores are logarithms to a base slightly above 1 so that ordinary
/// probabilities map onto a wide integer range and path scores can be
/// accumulated with plain `i32` additions.
pub mod logs {
    /// Worst representable path score. Chosen so that a few beam-width
    /// additions cannot wrap a 32-bit accumulator.
    pub const WORST_SCORE: i32 = 0xE000_0000_u32 as i32;

    /// Hard cap on frames per utterance.
    pub const MAX_FRAMES: usize = 8000;

    const LOG_BASE: f64 = 1.0001;

    /// Convert a linear probability to the integer log domain.
    pub fn from_prob(p: f64) -> i32 {
        if p <= 0.0 {
            return WORST_SCORE;
        }
        from_ln(p.ln())
    }

    /// Convert a natural-log probability to the integer log domain.
    pub fn from_ln(ln: f64) -> i32 {
        let v = ln / LOG_BASE.ln();
        if v <= WORST_SCORE as f64 {
            WORST_SCORE
        } else {
            v.round() as i32
        }
    }
}

/// Decoding configuration.
///
/// Beams are linear probabilities in (0, 1]; they are converted to
/// log-domain widths once, at decoder construction (see [`Beams`]).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Main HMM pruning beam.
    pub beam: f64,
    /// New-phone (HMM exit) transition beam.
    pub pbeam: f64,
    /// Word-exit beam.
    pub wbeam: f64,
    /// Last-phone entry beam (applied against the overall best).
    pub lpbeam: f64,
    /// Last-phone-alone beam (applied against the best last-phone score).
    pub lponlybeam: f64,
    /// Second-pass HMM beam.
    pub fwdflatbeam: f64,
    /// Second-pass word-exit beam.
    pub fwdflatwbeam: f64,

    /// Hard cap on HMMs evaluated per frame; -1 disables.
    pub maxhmmpf: i32,
    /// Hard cap on word exits recorded per frame; -1 disables.
    pub maxwpf: i32,

    /// Language weight for the tree pass.
    pub lw: f32,
    /// Language weight for the flat pass.
    pub fwdflatlw: f32,
    /// Language weight for best-path rescoring.
    pub bestpathlw: f32,

    /// Word insertion penalty (linear probability).
    pub wip: f64,
    /// Silence word penalty.
    pub silpen: f64,
    /// Filler (noise) word penalty.
    pub fillpen: f64,
    /// Phone insertion penalty.
    pub pip: f64,
    /// New-word (tree-root entry) penalty.
    pub nwpen: f64,

    /// Run the lexical-tree first pass.
    pub fwdtree: bool,
    /// Run the flat-lexicon second pass.
    pub fwdflat: bool,
    /// Run best-path lattice rescoring.
    pub bestpath: bool,

    /// Score every senone each frame instead of the active subset.
    pub compallsen: bool,
    /// Approximate mode: skip exit transitions out of tree channels on odd
    /// frames. Trades accuracy for speed; results are not guaranteed to be a
    /// subset of the exact mode's.
    pub skipalt: bool,

    /// Minimum end-frame spread for a word to enter the second pass.
    pub fwdflatefwid: i32,
    /// Successor-word search window (frames) in the second pass.
    pub fwdflatsfwin: i32,

    /// Initial backpointer-table capacity; 0 picks a vocabulary-derived size.
    pub latsize: usize,

    /// Log the per-word backtrace at utterance end.
    pub backtrace: bool,
    /// Report alternative-pronunciation ids instead of base word ids.
    pub reportpron: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            beam: 1e-6,
            pbeam: 1e-5,
            wbeam: 5e-4,
            lpbeam: 1e-5,
            lponlybeam: 3e-4,
            fwdflatbeam: 1e-8,
            fwdflatwbeam: 3e-4,
            maxhmmpf: -1,
            maxwpf: -1,
            // Historical pass weights: 6.5 / 8.5 / 9.5
            lw: 6.5,
            fwdflatlw: 8.5,
            bestpathlw: 9.5,
            wip: 0.65,
            silpen: 0.005,
            fillpen: 1e-8,
            pip: 1.0,
            nwpen: 1.0,
            fwdtree: true,
            fwdflat: true,
            bestpath: true,
            compallsen: false,
            skipalt: false,
            fwdflatefwid: 4,
            fwdflatsfwin: 25,
            latsize: 0,
            backtrace: false,
            reportpron: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, DecodeError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DecodeError::Config(format!("read {}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to a TOML file.
    pub fn save_toml<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), DecodeError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DecodeError::Config(format!("serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| DecodeError::Config(format!("write {}: {e}", path.as_ref().display())))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, DecodeError> {
        toml::from_str(content).map_err(|e| DecodeError::Config(format!("parse config: {e}")))
    }

    fn check_beam(name: &str, v: f64) -> Result<(), DecodeError> {
        if v > 0.0 && v <= 1.0 {
            Ok(())
        } else {
            Err(DecodeError::Config(format!(
                "{name} must be in (0, 1], got {v}"
            )))
        }
    }

    /// Validate option ranges. Called once at decoder construction.
    pub fn validate(&self) -> Result<(), DecodeError> {
        Self::check_beam("beam", self.beam)?;
        Self::check_beam("pbeam", self.pbeam)?;
        Self::check_beam("wbeam", self.wbeam)?;
        Self::check_beam("lpbeam", self.lpbeam)?;
        Self::check_beam("lponlybeam", self.lponlybeam)?;
        Self::check_beam("fwdflatbeam", self.fwdflatbeam)?;
        Self::check_beam("fwdflatwbeam", self.fwdflatwbeam)?;
        if self.lw <= 0.0 || self.fwdflatlw <= 0.0 || self.bestpathlw <= 0.0 {
            return Err(DecodeError::Config("language weights must be > 0".into()));
        }
        if self.fwdflatefwid < 0 || self.fwdflatsfwin <= 0 {
            return Err(DecodeError::Config(
                "fwdflatefwid must be >= 0 and fwdflatsfwin > 0".into(),
            ));
        }
        if !self.fwdtree && !self.fwdflat {
            return Err(DecodeError::Config(
                "at least one of fwdtree/fwdflat must be enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Log-domain beam widths and penalties derived from [`Config`].
#[derive(Debug, Clone)]
pub struct Beams {
    pub main: i32,
    pub pbeam: i32,
    pub wbeam: i32,
    pub lpbeam: i32,
    pub lponlybeam: i32,
    pub fwdflat: i32,
    pub fwdflat_word: i32,
    /// Phone insertion penalty.
    pub pip: i32,
    /// Silence word penalty (includes pip).
    pub silpen: i32,
    /// Filler word penalty (includes pip).
    pub fillpen: i32,
    /// New-word penalty applied at tree-root entry.
    pub nwpen: i32,
    /// fwdflat-to-fwdtree language weight ratio.
    pub fwdflat_lw_ratio: f32,
    /// bestpath-to-fwdtree language weight ratio.
    pub bestpath_lw_ratio: f32,
}

impl Beams {
    pub fn from_config(cfg: &Config) -> Result<Self, DecodeError> {
        cfg.validate()?;
        let pip = logs::from_prob(cfg.pip);
        Ok(Self {
            main: logs::from_prob(cfg.beam),
            pbeam: logs::from_prob(cfg.pbeam),
            wbeam: logs::from_prob(cfg.wbeam),
            lpbeam: logs::from_prob(cfg.lpbeam),
            lponlybeam: logs::from_prob(cfg.lponlybeam),
            fwdflat: logs::from_prob(cfg.fwdflatbeam),
            fwdflat_word: logs::from_prob(cfg.fwdflatwbeam),
            pip,
            silpen: logs::from_prob(cfg.silpen) + pip,
            fillpen: logs::from_prob(cfg.fillpen) + pip,
            nwpen: logs::from_prob(cfg.nwpen),
            fwdflat_lw_ratio: cfg.fwdflatlw / cfg.lw,
            bestpath_lw_ratio: cfg.bestpathlw / cfg.lw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_domain_ordering() {
        assert!(logs::from_prob(0.5) < 0);
        assert!(logs::from_prob(0.5) > logs::from_prob(0.25));
        assert_eq!(logs::from_prob(0.0), logs::WORST_SCORE);
        assert_eq!(logs::from_prob(1.0), 0);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = Config::default();
        let s = toml::to_string_pretty(&cfg).unwrap();
        let back = Config::from_toml_str(&s).unwrap();
        assert_eq!(back.lw, cfg.lw);
        assert_eq!(back.maxhmmpf, cfg.maxhmmpf);
        assert_eq!(back.fwdflatsfwin, cfg.fwdflatsfwin);
    }

    #[test]
    fn config_rejects_bad_beam() {
        let cfg = Config {
            beam: 1.5,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(DecodeError::Config(_))));
    }

    #[test]
    fn beams_are_negative_widths() {
        let b = Beams::from_config(&Config::default()).unwrap();
        assert!(b.main < 0);
        assert!(b.fwdflat < b.main, "second-pass beam is tighter");
    }
}
