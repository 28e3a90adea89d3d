//! Shared toy models for the integration tests: a small phone set, a
//! handful of words, a uniform-ish language model, and a scripted senone
//! scorer that strongly favors one phone per frame.

use trellis_core::amodel::{AcousticModel, AcousticModelBuilder};
use trellis_core::dict::{Dictionary, DictionaryBuilder};
use trellis_core::lm::NGramModel;
use trellis_core::senone::SenoneScorer;
use trellis_core::{Config, PhoneId, SenId};

pub const PHONES: &[&str] = &[
    "SIL", "G", "OW", "F", "AO", "R", "W", "ER", "D", "T", "EH", "N", "M", "IY", "Z", "HH", "AH",
    "L", "DH", "K", "B", "AW", "AA", "S",
];

pub fn toy_am() -> AcousticModel {
    static LOGS: std::sync::Once = std::sync::Once::new();
    LOGS.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });

    let mut b = AcousticModelBuilder::new(3);
    for p in PHONES {
        b.add_phone(p);
    }
    b.build("SIL").unwrap()
}

pub fn toy_dict(am: &AcousticModel) -> Dictionary {
    let mut db = DictionaryBuilder::new();
    db.add_word("go", &["G", "OW"]);
    db.add_word("forward", &["F", "AO", "R", "W", "ER", "D"]);
    db.add_word("four", &["F", "AO", "R"]);
    db.add_word("word", &["W", "ER", "D"]);
    db.add_word("ten", &["T", "EH", "N"]);
    db.add_word("meters", &["M", "IY", "T", "ER", "Z"]);
    db.add_word("hello", &["HH", "AH", "L", "OW"]);
    db.add_word("the", &["DH", "AH"]);
    db.add_word("quick", &["K", "W", "IY", "K"]);
    db.add_word("brown", &["B", "R", "AW", "N"]);
    db.add_word("fox", &["F", "AA", "K", "S"]);
    db.build(am).unwrap()
}

/// Uniform unigrams over the vocabulary; `<s>`/`</s>` included.
pub fn toy_lm(dict: &Dictionary) -> NGramModel {
    let mut lm = NGramModel::new();
    for w in [
        "go", "forward", "four", "word", "ten", "meters", "hello", "the", "quick", "brown", "fox",
        "<s>", "</s>",
    ] {
        lm.add_unigram(dict.word_id(w).unwrap(), 0.05);
    }
    lm
}

/// Wide-open beams so the toy decodes are decided by scores, not pruning.
pub fn toy_config() -> Config {
    Config {
        beam: 1e-60,
        pbeam: 1e-60,
        wbeam: 1e-40,
        lpbeam: 1e-60,
        lponlybeam: 1e-40,
        fwdflatbeam: 1e-60,
        fwdflatwbeam: 1e-40,
        fwdflatefwid: 2,
        compallsen: true,
        bestpath: false,
        ..Config::default()
    }
}

/// Scores senones of the scripted phone at 0 and everything else at a
/// fixed penalty. Frames beyond the script read as silence.
pub struct ScriptScorer {
    /// Per frame: the favored phone.
    pub script: Vec<PhoneId>,
    pub good: i32,
    pub bad: i32,
    sseq: Vec<Vec<SenId>>,
    sil: PhoneId,
}

impl ScriptScorer {
    pub fn new(am: &AcousticModel, script: Vec<PhoneId>) -> Self {
        let sseq = (0..am.n_ci() as i32)
            .map(|p| am.sseq(am.ci_ssid(p)).to_vec())
            .collect();
        Self {
            script,
            good: 0,
            bad: -3000,
            sseq,
            sil: am.sil_phone(),
        }
    }

    pub fn frame_scores(&self, frame: usize, out: &mut [i32]) {
        let phone = self
            .script
            .get(frame)
            .copied()
            .unwrap_or(self.sil);
        out.iter_mut().for_each(|s| *s = self.bad);
        for &sen in &self.sseq[phone as usize] {
            out[sen as usize] = self.good;
        }
    }

    pub fn n_frames(&self) -> usize {
        self.script.len()
    }
}

impl SenoneScorer for ScriptScorer {
    fn score(&mut self, frame: usize, _active: Option<&[SenId]>, out: &mut [i32]) {
        self.frame_scores(frame, out);
    }
}

/// Phone script: leading/trailing silence around `reps`-frame phone
/// segments for each word's pronunciation.
pub fn script_for(am: &AcousticModel, words: &[&str], dict: &Dictionary, reps: usize) -> Vec<PhoneId> {
    let sil = am.sil_phone();
    let mut script = vec![sil; 6];
    for w in words {
        let wid = dict.word_id(w).unwrap();
        for &p in &dict.entry(wid).ci {
            for _ in 0..reps {
                script.push(p);
            }
        }
    }
    script.extend(std::iter::repeat(sil).take(6));
    script
}
