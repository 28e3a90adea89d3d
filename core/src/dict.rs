//! Compiled pronunciation lexicon.
//!
//! The search passes consume a dictionary that has already been resolved
//! against the acoustic model: per-word CI phone sequences, the per-position
//! senone-sequence ids (with the first position keyed by the word's boundary
//! diphone), the deduplicated right-context fan-out tables for last phones,
//! and the left-context table that rewrites a root's entry ssid when a new
//! cross-word context arrives.
//!
//! Word-id layout is load-bearing: main dictionary words come first, then
//! `</s>`, `<s>`, `<sil>`, then noise fillers. `is_filler` and `is_real`
//! are range checks against that layout, and the history table relies on
//! them when skipping fillers in LM histories.

use crate::amodel::{AcousticModel, WordPosition};
use crate::{DecodeError, PhoneId, SsId, WordId, NO_WORD};
use ahash::AHashMap;
use fst::Map;
use std::collections::BTreeMap;
use tracing::warn;

/// One pronunciation entry.
#[derive(Debug, Clone)]
pub struct DictEntry {
    pub word: String,
    /// Base word id with alternative pronunciations collapsed.
    pub base_wid: WordId,
    /// Next alternative pronunciation of the same base word, or `NO_WORD`.
    pub alt: WordId,
    /// CI phone sequence; never empty.
    pub ci: Vec<PhoneId>,
    /// Model ids per position: `ssids[0]` is the boundary diphone for
    /// multi-phone words (CI ssid for single-phone words); positions
    /// `1..len-1` are word-internal triphone ssids. The last phone has no
    /// entry here; its models come from the right-context fan-out table.
    pub ssids: Vec<SsId>,
    /// Right-context table id for the last phone; -1 for single-phone words.
    pub r_diph: i32,
    /// Uses cross-word left-context multiplexing at its first phone.
    pub mpx: bool,
}

impl DictEntry {
    pub fn len(&self) -> usize {
        self.ci.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ci.is_empty()
    }

    pub fn first_ci(&self) -> PhoneId {
        self.ci[0]
    }

    pub fn last_ci(&self) -> PhoneId {
        *self.ci.last().unwrap()
    }
}

/// Compiled lexicon plus cross-word context tables.
pub struct Dictionary {
    entries: Vec<DictEntry>,
    /// word string -> word id.
    index: Map<Vec<u8>>,
    n_main: usize,
    finish_wid: WordId,
    start_wid: WordId,
    sil_wid: WordId,
    n_ci: usize,
    /// rc_fwd[r_diph] -> deduplicated last-phone ssids, one per distinct
    /// right-context model.
    rc_fwd: Vec<Vec<SsId>>,
    /// rc_fwd_perm[r_diph][ci] -> index into rc_fwd[r_diph].
    rc_fwd_perm: Vec<Vec<i32>>,
    /// (first-diphone, left CI phone) -> root entry ssid.
    lc_fwd: AHashMap<(SsId, PhoneId), SsId>,
    zero_perm: Vec<i32>,
}

impl Dictionary {
    pub fn n_words(&self) -> usize {
        self.entries.len()
    }

    /// Words eligible for the lexical tree (excludes `</s>`, `<s>`, fillers).
    pub fn n_main_words(&self) -> usize {
        self.n_main
    }

    pub fn entry(&self, w: WordId) -> &DictEntry {
        &self.entries[w as usize]
    }

    pub fn word_str(&self, w: WordId) -> &str {
        &self.entries[w as usize].word
    }

    pub fn base_wid(&self, w: WordId) -> WordId {
        self.entries[w as usize].base_wid
    }

    pub fn word_id(&self, word: &str) -> Option<WordId> {
        self.index.get(word.as_bytes()).map(|v| v as WordId)
    }

    pub fn start_wid(&self) -> WordId {
        self.start_wid
    }

    pub fn finish_wid(&self) -> WordId {
        self.finish_wid
    }

    pub fn sil_wid(&self) -> WordId {
        self.sil_wid
    }

    /// `<sil>` and every noise word.
    pub fn is_filler(&self, w: WordId) -> bool {
        w >= self.sil_wid
    }

    /// Anything before `</s>` in the id layout.
    pub fn is_real(&self, w: WordId) -> bool {
        w < self.finish_wid
    }

    pub fn n_ci(&self) -> usize {
        self.n_ci
    }

    /// Right-context permutation row for a last-phone table id; the all-zero
    /// row when the word has no right-context fan-out.
    pub fn rc_perm(&self, r_diph: i32) -> &[i32] {
        if r_diph < 0 {
            &self.zero_perm
        } else {
            &self.rc_fwd_perm[r_diph as usize]
        }
    }

    /// Number of distinct right-context models for a last-phone table id.
    pub fn rc_count(&self, r_diph: i32) -> usize {
        if r_diph < 0 {
            1
        } else {
            self.rc_fwd[r_diph as usize].len()
        }
    }

    /// Deduplicated last-phone ssids for a table id.
    pub fn rc_ssids(&self, r_diph: i32) -> &[SsId] {
        &self.rc_fwd[r_diph as usize]
    }

    /// Root entry ssid for a first diphone under a cross-word left context.
    pub fn left_context_ssid(&self, diphone: SsId, lc: PhoneId) -> SsId {
        self.lc_fwd.get(&(diphone, lc)).copied().unwrap_or(diphone)
    }
}

/// Collects raw pronunciations and compiles them against an acoustic model.
///
/// `<s>`, `</s>`, and `<sil>` are added automatically with the silence-phone
/// pronunciation. Alternative pronunciations use the `word(2)` naming
/// convention and chain onto their base entry.
#[derive(Default)]
pub struct DictionaryBuilder {
    words: Vec<(String, Vec<String>)>,
    fillers: Vec<(String, Vec<String>)>,
}

impl DictionaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_word<S: Into<String>>(&mut self, word: S, phones: &[&str]) -> &mut Self {
        self.words.push((
            word.into(),
            phones.iter().map(|p| p.to_string()).collect(),
        ));
        self
    }

    /// Add a noise filler word (single-phone).
    pub fn add_filler<S: Into<String>>(&mut self, word: S, phone: &str) -> &mut Self {
        self.fillers.push((word.into(), vec![phone.to_string()]));
        self
    }

    fn base_name(word: &str) -> &str {
        match word.rfind('(') {
            Some(i) if word.ends_with(')') => &word[..i],
            _ => word,
        }
    }

    pub fn build(self, am: &AcousticModel) -> Result<Dictionary, DecodeError> {
        let n_ci = am.n_ci();
        let sil = am.sil_phone();

        // Resolve phone names; elide words with unknown phones.
        let resolve = |word: &str, phones: &[String]| -> Option<Vec<PhoneId>> {
            let mut out = Vec::with_capacity(phones.len());
            for p in phones {
                match am.phone_id(p) {
                    Some(id) => out.push(id),
                    None => {
                        warn!(word, phone = %p, "unknown phone in pronunciation; word elided");
                        return None;
                    }
                }
            }
            if out.is_empty() {
                warn!(word, "empty pronunciation; word elided");
                None
            } else {
                Some(out)
            }
        };

        let mut raw: Vec<(String, Vec<PhoneId>)> = Vec::new();
        let mut seen: AHashMap<String, ()> = AHashMap::new();
        for (word, phones) in &self.words {
            if seen.insert(word.clone(), ()).is_some() {
                warn!(word = %word, "duplicate dictionary entry; later copy elided");
                continue;
            }
            if let Some(ci) = resolve(word, phones) {
                raw.push((word.clone(), ci));
            }
        }

        // Special words and fillers follow the main vocabulary.
        let n_main = raw.len();
        raw.push(("</s>".to_string(), vec![sil]));
        raw.push(("<s>".to_string(), vec![sil]));
        raw.push(("<sil>".to_string(), vec![sil]));
        for (word, phones) in &self.fillers {
            if phones.len() != 1 {
                warn!(word = %word, "multi-phone filler unsupported; word elided");
                continue;
            }
            if seen.insert(word.clone(), ()).is_some() {
                warn!(word = %word, "duplicate filler entry; later copy elided");
                continue;
            }
            if let Some(ci) = resolve(word, phones) {
                raw.push((word.clone(), ci));
            }
        }

        let finish_wid = n_main as WordId;
        let start_wid = finish_wid + 1;
        let sil_wid = finish_wid + 2;

        // Base/alt pronunciation chains by stripped name.
        let mut base_of: AHashMap<String, WordId> = AHashMap::new();
        let mut chain_tail: AHashMap<WordId, WordId> = AHashMap::new();

        let mut rc_key: AHashMap<(PhoneId, PhoneId), i32> = AHashMap::new();
        let mut rc_fwd: Vec<Vec<SsId>> = Vec::new();
        let mut rc_fwd_perm: Vec<Vec<i32>> = Vec::new();
        let mut lc_fwd: AHashMap<(SsId, PhoneId), SsId> = AHashMap::new();

        let mut entries: Vec<DictEntry> = Vec::with_capacity(raw.len());
        for (wid, (word, ci)) in raw.iter().enumerate() {
            let wid = wid as WordId;
            let len = ci.len();
            let (ssids, r_diph, mpx) = if len == 1 {
                (vec![am.ci_ssid(ci[0])], -1, false)
            } else {
                let diph = am.triphone_ssid(ci[0], sil, ci[1], WordPosition::Begin);
                let mut ssids = Vec::with_capacity(len - 1);
                ssids.push(diph);
                for p in 1..len - 1 {
                    ssids.push(am.triphone_ssid(
                        ci[p],
                        ci[p - 1],
                        ci[p + 1],
                        WordPosition::Internal,
                    ));
                }
                // Left-context rewrites for this root diphone.
                for lc in 0..n_ci as PhoneId {
                    lc_fwd.insert(
                        (diph, lc),
                        am.triphone_ssid(ci[0], lc, ci[1], WordPosition::Begin),
                    );
                }
                // Deduplicated right-context fan-out for the last phone.
                let last = ci[len - 1];
                let penult = ci[len - 2];
                let r_diph = *rc_key.entry((last, penult)).or_insert_with(|| {
                    let mut ssid_list: Vec<SsId> = Vec::new();
                    let mut perm = vec![0i32; n_ci];
                    for rc in 0..n_ci as PhoneId {
                        let s = am.triphone_ssid(last, penult, rc, WordPosition::End);
                        let pos = match ssid_list.iter().position(|&x| x == s) {
                            Some(p) => p,
                            None => {
                                ssid_list.push(s);
                                ssid_list.len() - 1
                            }
                        };
                        perm[rc as usize] = pos as i32;
                    }
                    rc_fwd.push(ssid_list);
                    rc_fwd_perm.push(perm);
                    (rc_fwd.len() - 1) as i32
                });
                (ssids, r_diph, true)
            };

            let base = Self::base_name(word);
            let base_wid = match base_of.get(base) {
                Some(&b) => {
                    // Chain this alternative after the current tail.
                    let tail = chain_tail.get(&b).copied().unwrap_or(b);
                    entries[tail as usize].alt = wid;
                    chain_tail.insert(b, wid);
                    b
                }
                None => {
                    base_of.insert(base.to_string(), wid);
                    wid
                }
            };

            entries.push(DictEntry {
                word: word.clone(),
                base_wid,
                alt: NO_WORD,
                ci: ci.clone(),
                ssids,
                r_diph,
                mpx,
            });
        }

        // fst index needs sorted unique keys.
        let sorted: BTreeMap<&str, u64> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.word.as_str(), i as u64))
            .collect();
        let mut fst_builder = fst::MapBuilder::memory();
        for (k, v) in sorted {
            fst_builder
                .insert(k, v)
                .map_err(|e| DecodeError::Lexicon(format!("index build: {e}")))?;
        }
        let index = Map::new(fst_builder.into_inner().map_err(|e| {
            DecodeError::Lexicon(format!("index build: {e}"))
        })?)
        .map_err(|e| DecodeError::Lexicon(format!("index build: {e}")))?;

        Ok(Dictionary {
            entries,
            index,
            n_main,
            finish_wid,
            start_wid,
            sil_wid,
            n_ci,
            rc_fwd,
            rc_fwd_perm,
            lc_fwd,
            zero_perm: vec![0; n_ci],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amodel::AcousticModelBuilder;

    fn toy_am() -> AcousticModel {
        let mut b = AcousticModelBuilder::new(3);
        for p in ["SIL", "G", "OW", "F", "AO", "R"] {
            b.add_phone(p);
        }
        b.build("SIL").unwrap()
    }

    fn toy_dict() -> Dictionary {
        let am = toy_am();
        let mut b = DictionaryBuilder::new();
        b.add_word("go", &["G", "OW"]);
        b.add_word("four", &["F", "AO", "R"]);
        b.add_word("four(2)", &["F", "OW", "R"]);
        b.add_word("oh", &["OW"]);
        b.add_filler("<noise>", "SIL");
        b.build(&am).unwrap()
    }

    #[test]
    fn word_id_layout() {
        let d = toy_dict();
        assert_eq!(d.n_main_words(), 4);
        assert_eq!(d.word_str(d.finish_wid()), "</s>");
        assert_eq!(d.word_str(d.start_wid()), "<s>");
        assert_eq!(d.word_str(d.sil_wid()), "<sil>");
        assert!(d.is_filler(d.sil_wid()));
        assert!(d.is_filler(d.sil_wid() + 1));
        assert!(!d.is_filler(d.start_wid()));
        assert!(d.is_real(0));
        assert!(!d.is_real(d.finish_wid()));
    }

    #[test]
    fn alt_pron_chain() {
        let d = toy_dict();
        let four = d.word_id("four").unwrap();
        let four2 = d.word_id("four(2)").unwrap();
        assert_eq!(d.entry(four).alt, four2);
        assert_eq!(d.base_wid(four2), four);
        assert_eq!(d.entry(four2).alt, crate::NO_WORD);
    }

    #[test]
    fn single_phone_word_shape() {
        let d = toy_dict();
        let oh = d.word_id("oh").unwrap();
        let e = d.entry(oh);
        assert_eq!(e.len(), 1);
        assert_eq!(e.r_diph, -1);
        assert!(!e.mpx);
        assert_eq!(d.rc_count(e.r_diph), 1);
        assert!(d.rc_perm(e.r_diph).iter().all(|&i| i == 0));
    }

    #[test]
    fn rc_tables_cover_all_ci_phones() {
        let d = toy_dict();
        let go = d.word_id("go").unwrap();
        let e = d.entry(go);
        assert!(e.mpx);
        assert!(e.r_diph >= 0);
        let perm = d.rc_perm(e.r_diph);
        assert_eq!(perm.len(), d.n_ci());
        let count = d.rc_count(e.r_diph) as i32;
        assert!(perm.iter().all(|&i| i >= 0 && i < count));
    }

    #[test]
    fn unknown_phone_elides_word() {
        let am = toy_am();
        let mut b = DictionaryBuilder::new();
        b.add_word("zap", &["Z", "AE", "P"]);
        b.add_word("go", &["G", "OW"]);
        let d = b.build(&am).unwrap();
        assert!(d.word_id("zap").is_none());
        assert!(d.word_id("go").is_some());
    }
}
