//! Word-exit backpointer table: the implicit forward-pass lattice.
//!
//! Append-only within an utterance. Each entry records one word exit with
//! its best predecessor; per-right-context exit scores live in a shared
//! score stack indexed through the dictionary's right-context permutation
//! rows. `real_wid`/`prev_real_wid` cache the filler-skipped LM history so
//! cross-word transitions get trigram lookups in O(1).

use crate::dict::Dictionary;
use crate::lm::{CachedLm, LanguageModel};
use crate::{logs, FrameId, PhoneId, WordId, NO_BP, NO_WORD};
use tracing::warn;

/// One word exit.
#[derive(Debug, Clone)]
pub struct HistEntry {
    /// End frame of the word.
    pub frame: FrameId,
    pub wid: WordId,
    /// Predecessor entry index, or `NO_BP`.
    pub bp: i32,
    /// Best score over all right contexts.
    pub score: i32,
    /// Start of this entry's slice of the right-context score stack.
    pub s_idx: i32,
    /// Right-context table id of the word's last phone; -1 if none.
    pub r_diph: i32,
    /// Base id of this word, or the latest non-filler predecessor.
    pub real_wid: WordId,
    /// Non-filler predecessor of `real_wid`.
    pub prev_real_wid: WordId,
    pub ascr: i32,
    pub lscr: i32,
    /// Cleared by absolute pruning instead of compacting the table.
    pub valid: bool,
}

/// Backpointer table plus right-context score stack.
pub struct HistoryTable {
    entries: Vec<HistEntry>,
    stack: Vec<i32>,
    /// frame -> index of its first entry; `frame_start[f]..frame_start[f+1]`
    /// is frame f's slice.
    frame_start: Vec<usize>,
    /// Per word: entry index in the current frame, or `NO_BP`.
    word_exit: Vec<i32>,
    overflowed: bool,
    cap_entries: usize,
    cap_stack: usize,
    n_ci: usize,
}

impl HistoryTable {
    /// `latsize == 0` picks a vocabulary-derived capacity.
    pub fn new(n_words: usize, latsize: usize, n_ci: usize) -> Self {
        let cap_entries = if latsize > 0 {
            latsize
        } else {
            (n_words / 1000).max(25) * logs::MAX_FRAMES
        };
        // 20 = average right-context fanout
        let cap_stack = cap_entries * 20;
        Self {
            entries: Vec::new(),
            stack: Vec::new(),
            frame_start: Vec::new(),
            word_exit: vec![NO_BP; n_words],
            overflowed: false,
            cap_entries,
            cap_stack,
            n_ci,
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.stack.clear();
        self.frame_start.clear();
        self.word_exit.iter_mut().for_each(|w| *w = NO_BP);
        self.overflowed = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn entry(&self, i: i32) -> &HistEntry {
        &self.entries[i as usize]
    }

    pub fn entries(&self) -> &[HistEntry] {
        &self.entries
    }

    /// Record that frame `f` begins at the current table length. Gaps are
    /// filled so `frame_start[g]` is valid for every g <= f.
    pub fn mark_frame(&mut self, f: usize) {
        while self.frame_start.len() <= f {
            self.frame_start.push(self.entries.len());
        }
    }

    /// Entry index range for a frame.
    pub fn frame_range(&self, f: usize) -> std::ops::Range<usize> {
        let start = self.frame_start.get(f).copied().unwrap_or(self.entries.len());
        let end = self
            .frame_start
            .get(f + 1)
            .copied()
            .unwrap_or(self.entries.len());
        start..end
    }

    pub fn exit_of(&self, w: WordId) -> i32 {
        self.word_exit[w as usize]
    }

    pub fn clear_exit(&mut self, w: WordId) {
        self.word_exit[w as usize] = NO_BP;
    }

    /// Per-right-context exit score of an entry, selected by the first CI
    /// phone of the successor word.
    pub fn rc_score(&self, e: &HistEntry, dict: &Dictionary, first_ci: PhoneId) -> i32 {
        let perm = dict.rc_perm(e.r_diph);
        self.stack[(e.s_idx + perm[first_ci as usize]) as usize]
    }

    /// Raw score-stack slot.
    pub fn stack_at(&self, i: i32) -> i32 {
        self.stack[i as usize]
    }

    /// Walk back through filler entries to cache the LM history words.
    fn cache_paths(&mut self, idx: usize, dict: &Dictionary) {
        let mut b = idx as i32;
        let mut w = self.entries[idx].wid;
        while w >= 0 && dict.is_filler(w) {
            b = self.entries[b as usize].bp;
            if b == NO_BP {
                w = NO_WORD;
                break;
            }
            w = self.entries[b as usize].wid;
        }
        self.entries[idx].real_wid = if w >= 0 { dict.base_wid(w) } else { NO_WORD };

        let prev = if b != NO_BP {
            let pb = self.entries[b as usize].bp;
            if pb != NO_BP {
                self.entries[pb as usize].real_wid
            } else {
                NO_WORD
            }
        } else {
            NO_WORD
        };
        self.entries[idx].prev_real_wid = prev;
    }

    /// Record a word exit, creating a new entry for `(w, frame)` or
    /// improving the existing one. `rc` is the deduplicated right-context
    /// index of the exiting last-phone channel.
    pub fn save(
        &mut self,
        dict: &Dictionary,
        frame: FrameId,
        w: WordId,
        score: i32,
        path: i32,
        rc: usize,
    ) {
        let existing = self.word_exit[w as usize];
        if existing != NO_BP {
            let b = existing as usize;
            if self.entries[b].score < score {
                if self.entries[b].bp != path {
                    self.entries[b].bp = path;
                    self.cache_paths(b, dict);
                }
                self.entries[b].score = score;
            }
            let s_idx = self.entries[b].s_idx;
            self.stack[s_idx as usize + rc] = score;
            return;
        }

        if self.entries.len() >= self.cap_entries
            || self.stack.len() >= self.cap_stack.saturating_sub(self.n_ci)
        {
            if !self.overflowed {
                warn!(frame, "backpointer table overflowed; ignoring rest of utterance");
                self.overflowed = true;
            }
            return;
        }

        let de = dict.entry(w);
        let (r_diph, rcsize) = if de.len() != 1 && de.mpx {
            (de.r_diph, dict.rc_count(de.r_diph))
        } else {
            (-1, 1)
        };

        let s_idx = self.stack.len() as i32;
        self.stack
            .extend(std::iter::repeat(logs::WORST_SCORE).take(rcsize));
        self.stack[s_idx as usize + rc] = score;

        let idx = self.entries.len();
        self.word_exit[w as usize] = idx as i32;
        self.entries.push(HistEntry {
            frame,
            wid: w,
            bp: path,
            score,
            s_idx,
            r_diph,
            real_wid: NO_WORD,
            prev_real_wid: NO_WORD,
            ascr: 0,
            lscr: 0,
            valid: true,
        });
        self.cache_paths(idx, dict);
    }

    /// Absolute per-frame pruning: keep at most `maxwpf` non-filler exits
    /// and the single best filler exit; everything else is invalidated.
    pub fn cap_word_exits(&mut self, dict: &Dictionary, frame: usize, maxwpf: i32) {
        let range = self.frame_range(frame);
        if range.is_empty() {
            return;
        }

        // One filler exit (the best) survives.
        let mut best_filler: Option<usize> = None;
        for i in range.clone() {
            if dict.is_filler(self.entries[i].wid) {
                if best_filler.map_or(true, |b| self.entries[i].score > self.entries[b].score) {
                    best_filler = Some(i);
                }
                self.entries[i].valid = false;
            }
        }
        if let Some(b) = best_filler {
            self.entries[b].valid = true;
        }

        let mut n = range
            .clone()
            .filter(|&i| self.entries[i].valid && !dict.is_filler(self.entries[i].wid))
            .count();
        while n as i32 > maxwpf {
            let mut worst: Option<usize> = None;
            for i in range.clone() {
                if self.entries[i].valid
                    && !dict.is_filler(self.entries[i].wid)
                    && worst.map_or(true, |w| self.entries[i].score < self.entries[w].score)
                {
                    worst = Some(i);
                }
            }
            match worst {
                Some(w) => self.entries[w].valid = false,
                None => break,
            }
            n -= 1;
        }
    }

    /// Fill in per-entry acoustic and LM scores after a pass completes.
    ///
    /// `lwf` is the pass-to-fwdtree language weight ratio applied on top of
    /// the already-weighted trigram scores.
    pub fn compute_seg_scores<L: LanguageModel>(
        &mut self,
        dict: &Dictionary,
        lm: &CachedLm<L>,
        lwf: f32,
        silpen: i32,
        fillpen: i32,
    ) {
        for i in 0..self.entries.len() {
            let (bp, wid, score) = {
                let e = &self.entries[i];
                (e.bp, e.wid, e.score)
            };
            if bp == NO_BP {
                self.entries[i].ascr = score;
                self.entries[i].lscr = 0;
                continue;
            }

            let first_ci = dict.entry(wid).first_ci();
            let (start_score, p_real, p_prev_real) = {
                let p = &self.entries[bp as usize];
                (self.rc_score(p, dict, first_ci), p.real_wid, p.prev_real_wid)
            };

            let lscr = if wid == dict.sil_wid() {
                silpen
            } else if dict.is_filler(wid) {
                fillpen
            } else {
                let tg = lm.tg_score(dict.base_wid(wid), p_real, p_prev_real);
                (tg as f32 * lwf) as i32
            };
            let e = &mut self.entries[i];
            e.lscr = lscr;
            e.ascr = score - start_score - lscr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amodel::{AcousticModel, AcousticModelBuilder};
    use crate::dict::DictionaryBuilder;
    use crate::lm::NGramModel;

    fn toy() -> (AcousticModel, Dictionary) {
        let mut b = AcousticModelBuilder::new(3);
        for p in ["SIL", "HH", "AH", "L", "OW"] {
            b.add_phone(p);
        }
        let am = b.build("SIL").unwrap();
        let mut db = DictionaryBuilder::new();
        db.add_word("hello", &["HH", "AH", "L", "OW"]);
        db.add_word("low", &["L", "OW"]);
        let dict = db.build(&am).unwrap();
        (am, dict)
    }

    fn table(dict: &Dictionary) -> HistoryTable {
        HistoryTable::new(dict.n_words(), 256, dict.n_ci())
    }

    #[test]
    fn entries_are_frame_ordered() {
        let (_, dict) = toy();
        let mut t = table(&dict);
        let hello = dict.word_id("hello").unwrap();
        let low = dict.word_id("low").unwrap();

        t.mark_frame(0);
        t.save(&dict, 0, dict.start_wid(), 0, NO_BP, 0);
        t.clear_exit(dict.start_wid());
        t.mark_frame(1);
        t.save(&dict, 1, hello, -100, 0, 0);
        t.save(&dict, 1, low, -150, 0, 0);
        t.mark_frame(2);

        for (i, e) in t.entries().iter().enumerate() {
            assert!(e.bp < i as i32);
            let r = t.frame_range(e.frame as usize);
            assert!(r.contains(&i));
        }
        assert_eq!(t.frame_range(1), 1..3);
    }

    #[test]
    fn repeated_exit_keeps_best() {
        let (_, dict) = toy();
        let mut t = table(&dict);
        let hello = dict.word_id("hello").unwrap();
        t.mark_frame(0);
        t.save(&dict, 0, dict.start_wid(), 0, NO_BP, 0);
        t.clear_exit(dict.start_wid());
        t.mark_frame(1);
        t.save(&dict, 1, hello, -200, 0, 0);
        t.save(&dict, 1, hello, -100, 0, 0);
        t.save(&dict, 1, hello, -300, 0, 0);
        // one entry per (word, frame); its score is the best seen
        assert_eq!(t.frame_range(1).len(), 1);
        let e = t.entry(1);
        assert_eq!(e.score, -100);
        // the right-context slot tracks the latest exiting channel
        assert_eq!(t.stack[e.s_idx as usize], -300);
    }

    #[test]
    fn filler_transparent_history() {
        let (_, dict) = toy();
        let mut t = table(&dict);
        let hello = dict.word_id("hello").unwrap();
        t.mark_frame(0);
        t.save(&dict, 0, dict.start_wid(), 0, NO_BP, 0);
        t.clear_exit(dict.start_wid());
        t.mark_frame(1);
        t.save(&dict, 1, hello, -50, 0, 0);
        t.mark_frame(2);
        t.save(&dict, 2, dict.sil_wid(), -80, 1, 0);
        let sil_entry = t.entry(2);
        // silence is skipped: history reads the real word behind it
        assert_eq!(sil_entry.real_wid, dict.base_wid(hello));
        assert!(!dict.is_filler(sil_entry.real_wid));
    }

    #[test]
    fn all_filler_prefix_yields_none() {
        let (_, dict) = toy();
        let mut t = table(&dict);
        t.mark_frame(0);
        t.save(&dict, 0, dict.sil_wid(), -10, NO_BP, 0);
        assert_eq!(t.entry(0).real_wid, NO_WORD);
        assert_eq!(t.entry(0).prev_real_wid, NO_WORD);
    }

    #[test]
    fn cap_word_exits_keeps_best() {
        let (_, dict) = toy();
        let mut t = table(&dict);
        let hello = dict.word_id("hello").unwrap();
        let low = dict.word_id("low").unwrap();
        t.mark_frame(0);
        t.save(&dict, 0, dict.start_wid(), 0, NO_BP, 0);
        t.clear_exit(dict.start_wid());
        t.mark_frame(1);
        t.save(&dict, 1, hello, -100, 0, 0);
        t.save(&dict, 1, low, -50, 0, 0);
        t.save(&dict, 1, dict.sil_wid(), -10, 0, 0);
        t.cap_word_exits(&dict, 1, 1);

        let valid: Vec<WordId> = t.frame_range(1)
            .filter(|&i| t.entry(i as i32).valid)
            .map(|i| t.entry(i as i32).wid)
            .collect();
        // the best real word and the single best filler survive
        assert!(valid.contains(&low));
        assert!(valid.contains(&dict.sil_wid()));
        assert!(!valid.contains(&hello));
    }

    #[test]
    fn seg_scores_decompose() {
        let (_, dict) = toy();
        let mut lm = NGramModel::new();
        lm.add_unigram(dict.word_id("hello").unwrap(), 0.5);
        let lm = CachedLm::new(lm, 1.0, 1.0);

        let mut t = table(&dict);
        let hello = dict.word_id("hello").unwrap();
        t.mark_frame(0);
        t.save(&dict, 0, dict.start_wid(), 0, NO_BP, 0);
        t.clear_exit(dict.start_wid());
        t.mark_frame(5);
        t.save(&dict, 5, hello, -500, 0, 0);
        t.mark_frame(6);
        t.compute_seg_scores(&dict, &lm, 1.0, -77, -99, );

        let e = t.entry(1);
        assert_eq!(e.score, e.ascr + e.lscr + t.rc_score(t.entry(0), &dict, dict.entry(hello).first_ci()));
    }
}
