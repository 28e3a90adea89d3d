//! Time-aligned hypothesis assembly from the exit table.

use crate::dict::Dictionary;
use crate::history::HistoryTable;
use crate::{FrameId, WordId, NO_BP};
use tracing::info;

/// One recognized word with its frame span and score split.
#[derive(Debug, Clone)]
pub struct Segment {
    pub wid: WordId,
    pub word: String,
    pub sf: FrameId,
    pub ef: FrameId,
    pub ascr: i32,
    pub lscr: i32,
    /// Average lattice density over the segment's frames.
    pub latden: i32,
}

/// Full utterance result.
#[derive(Debug, Clone, Default)]
pub struct Hypothesis {
    /// Real-word segments only (no `<s>`, `</s>`, or fillers).
    pub segs: Vec<Segment>,
    /// Every word id on the best path, fillers included.
    pub wids: Vec<WordId>,
    /// Total path score.
    pub score: i32,
    /// Total LM score along the path.
    pub lscr: i32,
    pub n_frames: FrameId,
}

impl Hypothesis {
    /// The hypothesis as a space-separated word string.
    pub fn text(&self) -> String {
        self.segs
            .iter()
            .map(|s| s.word.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Drop preloaded context words from the front of the result.
    pub fn remove_context(&mut self, n_context: usize) {
        if n_context == 0 {
            return;
        }
        self.segs.drain(..n_context.min(self.segs.len()));
        // wids carry the initial <s>; the context words follow it.
        let lo = 1.min(self.wids.len());
        let hi = (lo + n_context).min(self.wids.len());
        self.wids.drain(lo..hi);
    }
}

/// Walk the predecessor chain from a terminal entry and emit per-word
/// segments with score decomposition and density diagnostics.
pub fn back_trace(
    hist: &HistoryTable,
    dict: &Dictionary,
    terminal: i32,
    density: &[i32],
    topsen: &[i32],
    report_pron: bool,
    log_backtrace: bool,
) -> Hypothesis {
    let mut chain = Vec::new();
    let mut bp = terminal;
    while bp != NO_BP {
        debug_assert!(hist.entry(bp).bp < bp, "backpointer chain loops");
        chain.push(bp);
        bp = hist.entry(bp).bp;
    }
    chain.reverse();

    let mut hyp = Hypothesis {
        score: if terminal != NO_BP {
            hist.entry(terminal).score
        } else {
            0
        },
        ..Default::default()
    };

    let mut last_score = 0;
    let mut last_time: FrameId = -1;
    for &idx in &chain {
        let e = hist.entry(idx);
        let raw = e.score - last_score;
        let ascr = raw - e.lscr;
        let sf = last_time + 1;
        let seg_len = e.frame - last_time;

        let mut latden = 0;
        for f in sf..=e.frame {
            if let Some(&d) = density.get(f as usize) {
                latden += d;
            }
        }
        let mut topsen_sum = 0;
        for f in sf..=e.frame {
            if let Some(&t) = topsen.get(f as usize) {
                topsen_sum += t;
            }
        }
        if seg_len > 0 {
            latden /= seg_len;
            topsen_sum /= seg_len;
        }

        hyp.lscr += e.lscr;
        hyp.wids.push(e.wid);

        if log_backtrace {
            info!(
                word = dict.word_str(e.wid),
                sf,
                ef = e.frame,
                ascr,
                lscr = e.lscr,
                bsdiff = topsen_sum,
                latden,
                "backtrace"
            );
        }

        if dict.is_real(e.wid) {
            let wid = if report_pron {
                e.wid
            } else {
                dict.base_wid(e.wid)
            };
            hyp.segs.push(Segment {
                wid,
                word: dict.word_str(wid).to_string(),
                sf,
                ef: e.frame,
                ascr,
                lscr: e.lscr,
                latden,
            });
        }

        last_score = e.score;
        last_time = e.frame;
    }

    hyp.n_frames = last_time;
    hyp
}

/// Lightweight mid-utterance backtrace: words only, no score split.
pub fn partial_back_trace(
    hist: &HistoryTable,
    dict: &Dictionary,
    terminal: i32,
    report_pron: bool,
) -> Vec<Segment> {
    let mut chain = Vec::new();
    let mut bp = terminal;
    while bp != NO_BP {
        chain.push(bp);
        bp = hist.entry(bp).bp;
    }
    chain.reverse();

    let mut segs = Vec::new();
    let mut last_time: FrameId = -1;
    for &idx in &chain {
        let e = hist.entry(idx);
        if dict.is_real(e.wid) {
            let wid = if report_pron {
                e.wid
            } else {
                dict.base_wid(e.wid)
            };
            segs.push(Segment {
                wid,
                word: dict.word_str(wid).to_string(),
                sf: last_time + 1,
                ef: e.frame,
                ascr: 0,
                lscr: 0,
                latden: 0,
            });
        }
        last_time = e.frame;
    }
    segs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amodel::AcousticModelBuilder;
    use crate::dict::DictionaryBuilder;

    fn setup() -> (crate::AcousticModel, Dictionary) {
        let mut b = AcousticModelBuilder::new(3);
        for p in ["SIL", "G", "OW"] {
            b.add_phone(p);
        }
        let am = b.build("SIL").unwrap();
        let mut db = DictionaryBuilder::new();
        db.add_word("go", &["G", "OW"]);
        db.add_word("go(2)", &["G", "OW"]);
        let dict = db.build(&am).unwrap();
        (am, dict)
    }

    fn table(dict: &Dictionary) -> HistoryTable {
        let go = dict.word_id("go").unwrap();
        let mut t = HistoryTable::new(dict.n_words(), 64, dict.n_ci());
        t.mark_frame(0);
        for f in 0..=3 {
            t.mark_frame(f);
        }
        t.save(dict, 3, dict.start_wid(), -30, NO_BP, 0);
        t.clear_exit(dict.start_wid());
        for f in 4..=8 {
            t.mark_frame(f);
        }
        t.save(dict, 8, go, -200, 0, 0);
        t.clear_exit(go);
        t.mark_frame(9);
        t.save(dict, 9, dict.finish_wid(), -260, 1, 0);
        t.clear_exit(dict.finish_wid());
        t.mark_frame(10);
        t
    }

    #[test]
    fn segments_cover_real_words_only() {
        let (_, dict) = setup();
        let t = table(&dict);
        let hyp = back_trace(&t, &dict, 2, &[], &[], false, false);
        assert_eq!(hyp.segs.len(), 1);
        assert_eq!(hyp.segs[0].word, "go");
        assert_eq!(hyp.segs[0].sf, 4);
        assert_eq!(hyp.segs[0].ef, 8);
        assert_eq!(hyp.wids.len(), 3);
        assert_eq!(hyp.score, -260);
        assert_eq!(hyp.text(), "go");
    }

    #[test]
    fn alt_pron_collapses_unless_requested() {
        let (_, dict) = setup();
        let go2 = dict.word_id("go(2)").unwrap();
        let mut t = HistoryTable::new(dict.n_words(), 64, dict.n_ci());
        t.mark_frame(0);
        t.save(&dict, 0, dict.start_wid(), 0, NO_BP, 0);
        t.clear_exit(dict.start_wid());
        t.mark_frame(5);
        t.save(&dict, 5, go2, -100, 0, 0);
        t.mark_frame(6);

        let hyp = back_trace(&t, &dict, 1, &[], &[], false, false);
        assert_eq!(hyp.segs[0].word, "go");
        let hyp = back_trace(&t, &dict, 1, &[], &[], true, false);
        assert_eq!(hyp.segs[0].word, "go(2)");
    }

    #[test]
    fn context_removal_strips_leading_words() {
        let (_, dict) = setup();
        let t = table(&dict);
        let mut hyp = back_trace(&t, &dict, 2, &[], &[], false, false);
        hyp.remove_context(1);
        assert!(hyp.segs.is_empty());
        // <s> survives at the head of the wid list
        assert_eq!(hyp.wids[0], dict.start_wid());
    }
}
