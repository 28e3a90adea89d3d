//! Decoder facade: per-utterance state machine and pass orchestration.
//!
//! One utterance at a time: `start_utt`, one `step`/`frame` call per frame
//! of senone scores, then `finish_utt`, which runs the flat second pass
//! (re-scoring frames through the caller's scorer) and best-path lattice
//! rescoring as configured. All search state lives in this value; separate
//! decoders never share anything.

use crate::amodel::AcousticModel;
use crate::bestpath;
use crate::dict::Dictionary;
use crate::fwdflat::FwdflatSearch;
use crate::fwdtree::FwdtreeSearch;
use crate::history::HistoryTable;
use crate::lattice::{self, Lattice};
use crate::lextree::LexTree;
use crate::lm::{CachedLm, LanguageModel};
use crate::nbest::{self, AltHyp};
use crate::segment::{self, Hypothesis, Segment};
use crate::senone::{SenoneActiveSet, SenoneScorer};
use crate::{Beams, Config, DecodeError, FrameId, WordId, NO_BP, NO_WORD};
use std::mem;
use tracing::{info, warn};

/// Per-utterance search effort counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SearchStats {
    pub n_root_chan_eval: u64,
    pub n_nonroot_chan_eval: u64,
    pub n_last_chan_eval: u64,
    pub n_word_lastchan_eval: u64,
    pub n_lastphn_cand: u64,
    pub n_senone_active: u64,
    pub n_fwdflat_chan: u64,
    pub n_fwdflat_words: u64,
    pub n_fwdflat_word_transition: u64,
}

impl SearchStats {
    fn merge(&self, o: &SearchStats) -> SearchStats {
        SearchStats {
            n_root_chan_eval: self.n_root_chan_eval + o.n_root_chan_eval,
            n_nonroot_chan_eval: self.n_nonroot_chan_eval + o.n_nonroot_chan_eval,
            n_last_chan_eval: self.n_last_chan_eval + o.n_last_chan_eval,
            n_word_lastchan_eval: self.n_word_lastchan_eval + o.n_word_lastchan_eval,
            n_lastphn_cand: self.n_lastphn_cand + o.n_lastphn_cand,
            n_senone_active: self.n_senone_active + o.n_senone_active,
            n_fwdflat_chan: self.n_fwdflat_chan + o.n_fwdflat_chan,
            n_fwdflat_words: self.n_fwdflat_words + o.n_fwdflat_words,
            n_fwdflat_word_transition: self.n_fwdflat_word_transition
                + o.n_fwdflat_word_transition,
        }
    }
}

/// Borrowed view of the decoder's shared resources handed to the search
/// passes.
pub struct SearchCtx<'a, L: LanguageModel> {
    pub cfg: &'a Config,
    pub beams: &'a Beams,
    pub am: &'a AcousticModel,
    pub dict: &'a Dictionary,
    pub lm: &'a CachedLm<L>,
    pub hist: &'a mut HistoryTable,
    pub tree: &'a mut LexTree,
}

macro_rules! search_ctx {
    ($s:expr) => {
        SearchCtx {
            cfg: &$s.cfg,
            beams: &$s.beams,
            am: &$s.am,
            dict: &$s.dict,
            lm: &$s.lm,
            hist: &mut $s.hist,
            tree: &mut $s.tree,
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UttState {
    Idle,
    Decoding,
}

pub struct Decoder<L: LanguageModel> {
    cfg: Config,
    beams: Beams,
    am: AcousticModel,
    dict: Dictionary,
    lm: CachedLm<L>,
    tree: LexTree,
    hist: HistoryTable,
    fwdtree: FwdtreeSearch,
    fwdflat: FwdflatSearch,
    active_set: SenoneActiveSet,
    senscr: Vec<i32>,
    /// Per-frame best senone score (diagnostics only).
    topsen: Vec<i32>,
    density: Vec<i32>,
    state: UttState,
    context: [WordId; 2],
    last_frame: FrameId,
    renormalized: bool,
    hyp: Option<Hypothesis>,
    lattice: Option<Lattice>,
    saved_lattice: Option<Lattice>,
}

impl<L: LanguageModel> Decoder<L> {
    pub fn new(
        cfg: Config,
        am: AcousticModel,
        dict: Dictionary,
        lm: L,
    ) -> Result<Self, DecodeError> {
        let beams = Beams::from_config(&cfg)?;
        let lm = CachedLm::new(lm, cfg.lw, cfg.wip);
        let tree = LexTree::build(&dict, &am, Some(&lm));
        let hist = HistoryTable::new(dict.n_words(), cfg.latsize, dict.n_ci());
        let fwdtree = FwdtreeSearch::new(dict.n_words(), dict.n_ci());
        let fwdflat = FwdflatSearch::new(dict.n_words());
        let active_set = SenoneActiveSet::new(am.n_senones());
        let senscr = vec![0; am.n_senones()];
        info!(
            words = dict.n_words(),
            senones = am.n_senones(),
            "decoder initialized"
        );
        Ok(Self {
            cfg,
            beams,
            am,
            dict,
            lm,
            tree,
            hist,
            fwdtree,
            fwdflat,
            active_set,
            senscr,
            topsen: Vec::new(),
            density: Vec::new(),
            state: UttState::Idle,
            context: [NO_WORD; 2],
            last_frame: 0,
            renormalized: false,
            hyp: None,
            lattice: None,
            saved_lattice: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

    pub fn acoustic_model(&self) -> &AcousticModel {
        &self.am
    }

    pub fn lm(&self) -> &CachedLm<L> {
        &self.lm
    }

    /// Switch the active language model; the lexical tree is rebuilt
    /// against the new vocabulary.
    pub fn set_language_model(&mut self, lm: L) -> Result<(), DecodeError> {
        if self.state == UttState::Decoding {
            return Err(DecodeError::InvalidState(
                "cannot switch LM mid-utterance".into(),
            ));
        }
        self.lm = CachedLm::new(lm, self.cfg.lw, self.cfg.wip);
        self.tree = LexTree::build(&self.dict, &self.am, Some(&self.lm));
        Ok(())
    }

    /// Preload up to two context words so the first decoded word sees the
    /// right trigram history. An empty slice clears the context.
    pub fn set_context(&mut self, words: &[&str]) -> Result<(), DecodeError> {
        if words.len() > 2 {
            return Err(DecodeError::Config("at most two context words".into()));
        }
        self.context = [NO_WORD; 2];
        for (i, w) in words.iter().enumerate() {
            self.context[i] = self
                .dict
                .word_id(w)
                .ok_or_else(|| DecodeError::Lexicon(format!("context word {w} not in dictionary")))?;
        }
        Ok(())
    }

    fn n_context(&self) -> usize {
        self.context.iter().filter(|&&w| w >= 0).count()
    }

    pub fn start_utt(&mut self) -> Result<(), DecodeError> {
        if self.state == UttState::Decoding {
            return Err(DecodeError::InvalidState("utterance already open".into()));
        }
        self.hyp = None;
        self.lattice = None;
        self.renormalized = false;
        self.last_frame = 0;
        self.topsen.clear();
        self.density.clear();

        if self.cfg.fwdtree {
            let context = self.context;
            let mut ctx = search_ctx!(self);
            self.fwdtree.start_utt(&mut ctx, context);
        } else {
            let mut ctx = search_ctx!(self);
            self.fwdflat.start_utt(&mut ctx, false, 0);
        }
        self.state = UttState::Decoding;
        Ok(())
    }

    /// Index of the frame the next score vector will be integrated into.
    pub fn current_frame(&self) -> FrameId {
        if self.cfg.fwdtree {
            self.fwdtree.cur_frame
        } else {
            self.fwdflat.cur_frame
        }
    }

    /// Integrate one frame of senone scores (all senones scored).
    pub fn frame(&mut self, senscr: &[i32]) -> Result<(), DecodeError> {
        if self.state != UttState::Decoding {
            return Err(DecodeError::InvalidState("no open utterance".into()));
        }
        if senscr.len() != self.am.n_senones() {
            return Err(DecodeError::InvalidState(format!(
                "score vector has {} entries, model has {} senones",
                senscr.len(),
                self.am.n_senones()
            )));
        }
        self.topsen.push(senscr.iter().copied().max().unwrap_or(0));

        if self.cfg.fwdtree {
            let mut ctx = search_ctx!(self);
            self.fwdtree.frame(&mut ctx, senscr);
        } else {
            let mut ctx = search_ctx!(self);
            self.fwdflat.frame(&mut ctx, senscr);
        }
        Ok(())
    }

    /// Compute the active senone set, obtain scores from the caller's
    /// scorer, and integrate the frame.
    pub fn step(&mut self, scorer: &mut dyn SenoneScorer) -> Result<(), DecodeError> {
        if self.state != UttState::Decoding {
            return Err(DecodeError::InvalidState("no open utterance".into()));
        }
        let frame = self.current_frame() as usize;
        let mut scores = mem::take(&mut self.senscr);
        scores.resize(self.am.n_senones(), 0);

        if self.cfg.compallsen {
            scorer.score(frame, None, &mut scores);
        } else {
            if self.cfg.fwdtree {
                self.fwdtree
                    .compute_active(&self.tree, &self.am, &mut self.active_set);
                self.fwdtree.stats.n_senone_active += self.active_set.list().len() as u64;
            } else {
                self.fwdflat
                    .compute_active(&self.tree, &self.am, &mut self.active_set);
                self.fwdflat.stats.n_senone_active += self.active_set.list().len() as u64;
            }
            scorer.score(frame, Some(self.active_set.list()), &mut scores);
        }

        let r = self.frame(&scores);
        self.senscr = scores;
        r
    }

    /// Close the utterance: finish the running pass, optionally re-decode
    /// with the flat pass (frames are re-scored through `scorer`), then
    /// rescore the lattice best path.
    pub fn finish_utt(
        &mut self,
        mut scorer: Option<&mut dyn SenoneScorer>,
    ) -> Result<(), DecodeError> {
        if self.state != UttState::Decoding {
            return Err(DecodeError::InvalidState("no open utterance".into()));
        }
        self.state = UttState::Idle;

        let mut usable;
        if self.cfg.fwdtree {
            {
                let mut ctx = search_ctx!(self);
                self.last_frame = self.fwdtree.finish(&mut ctx);
            }
            self.renormalized |= self.fwdtree.renormalized;
            usable = self.postprocess(1.0, "fwdtree")?;

            if usable && self.cfg.fwdflat {
                match scorer.as_mut() {
                    Some(scorer) => {
                        let first_pass_frames = self.last_frame + 1;
                        {
                            let last = self.last_frame;
                            let mut ctx = search_ctx!(self);
                            self.fwdflat.start_utt(&mut ctx, true, last);
                        }
                        for f in 0..first_pass_frames {
                            self.fwdflat_step(&mut **scorer, f as usize);
                        }
                        {
                            let mut ctx = search_ctx!(self);
                            self.last_frame = self.fwdflat.finish(&mut ctx);
                        }
                        self.renormalized |= self.fwdflat.renormalized;
                        usable = self.postprocess(self.beams.fwdflat_lw_ratio, "fwdflat")?;
                    }
                    None => {
                        warn!("fwdflat enabled but no scorer supplied; keeping tree-pass result")
                    }
                }
            }
        } else {
            {
                let mut ctx = search_ctx!(self);
                self.last_frame = self.fwdflat.finish(&mut ctx);
            }
            self.renormalized |= self.fwdflat.renormalized;
            usable = self.postprocess(self.beams.fwdflat_lw_ratio, "fwdflat")?;
        }

        if usable && self.cfg.bestpath {
            if self.renormalized {
                warn!("scores were renormalized in a forward pass; skipping bestpath");
            } else {
                self.run_bestpath();
            }
        }
        Ok(())
    }

    fn fwdflat_step(&mut self, scorer: &mut dyn SenoneScorer, frame: usize) {
        let mut scores = mem::take(&mut self.senscr);
        scores.resize(self.am.n_senones(), 0);
        if self.cfg.compallsen {
            scorer.score(frame, None, &mut scores);
        } else {
            self.fwdflat
                .compute_active(&self.tree, &self.am, &mut self.active_set);
            self.fwdflat.stats.n_senone_active += self.active_set.list().len() as u64;
            scorer.score(frame, Some(self.active_set.list()), &mut scores);
        }
        {
            let mut ctx = search_ctx!(self);
            self.fwdflat.frame(&mut ctx, &scores);
        }
        self.senscr = scores;
    }

    /// Find (or synthesize) the terminal exit, compute densities and
    /// segment scores, and store the traced hypothesis. Returns false when
    /// the utterance is unusably short.
    fn postprocess(&mut self, lwf: f32, pass: &str) -> Result<bool, DecodeError> {
        if self.last_frame < 10 {
            warn!(pass, frames = self.last_frame, "utterance too short; ignored");
            self.hyp = Some(Hypothesis::default());
            return Ok(false);
        }

        let finish = self.dict.finish_wid();
        let mut terminal = NO_BP;
        for b in self.hist.frame_range(self.last_frame as usize) {
            if self.hist.entry(b as i32).wid == finish {
                terminal = b as i32;
                break;
            }
        }

        if terminal == NO_BP {
            warn!(pass, "failed to terminate in final state");
            let mut f = self.last_frame;
            while f >= 0 && self.hist.frame_range(f as usize).is_empty() {
                f -= 1;
            }
            if f < 0 {
                warn!(pass, "empty backpointer table");
                self.hyp = Some(Hypothesis::default());
                return Ok(false);
            }

            // Extend the best entry of the last live frame with the </s>
            // trigram.
            let mut best_score = crate::logs::WORST_SCORE;
            let mut best_bp = NO_BP;
            for b in self.hist.frame_range(f as usize) {
                let (score, real, prev_real) = {
                    let e = self.hist.entry(b as i32);
                    (e.score, e.real_wid, e.prev_real_wid)
                };
                let l = (self.lm.tg_score(finish, real, prev_real) as f32 * lwf) as i32;
                if score.saturating_add(l) > best_score {
                    best_score = score.saturating_add(l);
                    best_bp = b as i32;
                }
            }

            let newf = self.last_frame + 1;
            self.hist.mark_frame(newf as usize);
            self.hist
                .save(&self.dict, newf, finish, best_score, best_bp, 0);
            self.hist.clear_exit(finish);
            self.hist.mark_frame(newf as usize + 1);
            self.last_frame = newf;
            terminal = self.hist.len() as i32 - 1;
        }

        lattice::density_from_table(
            &self.hist,
            &self.dict,
            &self.lm,
            self.last_frame,
            &mut self.density,
        );
        self.hist.compute_seg_scores(
            &self.dict,
            &self.lm,
            lwf,
            self.beams.silpen,
            self.beams.fillpen,
        );

        let mut hyp = segment::back_trace(
            &self.hist,
            &self.dict,
            terminal,
            &self.density,
            &self.topsen,
            self.cfg.reportpron,
            self.cfg.backtrace,
        );
        hyp.remove_context(self.n_context());
        info!(
            pass,
            text = %hyp.text(),
            score = hyp.score,
            lscr = hyp.lscr,
            "pass result"
        );
        self.hyp = Some(hyp);
        Ok(true)
    }

    fn run_bestpath(&mut self) {
        let lat = Lattice::build(
            &self.hist,
            &self.dict,
            &self.lm,
            self.last_frame,
            self.beams.silpen,
            self.beams.fillpen,
            self.cfg.reportpron,
        );
        let mut lat = match lat {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "lattice construction failed; keeping forward-pass result");
                return;
            }
        };
        match bestpath::rescore(&mut lat, &self.lm, self.beams.bestpath_lw_ratio) {
            Ok(bp) => {
                let mut hyp = Hypothesis {
                    score: bp.score,
                    n_frames: self.last_frame,
                    ..Default::default()
                };
                for &l in &bp.links {
                    let link = &lat.links[l as usize];
                    let node = &lat.nodes[link.from as usize];
                    hyp.wids.push(node.wid);
                    if self.dict.is_real(node.wid) {
                        let mut latden = 0;
                        let span = link.ef - node.sf + 1;
                        for f in node.sf..=link.ef {
                            if let Some(&d) = self.density.get(f as usize) {
                                latden += d;
                            }
                        }
                        if span > 0 {
                            latden /= span;
                        }
                        hyp.segs.push(Segment {
                            wid: node.wid,
                            word: self.dict.word_str(node.wid).to_string(),
                            sf: node.sf,
                            ef: link.ef,
                            ascr: link.link_scr,
                            lscr: 0,
                            latden,
                        });
                    }
                }
                hyp.wids.push(self.dict.finish_wid());
                hyp.remove_context(self.n_context());
                info!(text = %hyp.text(), score = hyp.score, "bestpath result");
                self.hyp = Some(hyp);
                self.lattice = Some(lat);
            }
            Err(e) => warn!(error = %e, "bestpath failed; keeping forward-pass result"),
        }
    }

    /// Discard the current utterance entirely.
    pub fn abort_utt(&mut self) {
        if self.state == UttState::Decoding {
            if self.cfg.fwdtree {
                let mut ctx = search_ctx!(self);
                self.fwdtree.start_utt(&mut ctx, [NO_WORD; 2]);
            } else {
                let mut ctx = search_ctx!(self);
                self.fwdflat.finish(&mut ctx);
            }
        }
        self.hist.reset();
        self.hyp = None;
        self.lattice = None;
        self.topsen.clear();
        self.density.clear();
        self.state = UttState::Idle;
    }

    /// Final decoded result: (frames processed, hypothesis string).
    pub fn result(&self) -> Option<(FrameId, String)> {
        self.hyp.as_ref().map(|h| (self.last_frame, h.text()))
    }

    /// Per-word segments of the final result.
    pub fn hypothesis(&self) -> Option<&Hypothesis> {
        self.hyp.as_ref()
    }

    /// Best word sequence through the table so far, mid-utterance.
    pub fn partial_result(&self) -> (FrameId, String) {
        let cur = if self.cfg.fwdtree {
            self.fwdtree.cur_frame
        } else {
            self.fwdflat.cur_frame
        };
        let mut f = cur - 1;
        while f >= 0 && self.hist.frame_range(f as usize).is_empty() {
            f -= 1;
        }
        if f < 0 {
            return (cur, String::new());
        }
        let mut best = NO_BP;
        let mut best_score = crate::logs::WORST_SCORE;
        for b in self.hist.frame_range(f as usize) {
            let e = self.hist.entry(b as i32);
            if e.score > best_score {
                best_score = e.score;
                best = b as i32;
            }
        }
        let segs = segment::partial_back_trace(&self.hist, &self.dict, best, self.cfg.reportpron);
        let text = segs
            .iter()
            .map(|s| s.word.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        (cur, text)
    }

    /// The lattice from the latest best-path run, if any.
    pub fn lattice(&self) -> Option<&Lattice> {
        self.lattice.as_ref()
    }

    /// Retain the current lattice for N-best enumeration. Builds one from
    /// the final table if best-path rescoring did not run.
    pub fn save_lattice(&mut self) -> Result<(), DecodeError> {
        let lat = match self.lattice.take() {
            Some(l) => l,
            None => Lattice::build(
                &self.hist,
                &self.dict,
                &self.lm,
                self.last_frame,
                self.beams.silpen,
                self.beams.fillpen,
                self.cfg.reportpron,
            )?,
        };
        self.saved_lattice = Some(lat);
        Ok(())
    }

    /// Up to `n` alternative word sequences between two lattice points.
    /// Requires a prior [`Decoder::save_lattice`].
    pub fn get_alt(
        &self,
        n: usize,
        sf: FrameId,
        ef: FrameId,
        w1: Option<WordId>,
        w2: WordId,
    ) -> Result<Vec<AltHyp>, DecodeError> {
        let lat = self.saved_lattice.as_ref().ok_or(DecodeError::NoLattice)?;
        Ok(nbest::get_alt(
            lat,
            &self.lm,
            self.beams.bestpath_lw_ratio,
            n,
            sf,
            ef,
            w1,
            w2,
        ))
    }

    /// Write the current lattice in the text exchange format.
    pub fn dump_lattice<W: std::io::Write>(&self, w: &mut W) -> Result<(), DecodeError> {
        let lat = self
            .lattice
            .as_ref()
            .or(self.saved_lattice.as_ref())
            .ok_or(DecodeError::NoLattice)?;
        lat.dump(&self.dict, w)
            .map_err(|e| DecodeError::LatticeFormat(format!("dump: {e}")))
    }

    /// Combined effort counters for the utterance.
    pub fn stats(&self) -> SearchStats {
        self.fwdtree.stats.merge(&self.fwdflat.stats)
    }

    /// Whether either forward pass renormalized scores this utterance.
    pub fn renormalized(&self) -> bool {
        self.renormalized
    }

    /// True when a capacity limit was hit and the result may be missing
    /// word exits.
    pub fn incomplete(&self) -> bool {
        self.hist.overflowed()
    }

    /// The word-exit table of the most recent pass (diagnostics).
    pub fn history(&self) -> &HistoryTable {
        &self.hist
    }

    pub fn last_frame(&self) -> FrameId {
        self.last_frame
    }
}
