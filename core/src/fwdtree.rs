//! First-pass frame-synchronous beam search over the lexical tree.
//!
//! Per frame: evaluate all live channels against the senone scores, derive
//! a dynamic beam when the evaluated population exceeds `maxhmmpf`, prune
//! and propagate root and interior channels, run the last-phone transition
//! (where the LM score for each candidate word is resolved against every
//! valid exit of its predecessor frame and cached per start frame), record
//! word exits, cap them, and finally hypothesize successor words from the
//! per-right-context best exits.

use crate::decoder::{SearchCtx, SearchStats};
use crate::lextree::NO_CHAN;
use crate::lm::LanguageModel;
use crate::senone::SenoneActiveSet;
use crate::{logs, FrameId, PhoneId, WordId, NO_BP};
use std::mem;
use tracing::{debug, info, warn};

/// Word entering its last phone this frame, awaiting its LM transition.
#[derive(Debug, Clone, Copy)]
struct LastPhnCand {
    wid: WordId,
    score: i32,
    bp: i32,
    /// Next candidate sharing the same predecessor end frame.
    next: i32,
}

/// Bucket of candidates whose best predecessor ends at `bp_ef`.
#[derive(Debug, Clone, Copy)]
struct CandSf {
    bp_ef: FrameId,
    cand: i32,
}

/// Cached best LM transition for a `(word, start-frame)` instance.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LastLTrans {
    pub sf: FrameId,
    pub dscr: i32,
    pub bp: i32,
}

/// Best word exit this frame for one right-context CI phone.
#[derive(Debug, Clone, Copy)]
struct BestBpRc {
    score: i32,
    path: i32,
    /// Last CI phone of the exiting word (left context for the successor).
    lc: PhoneId,
}

pub struct FwdtreeSearch {
    active_chan: [Vec<i32>; 2],
    active_word: [Vec<WordId>; 2],
    word_active: Vec<bool>,
    cand: Vec<LastPhnCand>,
    cand_sf: Vec<CandSf>,
    pub(crate) last_ltrans: Vec<LastLTrans>,
    bestbp_rc: Vec<BestBpRc>,
    pub best_score: i32,
    last_phone_best: i32,
    dyn_beam: i32,
    n_root_eval_frame: u64,
    n_nonroot_eval_frame: u64,
    pub cur_frame: FrameId,
    pub last_frame: FrameId,
    pub renormalized: bool,
    pub stats: SearchStats,
}

impl FwdtreeSearch {
    pub fn new(n_words: usize, n_ci: usize) -> Self {
        Self {
            active_chan: [Vec::new(), Vec::new()],
            active_word: [Vec::new(), Vec::new()],
            word_active: vec![false; n_words],
            cand: Vec::new(),
            cand_sf: Vec::new(),
            last_ltrans: vec![
                LastLTrans {
                    sf: -1,
                    dscr: i32::MIN,
                    bp: NO_BP
                };
                n_words
            ],
            bestbp_rc: vec![
                BestBpRc {
                    score: logs::WORST_SCORE,
                    path: NO_BP,
                    lc: 0
                };
                n_ci
            ],
            best_score: 0,
            last_phone_best: logs::WORST_SCORE,
            dyn_beam: 0,
            n_root_eval_frame: 0,
            n_nonroot_eval_frame: 0,
            cur_frame: 0,
            last_frame: 0,
            renormalized: false,
            stats: SearchStats::default(),
        }
    }

    /// Reset per-utterance state and seed the table with `<s>` (plus up to
    /// two preloaded context words, so the first decoded word sees the
    /// right trigram history).
    pub fn start_utt<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>, context: [WordId; 2]) {
        self.stats = SearchStats::default();
        ctx.hist.reset();
        for l in &mut self.active_chan {
            l.clear();
        }
        for l in &mut self.active_word {
            l.clear();
        }
        self.word_active.iter_mut().for_each(|b| *b = false);
        self.cand.clear();
        self.cand_sf.clear();
        for lt in &mut self.last_ltrans {
            lt.sf = -1;
        }
        self.best_score = 0;
        self.last_phone_best = logs::WORST_SCORE;
        self.renormalized = false;
        self.cur_frame = 0;
        self.last_frame = 0;

        // Previous passes may have left state behind in the permanently
        // allocated channels.
        for r in ctx.tree.roots.iter_mut() {
            r.hmm.clear();
        }
        for c in ctx.tree.single_chan.iter_mut() {
            c.hmm.clear();
        }
        for w in 0..ctx.dict.n_words() as WordId {
            if ctx.tree.single_index(w).is_none() && ctx.tree.word_chan[w as usize] != NO_CHAN {
                ctx.tree.free_rc_channels(w);
            }
        }

        let start = ctx.dict.start_wid();
        if context[0] < 0 {
            let chan = ctx.tree.single_of_mut(start);
            chan.hmm.clear();
            chan.hmm.enter(0, NO_BP, 0);
            return;
        }

        // Simulate the context words as table entries in frames 0..=2.
        ctx.hist.mark_frame(0);
        ctx.hist.save(ctx.dict, 0, start, 0, NO_BP, 0);
        ctx.hist.clear_exit(start);
        self.cur_frame = 1;

        let de = ctx.dict.entry(context[0]);
        let rcsize = if de.mpx && de.len() > 1 {
            ctx.dict.rc_count(de.r_diph)
        } else {
            1
        };
        let mut lscr = ctx
            .lm
            .bg_score(ctx.dict.base_wid(context[0]), ctx.dict.base_wid(start));
        ctx.hist.mark_frame(1);
        for rc in 0..rcsize {
            ctx.hist.save(ctx.dict, 1, context[0], lscr, 0, rc);
        }
        ctx.hist.clear_exit(context[0]);
        self.cur_frame = 2;

        if context[1] >= 0 {
            let de = ctx.dict.entry(context[1]);
            let rcsize = if de.mpx && de.len() > 1 {
                ctx.dict.rc_count(de.r_diph)
            } else {
                1
            };
            lscr += ctx.lm.tg_score(
                ctx.dict.base_wid(context[1]),
                ctx.dict.base_wid(context[0]),
                ctx.dict.base_wid(start),
            );
            ctx.hist.mark_frame(2);
            for rc in 0..rcsize {
                ctx.hist.save(ctx.dict, 2, context[1], lscr, 1, rc);
            }
            ctx.hist.clear_exit(context[1]);
            self.cur_frame = 3;
        }

        // Resume the search from silence following the context.
        let last = ctx.hist.len() as i32 - 1;
        let score = ctx.hist.entry(last).score;
        let frame = self.cur_frame;
        let chan = ctx.tree.single_of_mut(ctx.dict.sil_wid());
        chan.hmm.clear();
        chan.hmm.enter(score, last, frame);
    }

    /// Mark the senones needed by every channel live in the current frame.
    pub fn compute_active(
        &self,
        tree: &crate::lextree::LexTree,
        am: &crate::amodel::AcousticModel,
        set: &mut SenoneActiveSet,
    ) {
        let cf = self.cur_frame;
        set.clear();
        for r in &tree.roots {
            if r.hmm.frame() == cf {
                set.mark_hmm(&r.hmm, am);
            }
        }
        for &c in &self.active_chan[(cf & 1) as usize] {
            set.mark_hmm(&tree.arena.get(c).hmm, am);
        }
        for &w in &self.active_word[(cf & 1) as usize] {
            let mut c = tree.word_chan[w as usize];
            while c != NO_CHAN {
                let chan = tree.arena.get(c);
                set.mark_hmm(&chan.hmm, am);
                c = chan.next;
            }
        }
        for chan in &tree.single_chan {
            if chan.hmm.frame() == cf {
                set.mark_hmm(&chan.hmm, am);
            }
        }
        set.flags_to_list();
    }

    /// Integrate one frame of senone scores. Returns the frame just
    /// processed, or `None` when the utterance hit the frame cap.
    pub fn frame<L: LanguageModel>(
        &mut self,
        ctx: &mut SearchCtx<'_, L>,
        senscr: &[i32],
    ) -> Option<FrameId> {
        let cf = self.cur_frame;
        if cf as usize >= logs::MAX_FRAMES - 1 {
            warn!("frame cap exceeded; ignoring rest of utterance");
            return None;
        }

        ctx.hist.mark_frame(cf as usize);

        if self.best_score + 2 * ctx.beams.main < logs::WORST_SCORE {
            info!(frame = cf, best = self.best_score, "renormalizing scores");
            self.renormalize(ctx, self.best_score);
        }

        self.evaluate(ctx, senscr);
        self.prune(ctx);

        let maxwpf = ctx.cfg.maxwpf;
        if maxwpf != -1 && (maxwpf as usize) < ctx.dict.n_words() {
            ctx.hist.cap_word_exits(ctx.dict, cf as usize, maxwpf);
        }

        if !ctx.hist.frame_range(cf as usize).is_empty() {
            self.word_transition(ctx);
        }

        // Stale scores must not leak into the next frame.
        for r in ctx.tree.roots.iter_mut() {
            if r.hmm.frame() == cf {
                r.hmm.clear_scores();
            }
        }
        for c in ctx.tree.single_chan.iter_mut() {
            if c.hmm.frame() == cf {
                c.hmm.clear_scores();
            }
        }

        self.active_chan[(cf & 1) as usize].clear();
        self.active_word[(cf & 1) as usize].clear();

        self.cur_frame = cf + 1;
        Some(cf)
    }

    fn evaluate<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>, senscr: &[i32]) {
        self.best_score = logs::WORST_SCORE;

        let bs = self.eval_root_chan(ctx, senscr);
        self.best_score = self.best_score.max(bs);
        let bs = self.eval_nonroot_chan(ctx, senscr);
        self.best_score = self.best_score.max(bs);
        let bs = self.eval_word_chan(ctx, senscr);
        self.best_score = self.best_score.max(bs);
        self.last_phone_best = bs;

        debug!(
            frame = self.cur_frame,
            best = self.best_score,
            "channels evaluated"
        );
    }

    fn eval_root_chan<L: LanguageModel>(
        &mut self,
        ctx: &mut SearchCtx<'_, L>,
        senscr: &[i32],
    ) -> i32 {
        let cf = self.cur_frame;
        let mut best = logs::WORST_SCORE;
        let mut k = 0;
        for r in ctx.tree.roots.iter_mut() {
            if r.hmm.frame() == cf {
                let s = r.hmm.eval(ctx.am, senscr);
                best = best.max(s);
                k += 1;
            }
        }
        self.n_root_eval_frame = k;
        self.stats.n_root_chan_eval += k;
        best
    }

    fn eval_nonroot_chan<L: LanguageModel>(
        &mut self,
        ctx: &mut SearchCtx<'_, L>,
        senscr: &[i32],
    ) -> i32 {
        let cf = self.cur_frame;
        let mut best = logs::WORST_SCORE;
        let list = &self.active_chan[(cf & 1) as usize];
        for &c in list {
            let chan = ctx.tree.arena.get_mut(c);
            debug_assert_eq!(chan.hmm.frame(), cf);
            let s = chan.hmm.eval(ctx.am, senscr);
            best = best.max(s);
        }
        self.n_nonroot_eval_frame = list.len() as u64;
        self.stats.n_nonroot_chan_eval += list.len() as u64;
        best
    }

    fn eval_word_chan<L: LanguageModel>(
        &mut self,
        ctx: &mut SearchCtx<'_, L>,
        senscr: &[i32],
    ) -> i32 {
        let cf = self.cur_frame;
        let mut best = logs::WORST_SCORE;
        let mut k = 0u64;

        let words = mem::take(&mut self.active_word[(cf & 1) as usize]);
        for &w in &words {
            debug_assert!(self.word_active[w as usize]);
            self.word_active[w as usize] = false;
            let mut c = ctx.tree.word_chan[w as usize];
            debug_assert!(c != NO_CHAN);
            while c != NO_CHAN {
                let chan = ctx.tree.arena.get_mut(c);
                debug_assert_eq!(chan.hmm.frame(), cf);
                let s = chan.hmm.eval(ctx.am, senscr);
                best = best.max(s);
                k += 1;
                c = chan.next;
            }
        }
        self.stats.n_word_lastchan_eval += words.len() as u64;
        self.active_word[(cf & 1) as usize] = words;

        let finish = ctx.dict.finish_wid();
        for i in 0..ctx.tree.single_chan.len() {
            let w = ctx.tree.single_wid[i];
            let chan = &mut ctx.tree.single_chan[i];
            if chan.hmm.frame() < cf {
                continue;
            }
            let s = chan.hmm.eval(ctx.am, senscr);
            if w != finish {
                best = best.max(s);
            }
            k += 1;
        }

        self.stats.n_last_chan_eval += k;
        best
    }

    fn prune<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) {
        self.cand.clear();
        self.set_dynamic_beam(ctx);
        self.prune_root_chan(ctx);
        self.prune_nonroot_chan(ctx);
        self.last_phone_transition(ctx);
        self.prune_word_chan(ctx);
    }

    /// Histogram pruning: when more channels were evaluated than
    /// `maxhmmpf`, tighten the beam to the bin edge that keeps roughly that
    /// many.
    fn set_dynamic_beam<L: LanguageModel>(&mut self, ctx: &SearchCtx<'_, L>) {
        self.dyn_beam = ctx.beams.main;
        let maxhmmpf = ctx.cfg.maxhmmpf;
        if maxhmmpf == -1
            || self.n_root_eval_frame + self.n_nonroot_eval_frame <= maxhmmpf as u64
        {
            return;
        }

        let cf = self.cur_frame;
        let bw = (-ctx.beams.main / 256).max(1);
        let mut bins = [0u32; 256];
        for r in &ctx.tree.roots {
            if r.hmm.frame() != cf {
                continue;
            }
            let b = (((self.best_score - r.hmm.bestscore()) / bw) as usize).min(255);
            bins[b] += 1;
        }
        for &c in &self.active_chan[(cf & 1) as usize] {
            let chan = ctx.tree.arena.get(c);
            let b = (((self.best_score - chan.hmm.bestscore()) / bw) as usize).min(255);
            bins[b] += 1;
        }

        let mut nhmms = 0u32;
        let mut edge = 255usize;
        for (i, &n) in bins.iter().enumerate() {
            nhmms += n;
            if nhmms > maxhmmpf as u32 {
                edge = i;
                break;
            }
        }
        self.dyn_beam = -((edge as i32) * bw);
        debug!(frame = cf, beam = self.dyn_beam, "dynamic beam set");
    }

    fn prune_root_chan<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) {
        let cf = self.cur_frame;
        let nf = cf + 1;
        let thresh = self.best_score + self.dyn_beam;
        let newphone_thresh = self.best_score + self.dyn_beam.max(ctx.beams.pbeam);
        let lastphn_thresh = self.best_score + self.dyn_beam.max(ctx.beams.lpbeam);
        let pip = ctx.beams.pip;

        let mut nacl = mem::take(&mut self.active_chan[(nf & 1) as usize]);
        for ri in 0..ctx.tree.roots.len() {
            if ctx.tree.roots[ri].hmm.frame() < cf {
                continue;
            }
            if ctx.tree.roots[ri].hmm.bestscore() <= thresh {
                continue;
            }
            ctx.tree.roots[ri].hmm.set_frame(nf);

            if ctx.cfg.skipalt && (cf & 1) == 1 {
                continue;
            }

            let newphone_score = ctx.tree.roots[ri].hmm.out_score() + pip;
            let out_hist = ctx.tree.roots[ri].hmm.out_history();
            if newphone_score <= newphone_thresh {
                continue;
            }

            let mut c = ctx.tree.roots[ri].next;
            while c != NO_CHAN {
                let chan = ctx.tree.arena.get_mut(c);
                let alt = chan.alt;
                if chan.hmm.frame() < cf || chan.hmm.in_score() < newphone_score {
                    chan.hmm.enter(newphone_score, out_hist, nf);
                    nacl.push(c);
                }
                c = alt;
            }

            if newphone_score > lastphn_thresh {
                let mut w = ctx.tree.roots[ri].penult_wid;
                while w >= 0 {
                    self.cand.push(LastPhnCand {
                        wid: w,
                        score: newphone_score - ctx.beams.nwpen,
                        bp: out_hist,
                        next: -1,
                    });
                    w = ctx.tree.homophone[w as usize];
                }
            }
        }
        self.active_chan[(nf & 1) as usize] = nacl;
    }

    fn prune_nonroot_chan<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) {
        let cf = self.cur_frame;
        let nf = cf + 1;
        let thresh = self.best_score + self.dyn_beam;
        let newphone_thresh = self.best_score + self.dyn_beam.max(ctx.beams.pbeam);
        let lastphn_thresh = self.best_score + self.dyn_beam.max(ctx.beams.lpbeam);
        let pip = ctx.beams.pip;

        let cur = mem::take(&mut self.active_chan[(cf & 1) as usize]);
        let mut nacl = mem::take(&mut self.active_chan[(nf & 1) as usize]);

        for &c in &cur {
            debug_assert!(ctx.tree.arena.get(c).hmm.frame() >= cf);
            let bestscore = ctx.tree.arena.get(c).hmm.bestscore();
            if bestscore > thresh {
                {
                    let chan = ctx.tree.arena.get_mut(c);
                    if chan.hmm.frame() != nf {
                        chan.hmm.set_frame(nf);
                        nacl.push(c);
                    }
                }

                if ctx.cfg.skipalt && (cf & 1) == 1 {
                    continue;
                }

                let (newphone_score, out_hist, first_child, penult) = {
                    let chan = ctx.tree.arena.get(c);
                    (
                        chan.hmm.out_score() + pip,
                        chan.hmm.out_history(),
                        chan.next,
                        chan.info,
                    )
                };
                if newphone_score <= newphone_thresh {
                    continue;
                }

                let mut n = first_child;
                while n != NO_CHAN {
                    let next_chan = ctx.tree.arena.get_mut(n);
                    let alt = next_chan.alt;
                    if next_chan.hmm.frame() < cf || next_chan.hmm.in_score() < newphone_score {
                        if next_chan.hmm.frame() != nf {
                            nacl.push(n);
                        }
                        next_chan.hmm.enter(newphone_score, out_hist, nf);
                    }
                    n = alt;
                }

                if newphone_score > lastphn_thresh {
                    let mut w = penult;
                    while w >= 0 {
                        self.cand.push(LastPhnCand {
                            wid: w,
                            score: newphone_score - ctx.beams.nwpen,
                            bp: out_hist,
                            next: -1,
                        });
                        w = ctx.tree.homophone[w as usize];
                    }
                }
            } else if ctx.tree.arena.get(c).hmm.frame() != nf {
                ctx.tree.arena.get_mut(c).hmm.clear_scores();
            }
        }

        self.active_chan[(cf & 1) as usize] = cur;
        self.active_chan[(nf & 1) as usize] = nacl;
    }

    /// Resolve the LM transition for every candidate word entering its last
    /// phone. Candidates are bucketed by predecessor end frame so each
    /// frame's table entries are scanned once; the best `(delta, bp)` per
    /// `(word, start-frame)` is cached in `last_ltrans`.
    fn last_phone_transition<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) {
        let cf = self.cur_frame;
        let nf = cf + 1;
        self.stats.n_lastphn_cand += self.cand.len() as u64;
        self.cand_sf.clear();

        // Bucket new <word, start-frame> instances by predecessor end frame.
        for i in 0..self.cand.len() {
            let bp = self.cand[i].bp;
            let wid = self.cand[i].wid;
            let (bp_frame, start_score) = {
                let bpe = ctx.hist.entry(bp);
                let ciph0 = ctx.dict.entry(wid).first_ci();
                (bpe.frame, ctx.hist.rc_score(bpe, ctx.dict, ciph0))
            };
            // Leave only the word-interior score on the candidate.
            self.cand[i].score -= start_score;

            let sf = bp_frame + 1;
            if self.last_ltrans[wid as usize].sf != sf {
                let j = match self.cand_sf.iter().position(|c| c.bp_ef == bp_frame) {
                    Some(j) => {
                        self.cand[i].next = self.cand_sf[j].cand;
                        j
                    }
                    None => {
                        self.cand[i].next = -1;
                        self.cand_sf.push(CandSf {
                            bp_ef: bp_frame,
                            cand: -1,
                        });
                        self.cand_sf.len() - 1
                    }
                };
                self.cand_sf[j].cand = i as i32;

                self.last_ltrans[wid as usize].dscr = logs::WORST_SCORE;
                self.last_ltrans[wid as usize].sf = sf;
            }
        }

        // For each bucket, scan that frame's exits once and keep the best
        // (right-context score + trigram) per candidate word.
        for si in 0..self.cand_sf.len() {
            let bp_ef = self.cand_sf[si].bp_ef;
            let range = ctx.hist.frame_range(bp_ef as usize);
            for b in range {
                let (valid, real, prev_real) = {
                    let e = ctx.hist.entry(b as i32);
                    (e.valid, e.real_wid, e.prev_real_wid)
                };
                if !valid {
                    continue;
                }
                let mut j = self.cand_sf[si].cand;
                while j >= 0 {
                    let wid = self.cand[j as usize].wid;
                    let de = ctx.dict.entry(wid);
                    let rc = {
                        let e = ctx.hist.entry(b as i32);
                        ctx.hist.rc_score(e, ctx.dict, de.first_ci())
                    };
                    let dscr = rc + ctx.lm.tg_score(de.base_wid, real, prev_real);
                    if self.last_ltrans[wid as usize].dscr < dscr {
                        self.last_ltrans[wid as usize].dscr = dscr;
                        self.last_ltrans[wid as usize].bp = b as i32;
                    }
                    j = self.cand[j as usize].next;
                }
            }
        }

        // Fold the cached transitions back into the candidates.
        let mut best = self.last_phone_best;
        for c in &mut self.cand {
            let lt = &self.last_ltrans[c.wid as usize];
            c.score = c.score.saturating_add(lt.dscr);
            c.bp = lt.bp;
            best = best.max(c.score);
        }
        self.last_phone_best = best;

        // Allocate and enter last-phone channels for surviving candidates.
        let thresh = best + ctx.beams.lponlybeam;
        let mut nawl = mem::take(&mut self.active_word[(nf & 1) as usize]);
        for i in 0..self.cand.len() {
            let c = self.cand[i];
            if c.score <= thresh {
                continue;
            }
            ctx.tree.alloc_rc_channels(ctx.dict, c.wid);
            let mut entered = 0;
            let mut ch = ctx.tree.word_chan[c.wid as usize];
            while ch != NO_CHAN {
                let chan = ctx.tree.arena.get_mut(ch);
                let next = chan.next;
                if chan.hmm.frame() < cf || chan.hmm.in_score() < c.score {
                    debug_assert!(chan.hmm.frame() != nf);
                    chan.hmm.enter(c.score, c.bp, nf);
                    entered += 1;
                }
                ch = next;
            }
            if entered > 0 && !self.word_active[c.wid as usize] {
                debug_assert!(ctx.dict.entry(c.wid).len() > 1);
                nawl.push(c.wid);
                self.word_active[c.wid as usize] = true;
            }
        }
        self.active_word[(nf & 1) as usize] = nawl;
    }

    fn prune_word_chan<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) {
        let cf = self.cur_frame;
        let nf = cf + 1;
        let newword_thresh = self.last_phone_best + self.dyn_beam.max(ctx.beams.wbeam);
        let lastphn_thresh = self.last_phone_best + self.dyn_beam.max(ctx.beams.lponlybeam);

        let awl = mem::take(&mut self.active_word[(cf & 1) as usize]);
        let mut nawl = mem::take(&mut self.active_word[(nf & 1) as usize]);

        for &w in &awl {
            let mut kept = 0;
            let mut prev = NO_CHAN;
            let mut ch = ctx.tree.word_chan[w as usize];
            while ch != NO_CHAN {
                let next = ctx.tree.arena.get(ch).next;
                debug_assert!(ctx.tree.arena.get(ch).hmm.frame() >= cf);

                let bestscore = ctx.tree.arena.get(ch).hmm.bestscore();
                if bestscore > lastphn_thresh {
                    let (out, out_hist, rc_id) = {
                        let chan = ctx.tree.arena.get_mut(ch);
                        chan.hmm.set_frame(nf);
                        (chan.hmm.out_score(), chan.hmm.out_history(), chan.info)
                    };
                    kept += 1;
                    prev = ch;

                    if out > newword_thresh {
                        ctx.hist.save(ctx.dict, cf, w, out, out_hist, rc_id as usize);
                    }
                } else if ctx.tree.arena.get(ch).hmm.frame() == nf {
                    prev = ch;
                } else {
                    ctx.tree.arena.free(ch);
                    if prev == NO_CHAN {
                        ctx.tree.word_chan[w as usize] = next;
                    } else {
                        ctx.tree.arena.get_mut(prev).next = next;
                    }
                }
                ch = next;
            }
            if kept > 0 && !self.word_active[w as usize] {
                debug_assert!(ctx.dict.entry(w).len() > 1);
                nawl.push(w);
                self.word_active[w as usize] = true;
            }
        }

        self.active_word[(cf & 1) as usize] = awl;
        self.active_word[(nf & 1) as usize] = nawl;

        // Permanently allocated single-phone channels.
        for i in 0..ctx.tree.single_chan.len() {
            let w = ctx.tree.single_wid[i];
            let chan = &mut ctx.tree.single_chan[i];
            if chan.hmm.frame() < cf {
                continue;
            }
            if chan.hmm.bestscore() > lastphn_thresh {
                chan.hmm.set_frame(nf);
                let out = chan.hmm.out_score();
                let out_hist = chan.hmm.out_history();
                if out > newword_thresh {
                    ctx.hist.save(ctx.dict, cf, w, out, out_hist, 0);
                }
            }
        }
    }

    /// Cross-word transitions out of this frame's exits: tree roots get the
    /// per-right-context best exit (with the multiplex left-context ssid
    /// injected), in-LM single-phone words redo the transition with the
    /// trigram included, and fillers chain off the silence exit.
    fn word_transition<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) {
        let cf = self.cur_frame;
        let nf = cf + 1;
        let n_ci = ctx.dict.n_ci();

        for b in self.bestbp_rc.iter_mut() {
            b.score = logs::WORST_SCORE;
        }

        let mut k = 0;
        let range = ctx.hist.frame_range(cf as usize);
        for b in range.clone() {
            let wid = ctx.hist.entry(b as i32).wid;
            ctx.hist.clear_exit(wid);
            if wid == ctx.dict.finish_wid() {
                continue;
            }
            k += 1;

            let de = ctx.dict.entry(wid);
            let last_ciph = de.last_ci();
            let (s_idx, r_diph) = {
                let e = ctx.hist.entry(b as i32);
                (e.s_idx, e.r_diph)
            };
            let perm = ctx.dict.rc_perm(r_diph);
            for rc in 0..n_ci {
                let score = ctx.hist.stack_at(s_idx + perm[rc]);
                if score > self.bestbp_rc[rc].score {
                    self.bestbp_rc[rc] = BestBpRc {
                        score,
                        path: b as i32,
                        lc: last_ciph,
                    };
                }
            }
        }
        if k == 0 {
            return;
        }

        let thresh = self.best_score + self.dyn_beam;
        let pip = ctx.beams.pip;

        // Multi-phone words enter the tree roots.
        for root in ctx.tree.roots.iter_mut() {
            let bb = self.bestbp_rc[root.ciphone as usize];
            let newscore = bb.score + ctx.beams.nwpen + pip;
            if newscore > thresh
                && (root.hmm.frame() < cf || root.hmm.in_score() < newscore)
                && root.hmm.enter(newscore, bb.path, nf)
                && root.hmm.is_mpx()
            {
                let ssid = ctx.dict.left_context_ssid(root.diphone, bb.lc);
                root.hmm.set_entry_ssid(ssid);
            }
        }

        // Single-phone in-LM words need the trigram, so the per-CI best exit
        // is not sufficient; rescan this frame's exits per word.
        for i in 0..ctx.tree.n_single_lm {
            let w = ctx.tree.single_wid[i];
            self.last_ltrans[w as usize].dscr = i32::MIN;
        }
        for b in range.clone() {
            let (valid, s_idx, r_diph, real, prev_real) = {
                let e = ctx.hist.entry(b as i32);
                (e.valid, e.s_idx, e.r_diph, e.real_wid, e.prev_real_wid)
            };
            if !valid {
                continue;
            }
            let perm = ctx.dict.rc_perm(r_diph).to_vec();
            for i in 0..ctx.tree.n_single_lm {
                let w = ctx.tree.single_wid[i];
                let de = ctx.dict.entry(w);
                let mut newscore = ctx.hist.stack_at(s_idx + perm[de.first_ci() as usize]);
                newscore = newscore.saturating_add(ctx.lm.tg_score(de.base_wid, real, prev_real));
                if self.last_ltrans[w as usize].dscr < newscore {
                    self.last_ltrans[w as usize].dscr = newscore;
                    self.last_ltrans[w as usize].bp = b as i32;
                }
            }
        }
        for i in 0..ctx.tree.n_single_lm {
            let w = ctx.tree.single_wid[i];
            let lt = self.last_ltrans[w as usize];
            let newscore = lt.dscr.saturating_add(pip);
            if newscore <= thresh {
                continue;
            }
            let prev_last_ci = ctx.dict.entry(ctx.hist.entry(lt.bp).wid).last_ci();
            let chan = &mut ctx.tree.single_chan[i];
            if (chan.hmm.frame() < cf || chan.hmm.in_score() < newscore)
                && chan.hmm.enter(newscore, lt.bp, nf)
                && chan.hmm.is_mpx()
            {
                let ssid = ctx.dict.left_context_ssid(chan.diphone, prev_last_ci);
                chan.hmm.set_entry_ssid(ssid);
            }
        }

        // Silence and noise fillers ride the best exit into SIL.
        let bb = self.bestbp_rc[ctx.am.sil_phone() as usize];
        if bb.score > logs::WORST_SCORE {
            let newscore = bb.score + ctx.beams.silpen + pip;
            if newscore > thresh {
                let chan = ctx.tree.single_of_mut(ctx.dict.sil_wid());
                if chan.hmm.frame() < cf || chan.hmm.in_score() < newscore {
                    chan.hmm.enter(newscore, bb.path, nf);
                }
            }
            let newscore = bb.score + ctx.beams.fillpen + pip;
            if newscore > thresh {
                for i in 0..ctx.tree.single_chan.len() {
                    let w = ctx.tree.single_wid[i];
                    if w <= ctx.dict.sil_wid() {
                        continue;
                    }
                    let chan = &mut ctx.tree.single_chan[i];
                    if chan.hmm.frame() < cf || chan.hmm.in_score() < newscore {
                        chan.hmm.enter(newscore, bb.path, nf);
                    }
                }
            }
        }
    }

    fn renormalize<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>, norm: i32) {
        let cf = self.cur_frame;
        for r in ctx.tree.roots.iter_mut() {
            if r.hmm.frame() == cf {
                r.hmm.normalize(norm);
            }
        }
        for &c in &self.active_chan[(cf & 1) as usize] {
            ctx.tree.arena.get_mut(c).hmm.normalize(norm);
        }
        for &w in &self.active_word[(cf & 1) as usize] {
            let mut ch = ctx.tree.word_chan[w as usize];
            while ch != NO_CHAN {
                let chan = ctx.tree.arena.get_mut(ch);
                chan.hmm.normalize(norm);
                ch = chan.next;
            }
        }
        for c in ctx.tree.single_chan.iter_mut() {
            if c.hmm.frame() == cf {
                c.hmm.normalize(norm);
            }
        }
        self.renormalized = true;
    }

    /// Deactivate everything lined up for the next frame and settle the
    /// final frame number.
    pub fn finish<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) -> FrameId {
        ctx.hist.mark_frame(self.cur_frame as usize);
        if self.cur_frame > 0 {
            self.cur_frame -= 1;
        }
        self.last_frame = self.cur_frame;

        let nf = self.cur_frame + 1;
        for r in ctx.tree.roots.iter_mut() {
            r.hmm.clear();
        }
        let nacl = mem::take(&mut self.active_chan[(nf & 1) as usize]);
        for &c in &nacl {
            ctx.tree.arena.get_mut(c).hmm.clear();
        }
        let nawl = mem::take(&mut self.active_word[(nf & 1) as usize]);
        for &w in &nawl {
            if ctx.dict.entry(w).len() == 1 {
                continue;
            }
            self.word_active[w as usize] = false;
            if ctx.tree.word_chan[w as usize] != NO_CHAN {
                ctx.tree.free_rc_channels(w);
            }
        }
        self.active_chan[(nf & 1) as usize].clear();
        self.active_word[(nf & 1) as usize].clear();

        info!(
            frames = self.last_frame + 1,
            exits = ctx.hist.len(),
            root_evals = self.stats.n_root_chan_eval,
            nonroot_evals = self.stats.n_nonroot_chan_eval,
            lastphn_cand = self.stats.n_lastphn_cand,
            "tree pass finished"
        );
        self.last_frame
    }
}
