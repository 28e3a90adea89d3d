//! Second-pass flat-lexicon beam search.
//!
//! Words admitted from the first pass's exit table (those with enough
//! end-frame spread) get their own linear HMM chain: one multiplex root,
//! interior channels for middle phones, and the shared per-word last-phone
//! right-context fan-out. Cross-word transitions go word-to-word with the
//! full trigram applied at the exit, scaled by the second-pass language
//! weight ratio, and successor words are restricted to those starting
//! within a window of the current frame. When the tree pass is disabled the
//! word list falls back to the entire LM vocabulary.

use crate::decoder::{SearchCtx, SearchStats};
use crate::hmm::Hmm;
use crate::lextree::{RootChan, NO_CHAN};
use crate::lm::LanguageModel;
use crate::senone::SenoneActiveSet;
use crate::{logs, FrameId, WordId, NO_BP, NO_WORD};
use ahash::AHashMap;
use std::mem;
use tracing::{info, warn};

/// Word instance observed in the first-pass table, bucketed by start frame.
#[derive(Debug, Clone, Copy)]
struct FlatWord {
    wid: WordId,
    fef: FrameId,
    lef: FrameId,
}

/// Per-word linear channel chain: a flat root plus the arena id of the
/// first following channel (interior phone or right-context head).
struct FlatChan {
    root: RootChan,
    chain: i32,
}

pub struct FwdflatSearch {
    wordlist: Vec<WordId>,
    frm_words: Vec<Vec<FlatWord>>,
    expand_list: Vec<WordId>,
    expand_flag: Vec<bool>,
    active_word: [Vec<WordId>; 2],
    word_active: Vec<bool>,
    chans: AHashMap<WordId, FlatChan>,
    pub best_score: i32,
    pub cur_frame: FrameId,
    pub last_frame: FrameId,
    pub renormalized: bool,
    pub stats: SearchStats,
}

impl FwdflatSearch {
    pub fn new(n_words: usize) -> Self {
        Self {
            wordlist: Vec::new(),
            frm_words: Vec::new(),
            expand_list: Vec::new(),
            expand_flag: vec![false; n_words],
            active_word: [Vec::new(), Vec::new()],
            word_active: vec![false; n_words],
            chans: AHashMap::new(),
            best_score: 0,
            cur_frame: 0,
            last_frame: 0,
            renormalized: false,
            stats: SearchStats::default(),
        }
    }

    /// Derive the second-pass word list from the first pass's exits,
    /// dropping words with too narrow an end-frame spread. Finals must end
    /// within one frame of the last frame. Without a first pass, every LM
    /// word is admitted.
    fn build_wordlist<L: LanguageModel>(
        &mut self,
        ctx: &SearchCtx<'_, L>,
        tree_pass_ran: bool,
        last_frame: FrameId,
    ) {
        self.wordlist.clear();
        self.frm_words.clear();

        if !tree_pass_ran {
            for w in 0..ctx.dict.start_wid() {
                if ctx.lm.known_wid(ctx.dict.base_wid(w)) {
                    self.wordlist.push(w);
                }
            }
            return;
        }

        self.frm_words
            .resize_with(last_frame as usize + 1, Vec::new);
        for i in 0..ctx.hist.len() {
            let e = ctx.hist.entry(i as i32);
            let sf = if e.bp < 0 {
                0
            } else {
                ctx.hist.entry(e.bp).frame + 1
            };
            if e.wid >= ctx.dict.sil_wid() || e.wid == ctx.dict.start_wid() {
                continue;
            }
            if sf as usize >= self.frm_words.len() {
                continue;
            }
            let bucket = &mut self.frm_words[sf as usize];
            match bucket.iter_mut().find(|n| n.wid == e.wid) {
                Some(n) => n.lef = e.frame,
                None => bucket.push(FlatWord {
                    wid: e.wid,
                    fef: e.frame,
                    lef: e.frame,
                }),
            }
        }

        let min_ef_width = ctx.cfg.fwdflatefwid;
        let finish = ctx.dict.finish_wid();
        for bucket in &mut self.frm_words {
            bucket.retain(|n| {
                !(n.lef - n.fef < min_ef_width || (n.wid == finish && n.lef < last_frame - 1))
            });
        }

        let mut seen = vec![false; ctx.dict.n_words()];
        for bucket in &self.frm_words {
            for n in bucket {
                if !seen[n.wid as usize] {
                    seen[n.wid as usize] = true;
                    self.wordlist.push(n.wid);
                }
            }
        }
    }

    /// Build the linear channel chain for every admitted multi-phone word.
    fn build_chans<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) {
        for wi in 0..self.wordlist.len() {
            let w = self.wordlist[wi];
            let de = ctx.dict.entry(w).clone();
            if de.len() == 1 {
                continue;
            }
            debug_assert!(de.mpx);
            debug_assert_eq!(ctx.tree.word_chan[w as usize], NO_CHAN);

            let root = RootChan {
                hmm: Hmm::new(true, de.ssids[0], de.ci[0]),
                next: NO_CHAN,
                penult_wid: NO_WORD,
                diphone: de.ssids[0],
                ciphone: de.ci[0],
            };

            // Interior phones, in order.
            let mut head = NO_CHAN;
            let mut prev = NO_CHAN;
            for p in 1..de.len() - 1 {
                let id = ctx.tree.arena.alloc(crate::lextree::Channel {
                    hmm: Hmm::new(false, de.ssids[p], de.ci[p]),
                    next: NO_CHAN,
                    alt: NO_CHAN,
                    ciphone: de.ci[p],
                    info: (p + 1) as i32 - de.len() as i32,
                });
                if prev == NO_CHAN {
                    head = id;
                } else {
                    ctx.tree.arena.get_mut(prev).next = id;
                }
                prev = id;
            }

            // Right-context fan-out, linked after the interiors.
            ctx.tree.alloc_rc_channels(ctx.dict, w);
            let rc_head = ctx.tree.word_chan[w as usize];
            let chain = if prev == NO_CHAN {
                rc_head
            } else {
                ctx.tree.arena.get_mut(prev).next = rc_head;
                head
            };

            self.chans.insert(w, FlatChan { root, chain });
        }
    }

    fn destroy_chans<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) {
        for (w, fc) in self.chans.drain() {
            let mut c = fc.chain;
            while c != NO_CHAN {
                let next = ctx.tree.arena.get(c).next;
                ctx.tree.arena.free(c);
                c = next;
            }
            ctx.tree.word_chan[w as usize] = NO_CHAN;
        }
    }

    pub fn start_utt<L: LanguageModel>(
        &mut self,
        ctx: &mut SearchCtx<'_, L>,
        tree_pass_ran: bool,
        last_frame: FrameId,
    ) {
        self.stats = SearchStats::default();
        self.build_wordlist(ctx, tree_pass_ran, last_frame);
        self.build_chans(ctx);

        ctx.hist.reset();
        self.word_active.iter_mut().for_each(|b| *b = false);
        for l in &mut self.active_word {
            l.clear();
        }
        self.best_score = 0;
        self.renormalized = false;
        self.cur_frame = 0;
        self.last_frame = 0;

        let start = ctx.dict.start_wid();
        {
            let chan = ctx.tree.single_of_mut(start);
            chan.hmm.clear();
            chan.hmm.enter(0, NO_BP, 0);
        }
        self.active_word[0].push(start);

        // Without a first-pass lattice, every admitted word is a permanent
        // expansion candidate.
        self.expand_list.clear();
        self.expand_flag.iter_mut().for_each(|b| *b = false);
        if !tree_pass_ran {
            for &w in &self.wordlist {
                self.expand_list.push(w);
                self.expand_flag[w as usize] = true;
            }
        }

        info!(words = self.wordlist.len(), "flat pass started");
    }

    pub fn compute_active(
        &self,
        tree: &crate::lextree::LexTree,
        am: &crate::amodel::AcousticModel,
        set: &mut SenoneActiveSet,
    ) {
        let cf = self.cur_frame;
        set.clear();
        for &w in &self.active_word[(cf & 1) as usize] {
            let chain = match self.chans.get(&w) {
                Some(fc) => {
                    if fc.root.hmm.frame() == cf {
                        set.mark_hmm(&fc.root.hmm, am);
                    }
                    fc.chain
                }
                None => {
                    let chan = tree.single_of(w);
                    if chan.hmm.frame() == cf {
                        set.mark_hmm(&chan.hmm, am);
                    }
                    NO_CHAN
                }
            };
            let mut c = chain;
            while c != NO_CHAN {
                let chan = tree.arena.get(c);
                if chan.hmm.frame() == cf {
                    set.mark_hmm(&chan.hmm, am);
                }
                c = chan.next;
            }
        }
        set.flags_to_list();
    }

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

        self.eval_chans(ctx, senscr);
        self.prune_chans(ctx);
        self.word_transition(ctx);

        // Next frame's active word list, from the survivors.
        let nf = cf + 1;
        let mut nawl = mem::take(&mut self.active_word[(nf & 1) as usize]);
        nawl.clear();
        for &w in &self.wordlist {
            if self.word_active[w as usize] {
                nawl.push(w);
            }
        }
        for w in ctx.dict.start_wid()..ctx.dict.n_words() as WordId {
            if self.word_active[w as usize] {
                nawl.push(w);
            }
        }
        self.active_word[(nf & 1) as usize] = nawl;
        self.active_word[(cf & 1) as usize].clear();

        self.cur_frame = nf;
        Some(cf)
    }

    fn eval_chans<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>, senscr: &[i32]) {
        let cf = self.cur_frame;
        let am = ctx.am;
        let finish = ctx.dict.finish_wid();
        let mut best = logs::WORST_SCORE;

        let awl = mem::take(&mut self.active_word[(cf & 1) as usize]);
        self.stats.n_fwdflat_words += awl.len() as u64;

        for &w in &awl {
            let chain = match self.chans.get_mut(&w) {
                Some(fc) => {
                    if fc.root.hmm.frame() == cf {
                        fc.root.hmm.eval(am, senscr);
                        self.stats.n_fwdflat_chan += 1;
                    }
                    if w != finish {
                        best = best.max(fc.root.hmm.bestscore());
                    }
                    fc.chain
                }
                None => {
                    let chan = ctx.tree.single_of_mut(w);
                    if chan.hmm.frame() == cf {
                        chan.hmm.eval(am, senscr);
                        self.stats.n_fwdflat_chan += 1;
                    }
                    if w != finish {
                        best = best.max(chan.hmm.bestscore());
                    }
                    NO_CHAN
                }
            };

            let mut c = chain;
            while c != NO_CHAN {
                let chan = ctx.tree.arena.get_mut(c);
                if chan.hmm.frame() == cf {
                    let s = chan.hmm.eval(am, senscr);
                    best = best.max(s);
                    self.stats.n_fwdflat_chan += 1;
                }
                c = chan.next;
            }
        }
        self.active_word[(cf & 1) as usize] = awl;
        self.best_score = best;
    }

    fn prune_chans<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) {
        let cf = self.cur_frame;
        let nf = cf + 1;
        let thresh = self.best_score + ctx.beams.fwdflat;
        let wordthresh = self.best_score + ctx.beams.fwdflat_word;
        let pip = ctx.beams.pip;

        self.word_active.iter_mut().for_each(|b| *b = false);
        let awl = mem::take(&mut self.active_word[(cf & 1) as usize]);

        for &w in &awl {
            let de_len = ctx.dict.entry(w).len();

            // Root channel: propagate or exit.
            let chain = match self.chans.get_mut(&w) {
                Some(fc) => {
                    if fc.root.hmm.frame() == cf && fc.root.hmm.bestscore() > thresh {
                        fc.root.hmm.set_frame(nf);
                        self.word_active[w as usize] = true;

                        let newscore = fc.root.hmm.out_score() + pip;
                        let out_hist = fc.root.hmm.out_history();
                        if newscore > thresh {
                            // Enter the first following channel; if it is a
                            // right-context head, enter the whole fan-out.
                            let mut c = fc.chain;
                            let fanout = ctx.tree.arena.get(c).info >= 0;
                            loop {
                                let chan = ctx.tree.arena.get_mut(c);
                                if chan.hmm.frame() < cf || chan.hmm.in_score() < newscore {
                                    chan.hmm.enter(newscore, out_hist, nf);
                                }
                                c = chan.next;
                                if !fanout || c == NO_CHAN {
                                    break;
                                }
                            }
                        }
                    }
                    fc.chain
                }
                None => {
                    debug_assert_eq!(de_len, 1);
                    let chan = ctx.tree.single_of_mut(w);
                    if chan.hmm.frame() == cf && chan.hmm.bestscore() > thresh {
                        chan.hmm.set_frame(nf);
                        self.word_active[w as usize] = true;
                        let out = chan.hmm.out_score();
                        let out_hist = chan.hmm.out_history();
                        if out > wordthresh {
                            ctx.hist.save(ctx.dict, cf, w, out, out_hist, 0);
                        }
                    }
                    NO_CHAN
                }
            };

            // Interior and right-context channels.
            let mut c = chain;
            while c != NO_CHAN {
                let (frame, bestscore, next, info) = {
                    let chan = ctx.tree.arena.get(c);
                    (chan.hmm.frame(), chan.hmm.bestscore(), chan.next, chan.info)
                };
                if frame >= cf {
                    if bestscore > thresh {
                        let (out, out_hist) = {
                            let chan = ctx.tree.arena.get_mut(c);
                            chan.hmm.set_frame(nf);
                            (chan.hmm.out_score(), chan.hmm.out_history())
                        };
                        self.word_active[w as usize] = true;

                        if info < 0 {
                            // Word-internal phone; hand off downstream.
                            let newscore = out + pip;
                            if newscore > thresh {
                                let mut n = next;
                                let fanout = ctx.tree.arena.get(n).info >= 0;
                                loop {
                                    let chan = ctx.tree.arena.get_mut(n);
                                    if chan.hmm.frame() < cf || chan.hmm.in_score() < newscore {
                                        chan.hmm.enter(newscore, out_hist, nf);
                                    }
                                    n = chan.next;
                                    if !fanout || n == NO_CHAN {
                                        break;
                                    }
                                }
                            }
                        } else if out > wordthresh {
                            ctx.hist.save(ctx.dict, cf, w, out, out_hist, info as usize);
                        }
                    } else if frame != nf {
                        ctx.tree.arena.get_mut(c).hmm.clear_scores();
                    }
                }
                c = next;
            }
        }
        self.active_word[(cf & 1) as usize] = awl;
    }

    /// Successor words reachable within `fwdflatsfwin` frames of the
    /// current one, re-derived from the first-pass start-frame buckets.
    fn expand_words(&mut self, frm: FrameId, win: i32, tree_pass_ran: bool) {
        if !tree_pass_ran {
            self.stats.n_fwdflat_word_transition += self.expand_list.len() as u64;
            return;
        }
        let sf = (frm - win).max(0) as usize;
        let ef = ((frm + win) as usize).min(self.frm_words.len());

        self.expand_flag.iter_mut().for_each(|b| *b = false);
        self.expand_list.clear();
        for f in sf..ef {
            for n in &self.frm_words[f] {
                if !self.expand_flag[n.wid as usize] {
                    self.expand_list.push(n.wid);
                    self.expand_flag[n.wid as usize] = true;
                }
            }
        }
        self.stats.n_fwdflat_word_transition += self.expand_list.len() as u64;
    }

    fn word_transition<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) {
        let cf = self.cur_frame;
        let nf = cf + 1;
        let thresh = self.best_score + ctx.beams.fwdflat;
        let pip = ctx.beams.pip;
        let lwf = ctx.beams.fwdflat_lw_ratio;
        let sil_phone = ctx.am.sil_phone();

        let tree_pass_ran = !self.frm_words.is_empty();
        self.expand_words(cf, ctx.cfg.fwdflatsfwin, tree_pass_ran);

        let mut best_silrc_score = logs::WORST_SCORE;
        let mut best_silrc_bp = NO_BP;

        let range = ctx.hist.frame_range(cf as usize);
        for b in range {
            let (wid, s_idx, r_diph, real, prev_real) = {
                let e = ctx.hist.entry(b as i32);
                (e.wid, e.s_idx, e.r_diph, e.real_wid, e.prev_real_wid)
            };
            ctx.hist.clear_exit(wid);
            if wid == ctx.dict.finish_wid() {
                continue;
            }

            let exit_last_ci = ctx.dict.entry(wid).last_ci();
            let perm = ctx.dict.rc_perm(r_diph).to_vec();

            for wi in 0..self.expand_list.len() {
                let w = self.expand_list[wi];
                let (first_ci, base) = {
                    let de = ctx.dict.entry(w);
                    (de.first_ci(), de.base_wid)
                };
                let mut newscore = ctx.hist.stack_at(s_idx + perm[first_ci as usize]);
                let tg = ctx.lm.tg_score(base, real, prev_real);
                newscore = newscore
                    .saturating_add((tg as f32 * lwf) as i32)
                    .saturating_add(pip);

                if newscore <= thresh {
                    continue;
                }
                match self.chans.get_mut(&w) {
                    Some(fc) => {
                        if fc.root.hmm.frame() < cf || fc.root.hmm.in_score() < newscore {
                            if fc.root.hmm.enter(newscore, b as i32, nf) && fc.root.hmm.is_mpx() {
                                let ssid =
                                    ctx.dict.left_context_ssid(fc.root.diphone, exit_last_ci);
                                fc.root.hmm.set_entry_ssid(ssid);
                            }
                            self.word_active[w as usize] = true;
                        }
                    }
                    None => {
                        let chan = ctx.tree.single_of_mut(w);
                        if chan.hmm.frame() < cf || chan.hmm.in_score() < newscore {
                            chan.hmm.enter(newscore, b as i32, nf);
                            self.word_active[w as usize] = true;
                        }
                    }
                }
            }

            let s = ctx.hist.stack_at(s_idx + perm[sil_phone as usize]);
            if best_silrc_score < s {
                best_silrc_score = s;
                best_silrc_bp = b as i32;
            }
        }

        // Silence, then the remaining fillers.
        let newscore = best_silrc_score
            .saturating_add(ctx.beams.silpen)
            .saturating_add(pip);
        if newscore > thresh && newscore > logs::WORST_SCORE {
            let w = ctx.dict.sil_wid();
            let chan = ctx.tree.single_of_mut(w);
            if chan.hmm.frame() < cf || chan.hmm.in_score() < newscore {
                chan.hmm.enter(newscore, best_silrc_bp, nf);
                self.word_active[w as usize] = true;
            }
        }
        let newscore = best_silrc_score
            .saturating_add(ctx.beams.fillpen)
            .saturating_add(pip);
        if newscore > thresh && newscore > logs::WORST_SCORE {
            for i in 0..ctx.tree.single_chan.len() {
                let w = ctx.tree.single_wid[i];
                if w <= ctx.dict.sil_wid() {
                    continue;
                }
                let chan = &mut ctx.tree.single_chan[i];
                if chan.hmm.frame() < cf || chan.hmm.in_score() < newscore {
                    chan.hmm.enter(newscore, best_silrc_bp, nf);
                    self.word_active[w as usize] = true;
                }
            }
        }

        // Words that stayed inactive get their entry scores wiped.
        let awl = mem::take(&mut self.active_word[(cf & 1) as usize]);
        for &w in &awl {
            match self.chans.get_mut(&w) {
                Some(fc) => {
                    if fc.root.hmm.frame() == cf {
                        fc.root.hmm.clear_scores();
                    }
                }
                None => {
                    let chan = ctx.tree.single_of_mut(w);
                    if chan.hmm.frame() == cf {
                        chan.hmm.clear_scores();
                    }
                }
            }
        }
        self.active_word[(cf & 1) as usize] = awl;
    }

    fn renormalize<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>, norm: i32) {
        let cf = self.cur_frame;
        let awl = mem::take(&mut self.active_word[(cf & 1) as usize]);
        for &w in &awl {
            let chain = match self.chans.get_mut(&w) {
                Some(fc) => {
                    if fc.root.hmm.frame() == cf {
                        fc.root.hmm.normalize(norm);
                    }
                    fc.chain
                }
                None => {
                    let chan = ctx.tree.single_of_mut(w);
                    if chan.hmm.frame() == cf {
                        chan.hmm.normalize(norm);
                    }
                    NO_CHAN
                }
            };
            let mut c = chain;
            while c != NO_CHAN {
                let chan = ctx.tree.arena.get_mut(c);
                if chan.hmm.frame() == cf {
                    chan.hmm.normalize(norm);
                }
                c = chan.next;
            }
        }
        self.active_word[(cf & 1) as usize] = awl;
        self.renormalized = true;
    }

    pub fn finish<L: LanguageModel>(&mut self, ctx: &mut SearchCtx<'_, L>) -> FrameId {
        self.destroy_chans(ctx);
        self.frm_words.clear();
        self.word_active.iter_mut().for_each(|b| *b = false);

        ctx.hist.mark_frame(self.cur_frame as usize);
        if self.cur_frame > 0 {
            self.cur_frame -= 1;
        }
        self.last_frame = self.cur_frame;

        info!(
            frames = self.last_frame + 1,
            exits = ctx.hist.len(),
            chans = self.stats.n_fwdflat_chan,
            words = self.stats.n_fwdflat_words,
            transitions = self.stats.n_fwdflat_word_transition,
            "flat pass finished"
        );
        self.last_frame
    }
}
