//! Per-frame Viterbi update of a single left-to-right HMM instance.
//!
//! Transitions are restricted to self, +1 and +2 within the model; the
//! non-emitting exit state is updated in the same frame as the emitting
//! states. Instances are either shared (one senone-sequence id) or
//! multiplexed (one ssid per state, used only at cross-word left-context
//! roots, where the entry ssid changes when a new left context enters and
//! then travels along with its token).

use crate::amodel::AcousticModel;
use crate::{logs, FrameId, SsId, TmatId, NO_BP, NO_SSID};

pub const MAX_EMIT_STATES: usize = 5;

/// Path score and history index of one HMM state.
#[derive(Debug, Clone, Copy)]
pub struct HmmState {
    pub score: i32,
    pub history: i32,
}

impl HmmState {
    const EMPTY: HmmState = HmmState {
        score: logs::WORST_SCORE,
        history: NO_BP,
    };
}

#[derive(Debug, Clone)]
enum Ssids {
    Shared(SsId),
    Mpx([SsId; MAX_EMIT_STATES]),
}

/// One HMM instance in the search space.
#[derive(Debug, Clone)]
pub struct Hmm {
    state: [HmmState; MAX_EMIT_STATES],
    out: HmmState,
    ssid: Ssids,
    tmatid: TmatId,
    bestscore: i32,
    frame: FrameId,
}

impl Hmm {
    pub fn new(mpx: bool, ssid: SsId, tmatid: TmatId) -> Self {
        let ssid = if mpx {
            Ssids::Mpx([ssid; MAX_EMIT_STATES])
        } else {
            Ssids::Shared(ssid)
        };
        Self {
            state: [HmmState::EMPTY; MAX_EMIT_STATES],
            out: HmmState::EMPTY,
            ssid,
            tmatid,
            bestscore: logs::WORST_SCORE,
            frame: -1,
        }
    }

    pub fn is_mpx(&self) -> bool {
        matches!(self.ssid, Ssids::Mpx(_))
    }

    pub fn ssid_at(&self, s: usize) -> SsId {
        match &self.ssid {
            Ssids::Shared(id) => *id,
            Ssids::Mpx(ids) => ids[s],
        }
    }

    /// Rewrite the entry-state ssid (multiplex roots on cross-word entry,
    /// shared channels at tree rebuild).
    pub fn set_entry_ssid(&mut self, ssid: SsId) {
        match &mut self.ssid {
            Ssids::Shared(id) => *id = ssid,
            Ssids::Mpx(ids) => ids[0] = ssid,
        }
    }

    pub fn tmatid(&self) -> TmatId {
        self.tmatid
    }

    pub fn in_score(&self) -> i32 {
        self.state[0].score
    }

    pub fn out_score(&self) -> i32 {
        self.out.score
    }

    pub fn out_history(&self) -> i32 {
        self.out.history
    }

    pub fn state(&self, s: usize) -> &HmmState {
        &self.state[s]
    }

    pub fn bestscore(&self) -> i32 {
        self.bestscore
    }

    pub fn frame(&self) -> FrameId {
        self.frame
    }

    pub fn set_frame(&mut self, f: FrameId) {
        self.frame = f;
    }

    /// Reset to the inactive condition: scores to WORST, histories undefined.
    pub fn clear(&mut self) {
        self.state = [HmmState::EMPTY; MAX_EMIT_STATES];
        self.out = HmmState::EMPTY;
        self.bestscore = logs::WORST_SCORE;
        self.frame = -1;
    }

    /// Reset scores only; the frame stamp survives.
    pub fn clear_scores(&mut self) {
        for st in &mut self.state {
            st.score = logs::WORST_SCORE;
        }
        self.out.score = logs::WORST_SCORE;
        self.bestscore = logs::WORST_SCORE;
    }

    /// Subtract `norm` from every finite score to cap dynamic range.
    pub fn normalize(&mut self, norm: i32) {
        for st in &mut self.state {
            if st.score > logs::WORST_SCORE {
                st.score -= norm;
            }
        }
        if self.out.score > logs::WORST_SCORE {
            self.out.score -= norm;
        }
        if self.bestscore > logs::WORST_SCORE {
            self.bestscore -= norm;
        }
    }

    /// Non-emitting entry transition: adopt `(score, history)` iff it
    /// improves the entry state, and stamp the activation frame. Returns
    /// whether the entry improved, so callers can keep a multiplex root's
    /// entry ssid coherent with the accepted path.
    pub fn enter(&mut self, score: i32, history: i32, frame: FrameId) -> bool {
        self.frame = frame;
        if score > self.state[0].score {
            self.state[0].score = score;
            self.state[0].history = history;
            true
        } else {
            false
        }
    }

    /// One Viterbi step against this frame's senone scores. Returns the best
    /// emitting-state score (also cached in `bestscore`).
    pub fn eval(&mut self, am: &AcousticModel, senscr: &[i32]) -> i32 {
        let n = am.n_emit_state();
        let tmat = self.tmatid;

        let mut old_score = [logs::WORST_SCORE; MAX_EMIT_STATES];
        let mut old_hist = [NO_BP; MAX_EMIT_STATES];
        let mut old_ssid = [NO_SSID; MAX_EMIT_STATES];
        for s in 0..n {
            old_score[s] = self.state[s].score;
            old_hist[s] = self.state[s].history;
            old_ssid[s] = self.ssid_at(s);
        }

        let mut best = logs::WORST_SCORE;
        for s in 0..n {
            let mut best_in = logs::WORST_SCORE;
            let mut best_p = usize::MAX;
            let lo = s.saturating_sub(2);
            for p in lo..=s {
                if old_score[p] <= logs::WORST_SCORE {
                    continue;
                }
                let tp = am.tprob(tmat, p, s);
                if tp <= logs::WORST_SCORE {
                    continue;
                }
                let v = old_score[p] + tp;
                if v > best_in {
                    best_in = v;
                    best_p = p;
                }
            }

            if best_p == usize::MAX {
                self.state[s] = HmmState::EMPTY;
                continue;
            }

            let ssid = old_ssid[best_p];
            if self.is_mpx() {
                if let Ssids::Mpx(ids) = &mut self.ssid {
                    ids[s] = ssid;
                }
            }
            let sen = if ssid < 0 {
                logs::WORST_SCORE
            } else {
                senscr[am.sseq(ssid)[s] as usize]
            };
            if sen <= logs::WORST_SCORE {
                self.state[s] = HmmState::EMPTY;
                continue;
            }

            let score = best_in + sen;
            self.state[s] = HmmState {
                score,
                history: old_hist[best_p],
            };
            if score > best {
                best = score;
            }
        }

        // Exit state, fed by this frame's emitting states.
        self.out = HmmState::EMPTY;
        for s in 0..n {
            if self.state[s].score <= logs::WORST_SCORE {
                continue;
            }
            let tp = am.tprob(tmat, s, n);
            if tp <= logs::WORST_SCORE {
                continue;
            }
            let v = self.state[s].score + tp;
            if v > self.out.score {
                self.out = HmmState {
                    score: v,
                    history: self.state[s].history,
                };
            }
        }

        self.bestscore = best;
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amodel::AcousticModelBuilder;

    fn am3() -> AcousticModel {
        let mut b = AcousticModelBuilder::new(3);
        b.add_phone("SIL");
        b.add_phone("AA");
        b.build("SIL").unwrap()
    }

    #[test]
    fn enter_keeps_better_score() {
        let mut h = Hmm::new(false, 1, 1);
        h.enter(-100, 7, 0);
        assert_eq!(h.in_score(), -100);
        h.enter(-200, 9, 1);
        assert_eq!(h.in_score(), -100);
        assert_eq!(h.state(0).history, 7);
        assert_eq!(h.frame(), 1);
    }

    #[test]
    fn eval_propagates_left_to_right() {
        let am = am3();
        let senscr = vec![0i32; am.n_senones()];
        let mut h = Hmm::new(false, am.ci_ssid(1), 1);
        h.enter(0, 42, 0);
        let b0 = h.eval(&am, &senscr);
        assert!(b0 > logs::WORST_SCORE);
        // state 0 is live, history carried
        assert_eq!(h.state(0).history, 42);
        // after one more step, state 1 and 2 receive mass
        h.eval(&am, &senscr);
        assert!(h.state(1).score > logs::WORST_SCORE);
        assert!(h.state(2).score > logs::WORST_SCORE);
        assert!(h.out_score() > logs::WORST_SCORE);
        assert_eq!(h.out_history(), 42);
    }

    #[test]
    fn clear_resets_everything() {
        let am = am3();
        let senscr = vec![0i32; am.n_senones()];
        let mut h = Hmm::new(false, am.ci_ssid(1), 1);
        h.enter(0, 1, 3);
        h.eval(&am, &senscr);
        h.clear();
        assert_eq!(h.frame(), -1);
        assert_eq!(h.in_score(), logs::WORST_SCORE);
        assert_eq!(h.out_score(), logs::WORST_SCORE);
    }

    #[test]
    fn normalize_shifts_finite_scores_only() {
        let am = am3();
        let senscr = vec![-10i32; am.n_senones()];
        let mut h = Hmm::new(false, am.ci_ssid(1), 1);
        h.enter(-50, 0, 0);
        h.eval(&am, &senscr);
        let before = h.bestscore();
        h.normalize(before);
        assert_eq!(h.bestscore(), 0);
        // never-touched states stay at WORST
        assert_eq!(h.state(4).score, logs::WORST_SCORE);
    }

    #[test]
    fn mpx_entry_ssid_travels_with_token() {
        let mut b = AcousticModelBuilder::new(3);
        b.add_phone("SIL");
        let aa = b.add_phone("AA");
        let ae = b.add_phone("AE");
        let am = b.build("SIL").unwrap();

        // Favor AE senones so the distinction is observable.
        let mut senscr = vec![-100i32; am.n_senones()];
        for &s in am.sseq(am.ci_ssid(ae)) {
            senscr[s as usize] = 0;
        }

        let mut h = Hmm::new(true, am.ci_ssid(aa), aa);
        h.enter(0, 5, 0);
        h.set_entry_ssid(am.ci_ssid(ae));
        h.eval(&am, &senscr);
        h.eval(&am, &senscr);
        // the rewritten entry ssid has been inherited by state 1
        assert_eq!(h.ssid_at(1), am.ci_ssid(ae));
    }
}
