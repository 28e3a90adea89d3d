//! N-best enumeration over a saved lattice.
//!
//! A* flavored stack decoding: partial paths are kept sorted by exact score
//! plus an admissible bigram estimate of the remaining cost to the
//! terminal. The best partial path is popped, extended through its node's
//! successors with the exact trigram, and completed paths are emitted if
//! their word sequence is new. Hard caps bound the live list and the total
//! number of extension attempts.

use crate::lattice::Lattice;
use crate::lm::{CachedLm, LanguageModel};
use crate::{logs, FrameId, WordId};

/// Max live partial paths at any time.
const MAX_PATHS: usize = 500;
/// Max extension attempts per query.
const MAX_HYP_TRIES: usize = 10_000;

/// One alternative hypothesis: word ids with their lattice time spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltHyp {
    pub words: Vec<WordId>,
    /// (wid, sf, approximate ef) per word.
    pub segs: Vec<(WordId, FrameId, FrameId)>,
    pub score: i32,
}

#[derive(Clone, Copy)]
struct LatPath {
    node: i32,
    parent: i32,
    score: i32,
}

/// Enumerate up to `n` distinct word sequences between frames `sf` and
/// `ef`. `w1`/`w2` give the left context (`w1` may be absent).
pub fn get_alt<L: LanguageModel>(
    lat: &Lattice,
    lm: &CachedLm<L>,
    lwf: f32,
    n: usize,
    sf: FrameId,
    ef: FrameId,
    w1: Option<WordId>,
    w2: WordId,
) -> Vec<AltHyp> {
    if n == 0 || lat.nodes.is_empty() {
        return Vec::new();
    }
    let scale = |s: i32| (s as f32 * lwf) as i32;

    // Admissible remaining-cost estimate per node, bigram flavored.
    // Processing in decreasing start-frame order resolves successors first.
    let mut rem = vec![logs::WORST_SCORE; lat.nodes.len()];
    let mut order: Vec<usize> = (0..lat.nodes.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(lat.nodes[i].sf));
    for &i in &order {
        if i as i32 == lat.end {
            rem[i] = 0;
            continue;
        }
        let mut best = logs::WORST_SCORE;
        for l in lat.out_links(i as i32) {
            let link = &lat.links[l as usize];
            let to = link.to as usize;
            if rem[to] <= logs::WORST_SCORE {
                continue;
            }
            let s = rem[to]
                .saturating_add(link.link_scr)
                .saturating_add(scale(lm.bg_score(lat.nodes[to].wid, lat.nodes[i].wid)));
            best = best.max(s);
        }
        rem[i] = best;
    }

    let mut arena: Vec<LatPath> = Vec::new();
    // Live list of arena ids, sorted by score + rem, best first.
    let mut live: Vec<i32> = Vec::new();

    let insert = |arena: &Vec<LatPath>, live: &mut Vec<i32>, rem: &Vec<i32>, id: i32| {
        let total = |p: i32| {
            arena[p as usize]
                .score
                .saturating_add(rem[arena[p as usize].node as usize])
        };
        let t = total(id);
        let pos = live.partition_point(|&p| total(p) >= t);
        if pos < MAX_PATHS {
            live.insert(pos, id);
            live.truncate(MAX_PATHS);
        }
    };

    // Seed with every node starting at sf.
    for i in 0..lat.nodes.len() {
        if lat.nodes[i].sf != sf {
            continue;
        }
        let wid = lat.nodes[i].wid;
        let scr = match w1 {
            Some(w1) => scale(lm.tg_score(wid, w2, w1)),
            None => scale(lm.bg_score(wid, w2)),
        };
        let id = arena.len() as i32;
        arena.push(LatPath {
            node: i as i32,
            parent: -1,
            score: scr,
        });
        insert(&arena, &mut live, &rem, id);
    }

    let mut out: Vec<AltHyp> = Vec::new();
    let mut tries = 0usize;

    while !live.is_empty() && out.len() < n && tries < MAX_HYP_TRIES {
        let top = live.remove(0);
        let top_path = arena[top as usize];
        let node = &lat.nodes[top_path.node as usize];

        let complete = node.sf >= ef
            || (top_path.node == lat.end && ef > lat.nodes[lat.end as usize].sf);
        if complete {
            // Emit, omitting the bracketing final node.
            let mut words = Vec::new();
            let mut segs = Vec::new();
            let mut p = top_path.parent;
            while p >= 0 {
                let lp = arena[p as usize];
                let n = &lat.nodes[lp.node as usize];
                words.push(n.wid);
                segs.push((n.wid, n.sf, n.fef));
                p = lp.parent;
            }
            words.reverse();
            segs.reverse();
            if !words.is_empty() && !out.iter().any(|h| h.words == words) {
                out.push(AltHyp {
                    words,
                    segs,
                    score: top_path.score,
                });
            }
            continue;
        }

        if node.fef >= ef {
            continue;
        }
        // Extend through every successor that can still reach the terminal.
        for l in lat.out_links(top_path.node) {
            let link = &lat.links[l as usize];
            if rem[link.to as usize] <= logs::WORST_SCORE {
                continue;
            }
            let to_wid = lat.nodes[link.to as usize].wid;
            let lm_scr = if top_path.parent >= 0 {
                let prev = arena[top_path.parent as usize].node;
                scale(lm.tg_score(to_wid, node.wid, lat.nodes[prev as usize].wid))
            } else {
                scale(lm.bg_score(to_wid, node.wid))
            };
            let id = arena.len() as i32;
            arena.push(LatPath {
                node: link.to,
                parent: top,
                score: top_path
                    .score
                    .saturating_add(link.link_scr)
                    .saturating_add(lm_scr),
            });
            tries += 1;
            insert(&arena, &mut live, &rem, id);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{LatLink, LatNode, NO_LINK};
    use crate::lm::NGramModel;

    /// <s> -> {a|b} -> {c|d} -> </s> lattice: four distinct paths.
    fn grid() -> (Lattice, CachedLm<NGramModel>) {
        let mk = |wid, sf| LatNode {
            wid,
            sf,
            fef: sf + 3,
            lef: sf + 4,
            reachable: true,
            links: NO_LINK,
            info: 0,
            alive: true,
        };
        // wids: 0 <s>, 1 a, 2 b, 3 c, 4 d, 5 </s>
        let mut lat = Lattice {
            nodes: vec![mk(0, 0), mk(1, 5), mk(2, 5), mk(3, 10), mk(4, 10), mk(5, 15)],
            links: Vec::new(),
            start: 0,
            end: 5,
            n_frames: 20,
            final_ascr: 0,
        };
        let mut add = |lat: &mut Lattice, from: i32, to: i32, scr: i32| {
            let id = lat.links.len() as i32;
            lat.links.push(LatLink {
                from,
                to,
                next: lat.nodes[from as usize].links,
                link_scr: scr,
                path_scr: crate::logs::WORST_SCORE,
                best_prev: NO_LINK,
                ef: lat.nodes[to as usize].sf - 1,
                alive: true,
            });
            lat.nodes[from as usize].links = id;
        };
        add(&mut lat, 0, 1, -10);
        add(&mut lat, 0, 2, -20);
        add(&mut lat, 1, 3, -10);
        add(&mut lat, 1, 4, -15);
        add(&mut lat, 2, 3, -10);
        add(&mut lat, 2, 4, -15);
        add(&mut lat, 3, 5, -10);
        add(&mut lat, 4, 5, -10);

        let mut lm = NGramModel::new();
        for w in 0..6 {
            lm.add_unigram(w, 0.15);
        }
        (lat, CachedLm::new(lm, 1.0, 1.0))
    }

    #[test]
    fn returns_distinct_ranked_alternatives() {
        let (lat, lm) = grid();
        let alts = get_alt(&lat, &lm, 1.0, 5, 0, 15, None, 0);
        assert_eq!(alts.len(), 4);
        for i in 1..alts.len() {
            assert!(alts[i - 1].score >= alts[i].score);
            for j in 0..i {
                assert_ne!(alts[j].words, alts[i].words);
            }
        }
        // best path is the acoustically cheapest: <s> a c
        assert_eq!(alts[0].words, vec![0, 1, 3]);
    }

    #[test]
    fn deterministic_across_calls() {
        let (lat, lm) = grid();
        let a = get_alt(&lat, &lm, 1.0, 5, 0, 15, None, 0);
        let b = get_alt(&lat, &lm, 1.0, 5, 0, 15, None, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn respects_requested_count() {
        let (lat, lm) = grid();
        let alts = get_alt(&lat, &lm, 1.0, 2, 0, 15, None, 0);
        assert_eq!(alts.len(), 2);
    }
}
