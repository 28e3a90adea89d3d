//! Exact-trigram best-path search over the lattice DAG.
//!
//! Kahn-style sweep: links become ready once every link into their source
//! node has settled, so each link's `path_scr` is final before it is used
//! to extend successors. The trigram at each extension uses the two real
//! words behind the link, which the first pass could only approximate.

use crate::lattice::{Lattice, NO_LINK};
use crate::lm::{CachedLm, LanguageModel};
use crate::{DecodeError, WordId};
use std::collections::VecDeque;
use tracing::info;

/// Result of a rescoring pass: the best link sequence, start to end.
pub struct BestPath {
    pub links: Vec<i32>,
    /// Total path score including the terminal node's acoustic score.
    pub score: i32,
}

/// Viterbi over the DAG in the log domain. `lwf` scales the LM scores
/// relative to the first pass's language weight.
pub fn rescore<L: LanguageModel>(
    lat: &mut Lattice,
    lm: &CachedLm<L>,
    lwf: f32,
) -> Result<BestPath, DecodeError> {
    let scale = |s: i32| (s as f32 * lwf) as i32;

    // Fan-in counts; links start unresolved.
    for n in lat.nodes.iter_mut() {
        n.info = 0;
    }
    for l in 0..lat.links.len() {
        let to = lat.links[l].to;
        lat.nodes[to as usize].info += 1;
        lat.links[l].path_scr = i32::MIN;
        lat.links[l].best_prev = NO_LINK;
    }

    let start_wid: WordId = lat.nodes[lat.start as usize].wid;
    let mut queue: VecDeque<i32> = VecDeque::new();
    let mut l = lat.nodes[lat.start as usize].links;
    while l != NO_LINK {
        let to = lat.links[l as usize].to;
        let to_wid = lat.nodes[to as usize].wid;
        lat.links[l as usize].path_scr = lat.links[l as usize]
            .link_scr
            .saturating_add(scale(lm.bg_score(to_wid, start_wid)));
        queue.push_back(l);
        l = lat.links[l as usize].next;
    }

    while let Some(q) = queue.pop_front() {
        let (node, q_path, q_from) = {
            let link = &lat.links[q as usize];
            (link.to, link.path_scr, link.from)
        };
        let from_wid = lat.nodes[q_from as usize].wid;
        let node_wid = lat.nodes[node as usize].wid;

        let mut l = lat.nodes[node as usize].links;
        while l != NO_LINK {
            let to_wid = lat.nodes[lat.links[l as usize].to as usize].wid;
            let cand = q_path
                .saturating_add(lat.links[l as usize].link_scr)
                .saturating_add(scale(lm.tg_score(to_wid, node_wid, from_wid)));
            let link = &mut lat.links[l as usize];
            if cand > link.path_scr {
                link.path_scr = cand;
                link.best_prev = q;
            }
            l = lat.links[l as usize].next;
        }

        lat.nodes[node as usize].info -= 1;
        if lat.nodes[node as usize].info == 0 {
            let mut l = lat.nodes[node as usize].links;
            while l != NO_LINK {
                queue.push_back(l);
                l = lat.links[l as usize].next;
            }
        }
    }

    // Best link entering the terminal.
    let mut best = NO_LINK;
    let mut best_scr = i32::MIN;
    for (i, l) in lat.links.iter().enumerate() {
        if l.to == lat.end && l.path_scr > best_scr {
            best_scr = l.path_scr;
            best = i as i32;
        }
    }
    if best == NO_LINK {
        return Err(DecodeError::LatticeFormat(
            "no path reaches the terminal node".into(),
        ));
    }

    let mut links = Vec::new();
    let mut l = best;
    while l != NO_LINK {
        links.push(l);
        l = lat.links[l as usize].best_prev;
    }
    links.reverse();

    let score = best_scr.saturating_add(lat.final_ascr);
    info!(
        nodes = lat.nodes.len(),
        links = lat.n_links(),
        score,
        "bestpath rescoring done"
    );
    Ok(BestPath { links, score })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{LatLink, LatNode, NO_LINK};
    use crate::lm::NGramModel;
    use crate::logs;

    /// Hand-built diamond: <s> -> {a, b} -> </s>, where the LM prefers the
    /// acoustically worse arm.
    fn diamond() -> (Lattice, CachedLm<NGramModel>) {
        let mk_node = |wid, sf, fef, lef| LatNode {
            wid,
            sf,
            fef,
            lef,
            reachable: true,
            links: NO_LINK,
            info: 0,
            alive: true,
        };
        // wids: 0 = a, 1 = b, 2 = </s>, 3 = <s>
        let mut lat = Lattice {
            nodes: vec![
                mk_node(3, 0, 4, 4),
                mk_node(0, 5, 9, 9),
                mk_node(1, 5, 9, 9),
                mk_node(2, 10, 12, 12),
            ],
            links: Vec::new(),
            start: 0,
            end: 3,
            n_frames: 13,
            final_ascr: -25,
        };
        let mut add = |lat: &mut Lattice, from: i32, to: i32, scr: i32| {
            let id = lat.links.len() as i32;
            lat.links.push(LatLink {
                from,
                to,
                next: lat.nodes[from as usize].links,
                link_scr: scr,
                path_scr: logs::WORST_SCORE,
                best_prev: NO_LINK,
                ef: lat.nodes[to as usize].sf - 1,
                alive: true,
            });
            lat.nodes[from as usize].links = id;
        };
        add(&mut lat, 0, 1, -100);
        add(&mut lat, 0, 2, -50);
        add(&mut lat, 1, 3, -100);
        add(&mut lat, 2, 3, -100);

        let mut lm = NGramModel::new();
        lm.add_unigram(0, 0.4);
        lm.add_unigram(1, 0.4);
        lm.add_unigram(2, 0.1);
        lm.add_unigram(3, 0.1);
        // strong preference for the "a" arm
        lm.add_bigram(3, 0, 0.9);
        lm.add_bigram(3, 1, 0.0001);
        (lat, CachedLm::new(lm, 1.0, 1.0))
    }

    #[test]
    fn lm_overrides_acoustics() {
        let (mut lat, lm) = diamond();
        let bp = rescore(&mut lat, &lm, 1.0).unwrap();
        // path goes through node 1 ("a") despite the worse link score
        let mids: Vec<i32> = bp.links.iter().map(|&l| lat.links[l as usize].to).collect();
        assert!(mids.contains(&1));
        assert!(!mids.contains(&2));
        assert_eq!(bp.links.len(), 2);
    }

    #[test]
    fn score_includes_final_ascr() {
        let (mut lat, lm) = diamond();
        let bp = rescore(&mut lat, &lm, 1.0).unwrap();
        let last = *bp.links.last().unwrap();
        assert_eq!(
            bp.score,
            lat.links[last as usize].path_scr + lat.final_ascr
        );
    }

    #[test]
    fn every_reached_node_resolves() {
        let (mut lat, lm) = diamond();
        rescore(&mut lat, &lm, 1.0).unwrap();
        assert!(lat.nodes.iter().all(|n| n.info <= 0));
    }
}
