//! End-to-end decoding scenarios against the toy models.

mod common;

use common::*;
use std::cell::RefCell;
use std::rc::Rc;
use trellis_core::lm::{LanguageModel, NGramModel};
use trellis_core::{Config, Decoder, WordId};

fn decode(
    cfg: Config,
    words: &[&str],
    reps: usize,
) -> (Decoder<NGramModel>, ScriptScorer) {
    let am = toy_am();
    let dict = toy_dict(&am);
    let lm = toy_lm(&dict);
    let script = script_for(&am, words, &dict, reps);
    let mut scorer = ScriptScorer::new(&am, script);
    let n_sen = am.n_senones();

    let mut dec = Decoder::new(cfg, am, dict, lm).unwrap();
    dec.start_utt().unwrap();
    let mut buf = vec![0i32; n_sen];
    for f in 0..scorer.n_frames() {
        scorer.frame_scores(f, &mut buf);
        dec.frame(&buf).unwrap();
    }
    dec.finish_utt(Some(&mut scorer)).unwrap();
    (dec, scorer)
}

#[test]
fn go_forward_ten_meters_two_pass() {
    let (dec, _) = decode(toy_config(), &["go", "forward", "ten", "meters"], 5);
    let (frames, text) = dec.result().unwrap();
    assert_eq!(text, "go forward ten meters");
    assert!(frames > 80);

    let hyp = dec.hypothesis().unwrap();
    assert_eq!(hyp.segs.len(), 4);
    // segments tile the utterance in order
    for pair in hyp.segs.windows(2) {
        assert!(pair[0].ef < pair[1].sf);
    }
    let dict = dec.dict();
    assert_eq!(hyp.wids.first().copied(), Some(dict.start_wid()));
    assert_eq!(hyp.wids.last().copied(), Some(dict.finish_wid()));
}

#[test]
fn single_word_hello_tree_pass_only() {
    let cfg = Config {
        fwdflat: false,
        ..toy_config()
    };
    let (dec, scorer) = decode(cfg, &["hello"], 5);
    let (_, text) = dec.result().unwrap();
    assert_eq!(text, "hello");

    let hyp = dec.hypothesis().unwrap();
    assert_eq!(hyp.segs.len(), 1);
    let seg = &hyp.segs[0];
    // spans the spoken region give or take a frame or two of silence
    assert!((4..=8).contains(&seg.sf), "sf = {}", seg.sf);
    let spoken_end = scorer.n_frames() as i32 - 7;
    assert!(
        (seg.ef - spoken_end).abs() <= 2,
        "ef = {} vs spoken end {}",
        seg.ef,
        spoken_end
    );

    // hello's exit goes straight into the terminal
    let dict = dec.dict();
    let hello = dict.word_id("hello").unwrap();
    assert!(hyp.wids.contains(&hello));
    assert_eq!(hyp.wids.last().copied(), Some(dict.finish_wid()));
}

/// LM wrapper recording every trigram query.
struct SpyLm {
    inner: NGramModel,
    tg_queries: Rc<RefCell<Vec<(WordId, WordId, WordId)>>>,
}

impl LanguageModel for SpyLm {
    fn ug(&self, w: WordId) -> i32 {
        self.inner.ug(w)
    }
    fn bg(&self, w1: WordId, w2: WordId) -> i32 {
        self.inner.bg(w1, w2)
    }
    fn tg(&self, w1: WordId, w2: WordId, w3: WordId) -> i32 {
        self.tg_queries.borrow_mut().push((w1, w2, w3));
        self.inner.tg(w1, w2, w3)
    }
    fn known_wid(&self, w: WordId) -> bool {
        self.inner.known_wid(w)
    }
}

#[test]
fn context_preload_feeds_trigram_history() {
    let am = toy_am();
    let dict = toy_dict(&am);
    let queries = Rc::new(RefCell::new(Vec::new()));
    let lm = SpyLm {
        inner: toy_lm(&dict),
        tg_queries: queries.clone(),
    };
    let script = script_for(&am, &["brown", "fox"], &dict, 5);
    let scorer = ScriptScorer::new(&am, script);
    let n_sen = am.n_senones();

    let the = dict.word_id("the").unwrap();
    let quick = dict.word_id("quick").unwrap();
    let brown = dict.word_id("brown").unwrap();

    let cfg = Config {
        fwdflat: false,
        ..toy_config()
    };
    let mut dec = Decoder::new(cfg, am, dict, lm).unwrap();
    dec.set_context(&["the", "quick"]).unwrap();
    dec.start_utt().unwrap();
    let mut buf = vec![0i32; n_sen];
    for f in 0..scorer.n_frames() {
        scorer.frame_scores(f, &mut buf);
        dec.frame(&buf).unwrap();
    }
    dec.finish_utt(None).unwrap();

    // the first decoded word saw exactly tg(the, quick, brown)
    assert!(
        queries.borrow().contains(&(the, quick, brown)),
        "no tg(the, quick, brown) query recorded"
    );

    // and the context words are stripped from the result
    let (_, text) = dec.result().unwrap();
    assert_eq!(text, "brown fox");
}

#[test]
fn hmm_cap_at_population_changes_nothing() {
    let words = ["go", "forward", "ten", "meters"];
    let (dec_a, _) = decode(toy_config(), &words, 5);
    let cfg_capped = Config {
        maxhmmpf: 1_000_000,
        ..toy_config()
    };
    let (dec_b, _) = decode(cfg_capped, &words, 5);

    let (ha, hb) = (dec_a.history(), dec_b.history());
    assert_eq!(ha.len(), hb.len());
    for i in 0..ha.len() {
        let (a, b) = (ha.entry(i as i32), hb.entry(i as i32));
        assert_eq!((a.frame, a.wid, a.bp, a.score), (b.frame, b.wid, b.bp, b.score));
    }
    assert_eq!(dec_a.result(), dec_b.result());
}

#[test]
fn tightened_beams_keep_a_subset_of_exits() {
    let words = ["go", "forward", "ten", "meters"];
    let tight_cfg = Config {
        beam: 1e-10,
        pbeam: 1e-9,
        wbeam: 1e-6,
        lpbeam: 1e-9,
        lponlybeam: 1e-6,
        fwdflat: false,
        ..toy_config()
    };
    let loose_cfg = Config {
        fwdflat: false,
        ..toy_config()
    };
    let (loose, _) = decode(loose_cfg, &words, 5);
    let (tight, _) = decode(tight_cfg, &words, 5);

    let loose_exits: std::collections::HashSet<(i32, WordId)> = loose
        .history()
        .entries()
        .iter()
        .map(|e| (e.frame, e.wid))
        .collect();
    for e in tight.history().entries() {
        assert!(
            loose_exits.contains(&(e.frame, e.wid)),
            "exit {:?}@{} only present under the tighter beams",
            tight.dict().word_str(e.wid),
            e.frame
        );
    }
    assert_eq!(tight.result().unwrap().1, loose.result().unwrap().1);
}

#[test]
fn partial_result_mid_utterance() {
    let am = toy_am();
    let dict = toy_dict(&am);
    let lm = toy_lm(&dict);
    let script = script_for(&am, &["go", "forward"], &dict, 5);
    let scorer = ScriptScorer::new(&am, script);
    let n_sen = am.n_senones();
    let half = scorer.n_frames() / 2;

    let mut dec = Decoder::new(toy_config(), am, dict, lm).unwrap();
    dec.start_utt().unwrap();
    let mut buf = vec![0i32; n_sen];
    for f in 0..half {
        scorer.frame_scores(f, &mut buf);
        dec.frame(&buf).unwrap();
    }
    let (fr, partial) = dec.partial_result();
    assert!(fr > 0);
    assert!(partial.starts_with("go"), "partial = {partial:?}");
    dec.abort_utt();
    assert!(dec.result().is_none());
}

#[test]
fn short_utterance_yields_empty_hypothesis() {
    let (dec, _) = {
        let am = toy_am();
        let dict = toy_dict(&am);
        let lm = toy_lm(&dict);
        let script = vec![am.sil_phone(); 5];
        let mut scorer = ScriptScorer::new(&am, script);
        let n_sen = am.n_senones();
        let mut dec = Decoder::new(toy_config(), am, dict, lm).unwrap();
        dec.start_utt().unwrap();
        let mut buf = vec![0i32; n_sen];
        for f in 0..scorer.n_frames() {
            scorer.frame_scores(f, &mut buf);
            dec.frame(&buf).unwrap();
        }
        dec.finish_utt(Some(&mut scorer)).unwrap();
        (dec, scorer)
    };
    let (_, text) = dec.result().unwrap();
    assert!(text.is_empty());
}

#[test]
fn active_set_stepping_matches_full_scoring() {
    let words = ["go", "ten"];
    let (dec_full, _) = decode(toy_config(), &words, 5);

    let am = toy_am();
    let dict = toy_dict(&am);
    let lm = toy_lm(&dict);
    let script = script_for(&am, &words, &dict, 5);
    let mut scorer = ScriptScorer::new(&am, script);
    let n = scorer.n_frames();
    let cfg = Config {
        compallsen: false,
        ..toy_config()
    };
    let mut dec = Decoder::new(cfg, am, dict, lm).unwrap();
    dec.start_utt().unwrap();
    for _ in 0..n {
        dec.step(&mut scorer).unwrap();
    }
    dec.finish_utt(Some(&mut scorer)).unwrap();

    assert_eq!(dec.result().unwrap().1, dec_full.result().unwrap().1);
    assert_eq!(dec.result().unwrap().1, "go ten");
    assert!(dec.stats().n_senone_active > 0);
}
