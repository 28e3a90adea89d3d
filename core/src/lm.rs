//! N-gram language model interface and scoring wrapper.
//!
//! The decoder consumes any [`LanguageModel`] through [`CachedLm`], which
//! applies the language weight and word-insertion penalty and memoizes
//! trigram queries in an LRU cache (trigram lookups dominate the cross-word
//! transition cost in both forward passes).
//!
//! Word ids here are base word ids: alternative pronunciations are collapsed
//! by the caller before querying.

use crate::{logs, WordId};
use ahash::AHashMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::num::NonZeroUsize;
use std::path::Path;

/// Floor applied when an N-gram is entirely absent (about e^-20).
const FLOOR_LN: f64 = -20.0;

/// N-gram query interface in the integer log domain, unscaled.
pub trait LanguageModel {
    /// log P(w)
    fn ug(&self, w: WordId) -> i32;
    /// log P(w2 | w1)
    fn bg(&self, w1: WordId, w2: WordId) -> i32;
    /// log P(w3 | w1, w2)
    fn tg(&self, w1: WordId, w2: WordId, w3: WordId) -> i32;
    /// Whether the LM assigns this word a unigram.
    fn known_wid(&self, w: WordId) -> bool;
}

/// In-memory backoff N-gram model.
///
/// Missing trigrams fall back to the bigram, missing bigrams to the unigram,
/// missing unigrams to a fixed floor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NGramModel {
    unigram: AHashMap<WordId, i32>,
    bigram: AHashMap<(WordId, WordId), i32>,
    trigram: AHashMap<(WordId, WordId, WordId), i32>,
}

impl NGramModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a unigram as a linear probability.
    pub fn add_unigram(&mut self, w: WordId, prob: f64) {
        self.unigram.insert(w, logs::from_prob(prob));
    }

    /// Insert a bigram P(w2 | w1) as a linear probability.
    pub fn add_bigram(&mut self, w1: WordId, w2: WordId, prob: f64) {
        self.bigram.insert((w1, w2), logs::from_prob(prob));
    }

    /// Insert a trigram P(w3 | w1, w2) as a linear probability.
    pub fn add_trigram(&mut self, w1: WordId, w2: WordId, w3: WordId, prob: f64) {
        self.trigram.insert((w1, w2, w3), logs::from_prob(prob));
    }

    pub fn len(&self) -> usize {
        self.unigram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unigram.is_empty()
    }

    /// Save the model with bincode.
    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)?;
        Ok(())
    }

    /// Load a model saved by `save_bincode`.
    pub fn load_bincode<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let model: Self = bincode::deserialize_from(reader)?;
        Ok(model)
    }
}

impl LanguageModel for NGramModel {
    fn ug(&self, w: WordId) -> i32 {
        self.unigram
            .get(&w)
            .copied()
            .unwrap_or_else(|| logs::from_ln(FLOOR_LN))
    }

    fn bg(&self, w1: WordId, w2: WordId) -> i32 {
        self.bigram
            .get(&(w1, w2))
            .copied()
            .unwrap_or_else(|| self.ug(w2))
    }

    fn tg(&self, w1: WordId, w2: WordId, w3: WordId) -> i32 {
        self.trigram
            .get(&(w1, w2, w3))
            .copied()
            .unwrap_or_else(|| self.bg(w2, w3))
    }

    fn known_wid(&self, w: WordId) -> bool {
        self.unigram.contains_key(&w)
    }
}

/// Scoring wrapper: applies the language weight and word-insertion penalty
/// and caches trigram queries.
pub struct CachedLm<L> {
    lm: L,
    lw: f32,
    log_wip: i32,
    cache: RefCell<LruCache<(WordId, WordId, WordId), i32>>,
    hits: Cell<u64>,
    misses: Cell<u64>,
}

const TRIGRAM_CACHE_CAP: usize = 65536;

impl<L: LanguageModel> CachedLm<L> {
    pub fn new(lm: L, lw: f32, wip: f64) -> Self {
        Self {
            lm,
            lw,
            log_wip: logs::from_prob(wip),
            cache: RefCell::new(LruCache::new(
                NonZeroUsize::new(TRIGRAM_CACHE_CAP).unwrap(),
            )),
            hits: Cell::new(0),
            misses: Cell::new(0),
        }
    }

    fn scale(&self, raw: i32) -> i32 {
        (self.lw * raw as f32) as i32 + self.log_wip
    }

    pub fn inner(&self) -> &L {
        &self.lm
    }

    pub fn known_wid(&self, w: WordId) -> bool {
        self.lm.known_wid(w)
    }

    /// Scaled log P(w).
    pub fn ug_score(&self, w: WordId) -> i32 {
        self.scale(self.lm.ug(w))
    }

    /// Scaled log P(w | w1). `w1 < 0` degrades to the unigram.
    pub fn bg_score(&self, w: WordId, w1: WordId) -> i32 {
        if w1 < 0 {
            self.ug_score(w)
        } else {
            self.scale(self.lm.bg(w1, w))
        }
    }

    /// Scaled log P(w | w2, w1) with w1 the most recent predecessor.
    /// Degrades to bigram/unigram when history is missing.
    pub fn tg_score(&self, w: WordId, w1: WordId, w2: WordId) -> i32 {
        if w1 < 0 {
            return self.ug_score(w);
        }
        if w2 < 0 {
            return self.bg_score(w, w1);
        }
        let key = (w, w1, w2);
        if let Some(&v) = self.cache.borrow_mut().get(&key) {
            self.hits.set(self.hits.get() + 1);
            return v;
        }
        self.misses.set(self.misses.get() + 1);
        let v = self.scale(self.lm.tg(w2, w1, w));
        self.cache.borrow_mut().put(key, v);
        v
    }

    /// (hits, misses) over the trigram cache.
    pub fn cache_stats(&self) -> (u64, u64) {
        (self.hits.get(), self.misses.get())
    }

    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
        self.hits.set(0);
        self.misses.set(0);
    }
}
