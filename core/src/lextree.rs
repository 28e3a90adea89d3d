//! Prefix-sharing lexical tree of triphone HMM channels.
//!
//! Root channels are keyed by a word's first diphone and multiplex their
//! entry ssid for cross-word left contexts. Interior channels are shared by
//! every word with the same senone-sequence prefix. The last phone of a
//! multi-phone word is not in the tree: it is allocated on demand as a
//! per-word list with one channel per distinct right-context model. Words
//! whose penultimate phone lands on a node hang off that node's homophone
//! list. Single-phone words live in a statically allocated flat table.
//!
//! Channels are arena-allocated; all inter-channel references are i32 ids
//! into the arena, and the interior of the tree is rebuilt whenever the
//! active language model changes.

use crate::amodel::AcousticModel;
use crate::dict::Dictionary;
use crate::hmm::Hmm;
use crate::lm::{CachedLm, LanguageModel};
use crate::{PhoneId, SsId, WordId, NO_WORD};
use ahash::AHashMap;
use tracing::info;

pub const NO_CHAN: i32 = -1;

/// Interior tree node or last-phone right-context channel.
#[derive(Debug)]
pub struct Channel {
    pub hmm: Hmm,
    /// First descendant (tree) or next right-context alternative (last
    /// phone).
    pub next: i32,
    /// Sibling sharing the same parent.
    pub alt: i32,
    pub ciphone: PhoneId,
    /// Head of the penultimate-phone homophone list (tree interior) or the
    /// right-context id (last-phone channels).
    pub info: i32,
}

/// Root node: one per distinct first diphone.
#[derive(Debug)]
pub struct RootChan {
    pub hmm: Hmm,
    pub next: i32,
    pub penult_wid: WordId,
    pub diphone: SsId,
    pub ciphone: PhoneId,
}

/// Channel pool with a free list; freed slots are recycled in place.
#[derive(Debug, Default)]
pub struct ChanArena {
    chans: Vec<Channel>,
    free: Vec<i32>,
}

impl ChanArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, c: Channel) -> i32 {
        match self.free.pop() {
            Some(id) => {
                self.chans[id as usize] = c;
                id
            }
            None => {
                self.chans.push(c);
                (self.chans.len() - 1) as i32
            }
        }
    }

    pub fn free(&mut self, id: i32) {
        self.free.push(id);
    }

    pub fn get(&self, id: i32) -> &Channel {
        &self.chans[id as usize]
    }

    pub fn get_mut(&mut self, id: i32) -> &mut Channel {
        &mut self.chans[id as usize]
    }
}

/// The compiled search tree plus single-phone word channels.
pub struct LexTree {
    pub roots: Vec<RootChan>,
    root_map: AHashMap<SsId, usize>,
    pub arena: ChanArena,
    /// Homophone chains through main-dictionary word ids.
    pub homophone: Vec<WordId>,
    /// Per word: head of its last-phone channel list (multi-phone words).
    pub word_chan: Vec<i32>,
    /// Statically allocated channels for single-phone words.
    pub single_chan: Vec<RootChan>,
    /// Word ids parallel to `single_chan`; the first `n_single_lm` entries
    /// are LM words (including `</s>`).
    pub single_wid: Vec<WordId>,
    pub n_single_lm: usize,
    oneph_idx: Vec<i32>,
    pub n_nonroot: usize,
    /// Active-list capacity: interior count plus slack for words added at
    /// run time.
    pub n_active_alloc: usize,
}

impl LexTree {
    /// Build the tree for the dictionary, restricted to words the language
    /// model knows when `lm` is given.
    pub fn build<L: LanguageModel>(
        dict: &Dictionary,
        am: &AcousticModel,
        lm: Option<&CachedLm<L>>,
    ) -> Self {
        debug_assert_eq!(am.n_ci(), dict.n_ci(), "dictionary compiled against a different model");
        let n_words = dict.n_words();
        let n_main = dict.n_main_words();

        let mut tree = LexTree {
            roots: Vec::new(),
            root_map: AHashMap::new(),
            arena: ChanArena::new(),
            homophone: vec![NO_WORD; n_main],
            word_chan: vec![NO_CHAN; n_words],
            single_chan: Vec::new(),
            single_wid: Vec::new(),
            n_single_lm: 0,
            oneph_idx: vec![-1; n_words],
            n_nonroot: 0,
            n_active_alloc: 0,
        };

        let known = |w: WordId| lm.map_or(true, |m| m.known_wid(dict.base_wid(w)));

        let mut oneph_main: Vec<WordId> = Vec::new();
        for w in 0..n_main as WordId {
            let de = dict.entry(w);
            if !known(w) {
                continue;
            }
            if de.len() == 1 {
                oneph_main.push(w);
                continue;
            }

            let ri = match tree.root_map.get(&de.ssids[0]) {
                Some(&ri) => ri,
                None => {
                    let ri = tree.roots.len();
                    tree.roots.push(RootChan {
                        hmm: Hmm::new(true, de.ssids[0], de.ci[0]),
                        next: NO_CHAN,
                        penult_wid: NO_WORD,
                        diphone: de.ssids[0],
                        ciphone: de.ci[0],
                    });
                    tree.root_map.insert(de.ssids[0], ri);
                    ri
                }
            };

            if de.len() == 2 {
                let head = tree.roots[ri].penult_wid;
                let head = tree.attach_homophone(head, w);
                tree.roots[ri].penult_wid = head;
                continue;
            }

            // Descend through interior positions, sharing prefixes by ssid.
            let mut cur = NO_CHAN; // NO_CHAN while still at the root
            for p in 1..de.len() - 1 {
                let ph = de.ssids[p];
                let ci = de.ci[p];
                let head = if cur == NO_CHAN {
                    tree.roots[ri].next
                } else {
                    tree.arena.get(cur).next
                };

                let mut found = NO_CHAN;
                let mut prev = NO_CHAN;
                let mut c = head;
                while c != NO_CHAN {
                    if tree.arena.get(c).hmm.ssid_at(0) == ph {
                        found = c;
                        break;
                    }
                    prev = c;
                    c = tree.arena.get(c).alt;
                }

                if found == NO_CHAN {
                    found = tree.arena.alloc(Channel {
                        hmm: Hmm::new(false, ph, ci),
                        next: NO_CHAN,
                        alt: NO_CHAN,
                        ciphone: ci,
                        info: NO_WORD,
                    });
                    tree.n_nonroot += 1;
                    if prev != NO_CHAN {
                        tree.arena.get_mut(prev).alt = found;
                    } else if cur == NO_CHAN {
                        tree.roots[ri].next = found;
                    } else {
                        tree.arena.get_mut(cur).next = found;
                    }
                }
                cur = found;
            }

            let head = tree.arena.get(cur).info;
            let head = tree.attach_homophone(head, w);
            tree.arena.get_mut(cur).info = head;
        }

        // Single-phone words: in-LM main words first, then </s>, then the
        // remaining special words and fillers.
        for &w in &oneph_main {
            tree.push_single(dict, w);
        }
        tree.n_single_lm = oneph_main.len() + 1; // </s> included
        for w in dict.finish_wid()..n_words as WordId {
            let special = w == dict.start_wid() || w == dict.finish_wid();
            if !special && !dict.is_filler(w) && !known(w) {
                continue;
            }
            tree.push_single(dict, w);
        }

        tree.n_active_alloc = tree.n_nonroot + 128;
        info!(
            roots = tree.roots.len(),
            nonroot = tree.n_nonroot,
            single = tree.single_wid.len(),
            "lexical tree built"
        );
        tree
    }

    fn push_single(&mut self, dict: &Dictionary, w: WordId) {
        let de = dict.entry(w);
        self.oneph_idx[w as usize] = self.single_chan.len() as i32;
        self.single_chan.push(RootChan {
            hmm: Hmm::new(false, de.ssids[0], de.ci[0]),
            next: NO_CHAN,
            penult_wid: NO_WORD,
            diphone: de.ssids[0],
            ciphone: de.ci[0],
        });
        self.single_wid.push(w);
    }

    fn attach_homophone(&mut self, head: WordId, w: WordId) -> WordId {
        if head < 0 {
            return w;
        }
        let mut j = head;
        while self.homophone[j as usize] >= 0 {
            j = self.homophone[j as usize];
        }
        self.homophone[j as usize] = w;
        head
    }

    /// Channel of a single-phone word, if it is one.
    pub fn single_index(&self, w: WordId) -> Option<usize> {
        let i = self.oneph_idx[w as usize];
        (i >= 0).then_some(i as usize)
    }

    pub fn single_of(&self, w: WordId) -> &RootChan {
        &self.single_chan[self.oneph_idx[w as usize] as usize]
    }

    pub fn single_of_mut(&mut self, w: WordId) -> &mut RootChan {
        &mut self.single_chan[self.oneph_idx[w as usize] as usize]
    }

    /// Ensure one last-phone channel exists per distinct right-context model
    /// of word `w`, keeping any channels already allocated.
    pub fn alloc_rc_channels(&mut self, dict: &Dictionary, w: WordId) {
        let de = dict.entry(w);
        debug_assert!(de.mpx && de.len() > 1);
        let rc_ssids: Vec<SsId> = dict.rc_ssids(de.r_diph).to_vec();
        let ci = de.last_ci();

        let head = self.word_chan[w as usize];
        let mut cur;
        if head == NO_CHAN || self.arena.get(head).hmm.ssid_at(0) != rc_ssids[0] {
            let id = self.arena.alloc(Channel {
                hmm: Hmm::new(false, rc_ssids[0], ci),
                next: head,
                alt: NO_CHAN,
                ciphone: ci,
                info: 0,
            });
            self.word_chan[w as usize] = id;
            cur = id;
        } else {
            cur = head;
        }

        for (i, &ssid) in rc_ssids.iter().enumerate().skip(1) {
            let next = self.arena.get(cur).next;
            if next == NO_CHAN || self.arena.get(next).hmm.ssid_at(0) != ssid {
                let id = self.arena.alloc(Channel {
                    hmm: Hmm::new(false, ssid, ci),
                    next,
                    alt: NO_CHAN,
                    ciphone: ci,
                    info: i as i32,
                });
                self.arena.get_mut(cur).next = id;
                cur = id;
            } else {
                cur = next;
            }
        }
    }

    /// Free the whole last-phone channel list of a word.
    pub fn free_rc_channels(&mut self, w: WordId) {
        let mut c = self.word_chan[w as usize];
        while c != NO_CHAN {
            let next = self.arena.get(c).next;
            self.arena.free(c);
            c = next;
        }
        self.word_chan[w as usize] = NO_CHAN;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amodel::AcousticModelBuilder;
    use crate::dict::DictionaryBuilder;
    use crate::lm::NGramModel;

    fn setup() -> (AcousticModel, Dictionary) {
        let mut b = AcousticModelBuilder::new(3);
        for p in ["SIL", "T", "EH", "N", "S", "M"] {
            b.add_phone(p);
        }
        let am = b.build("SIL").unwrap();
        let mut db = DictionaryBuilder::new();
        db.add_word("ten", &["T", "EH", "N"]);
        db.add_word("tent", &["T", "EH", "N", "T"]);
        db.add_word("tense", &["T", "EH", "N", "S"]);
        db.add_word("men", &["M", "EH", "N"]);
        db.add_word("em", &["M"]);
        let dict = db.build(&am).unwrap();
        (am, dict)
    }

    #[test]
    fn prefix_sharing() {
        let (am, dict) = setup();
        let tree = LexTree::build::<NGramModel>(&dict, &am, None);
        // "ten", "tent", "tense" share one root; "men" has its own
        assert_eq!(tree.roots.len(), 2);
        // shared interior: EH for the T-root (ten/tent/tense) and for men;
        // plus the N node for tent/tense (third phone of 4-phone words)
        assert_eq!(tree.n_nonroot, 3);
    }

    #[test]
    fn homophones_attach_to_penultimate_node() {
        let (am, dict) = setup();
        let tree = LexTree::build::<NGramModel>(&dict, &am, None);
        let ten = dict.word_id("ten").unwrap();
        let tent = dict.word_id("tent").unwrap();
        let tense = dict.word_id("tense").unwrap();

        // "ten" (3 phones) hangs off the EH interior node; "tent"/"tense"
        // (4 phones) hang off the N interior node.
        let mut found_ten = false;
        let mut found_four = Vec::new();
        for root in &tree.roots {
            let mut c = root.next;
            while c != NO_CHAN {
                let chan = tree.arena.get(c);
                let mut w = chan.info;
                while w >= 0 {
                    if w == ten {
                        found_ten = true;
                    }
                    w = tree.homophone[w as usize];
                }
                let mut g = chan.next;
                while g != NO_CHAN {
                    let gc = tree.arena.get(g);
                    let mut w = gc.info;
                    while w >= 0 {
                        found_four.push(w);
                        w = tree.homophone[w as usize];
                    }
                    g = gc.alt;
                }
                c = chan.alt;
            }
        }
        assert!(found_ten);
        assert!(found_four.contains(&tent));
        assert!(found_four.contains(&tense));
    }

    #[test]
    fn lm_restriction_drops_unknown_words() {
        let (am, dict) = setup();
        let mut lm = NGramModel::new();
        lm.add_unigram(dict.word_id("ten").unwrap(), 0.5);
        lm.add_unigram(dict.start_wid(), 0.1);
        lm.add_unigram(dict.finish_wid(), 0.1);
        let lm = CachedLm::new(lm, 1.0, 1.0);
        let tree = LexTree::build(&dict, &am, Some(&lm));
        // only "ten" survives -> one root, one interior node
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.n_nonroot, 1);
        // specials always present
        assert!(tree.single_index(dict.start_wid()).is_some());
        assert!(tree.single_index(dict.sil_wid()).is_some());
    }

    #[test]
    fn single_phone_words_not_in_tree() {
        let (am, dict) = setup();
        let tree = LexTree::build::<NGramModel>(&dict, &am, None);
        let em = dict.word_id("em").unwrap();
        assert!(tree.single_index(em).is_some());
        assert_eq!(tree.single_of(em).ciphone, dict.entry(em).first_ci());
        // </s> sits right after the main single-phone words
        assert_eq!(tree.single_wid[tree.n_single_lm - 1], dict.finish_wid());
    }

    #[test]
    fn rc_channels_deduplicate() {
        let (am, dict) = setup();
        let mut tree = LexTree::build::<NGramModel>(&dict, &am, None);
        let ten = dict.word_id("ten").unwrap();
        tree.alloc_rc_channels(&dict, ten);
        let n = {
            let mut n = 0;
            let mut c = tree.word_chan[ten as usize];
            while c != NO_CHAN {
                n += 1;
                c = tree.arena.get(c).next;
            }
            n
        };
        assert_eq!(n, dict.rc_count(dict.entry(ten).r_diph));
        // idempotent: a second allocation adds nothing
        tree.alloc_rc_channels(&dict, ten);
        let n2 = {
            let mut n = 0;
            let mut c = tree.word_chan[ten as usize];
            while c != NO_CHAN {
                n += 1;
                c = tree.arena.get(c).next;
            }
            n
        };
        assert_eq!(n, n2);
        tree.free_rc_channels(ten);
        assert_eq!(tree.word_chan[ten as usize], NO_CHAN);
    }
}
