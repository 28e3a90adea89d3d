//! Acoustic model tables consumed by the search passes.
//!
//! The decoder does not train or score Gaussians; it only needs the model's
//! shape: the CI phone inventory, tied transition matrices in the integer log
//! domain, the senone-sequence table mapping an ssid to one senone per
//! emitting state, and a triphone lookup keyed by (base, left, right,
//! word-position) that falls back to the CI phone when an untrained context
//! is requested.

use crate::{logs, PhoneId, SenId, SsId, TmatId};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Position of a phone within a word, part of the triphone key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WordPosition {
    Begin,
    Internal,
    End,
    Single,
}

type TriKey = (PhoneId, PhoneId, PhoneId, WordPosition);

/// Compiled acoustic model shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcousticModel {
    n_emit_state: usize,
    phone_names: Vec<String>,
    sil: PhoneId,
    /// tp[tmatid][from][to], to in 0..=n_emit_state; disallowed arcs hold
    /// WORST_SCORE.
    tmat: Vec<Vec<Vec<i32>>>,
    /// sseq[ssid][state] -> senone id.
    sseq: Vec<Vec<SenId>>,
    n_sen: usize,
    triphones: AHashMap<TriKey, SsId>,
}

impl AcousticModel {
    pub fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    pub fn n_senones(&self) -> usize {
        self.n_sen
    }

    pub fn n_ci(&self) -> usize {
        self.phone_names.len()
    }

    pub fn sil_phone(&self) -> PhoneId {
        self.sil
    }

    pub fn phone_id(&self, name: &str) -> Option<PhoneId> {
        self.phone_names
            .iter()
            .position(|p| p == name)
            .map(|i| i as PhoneId)
    }

    pub fn phone_name(&self, p: PhoneId) -> &str {
        &self.phone_names[p as usize]
    }

    /// Context-independent ssid for a phone. By construction the first
    /// `n_ci` ssids are the CI phones, in phone-id order.
    pub fn ci_ssid(&self, p: PhoneId) -> SsId {
        p as SsId
    }

    /// Triphone ssid for (base, left-context, right-context, position),
    /// falling back to the CI model when the context was never compiled.
    pub fn triphone_ssid(
        &self,
        base: PhoneId,
        lc: PhoneId,
        rc: PhoneId,
        pos: WordPosition,
    ) -> SsId {
        self.triphones
            .get(&(base, lc, rc, pos))
            .copied()
            .unwrap_or_else(|| self.ci_ssid(base))
    }

    /// Transition score tp[tmatid][from][to] in the log domain.
    ///
    /// `to == n_emit_state` addresses the non-emitting exit state. A
    /// `tmatid` outside the compiled set is an implementation bug in the
    /// caller, not a runtime condition.
    pub fn tprob(&self, tmatid: TmatId, from: usize, to: usize) -> i32 {
        debug_assert!(
            (tmatid as usize) < self.tmat.len(),
            "transition matrix {tmatid} not defined"
        );
        self.tmat[tmatid as usize][from][to]
    }

    pub fn sseq(&self, ssid: SsId) -> &[SenId] {
        &self.sseq[ssid as usize]
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

/// Incremental model construction, used by model compilers and tests.
pub struct AcousticModelBuilder {
    n_emit_state: usize,
    phone_names: Vec<String>,
    tmat: Vec<Vec<Vec<i32>>>,
    sseq: Vec<Vec<SenId>>,
    n_sen: usize,
    triphones: AHashMap<TriKey, SsId>,
}

impl AcousticModelBuilder {
    /// `n_emit_state` must be 3 or 5.
    pub fn new(n_emit_state: usize) -> Self {
        assert!(
            n_emit_state == 3 || n_emit_state == 5,
            "only 3- and 5-state topologies are supported"
        );
        Self {
            n_emit_state,
            phone_names: Vec::new(),
            tmat: Vec::new(),
            sseq: Vec::new(),
            n_sen: 0,
            triphones: AHashMap::new(),
        }
    }

    fn fresh_senones(&mut self) -> Vec<SenId> {
        let start = self.n_sen;
        self.n_sen += self.n_emit_state;
        (start..start + self.n_emit_state)
            .map(|s| s as SenId)
            .collect()
    }

    /// Left-to-right transition rows with self/next/skip arcs.
    fn default_tmat(&self) -> Vec<Vec<i32>> {
        let n = self.n_emit_state;
        let mut rows = Vec::with_capacity(n);
        for s in 0..n {
            let mut row = vec![logs::WORST_SCORE; n + 1];
            let arcs: Vec<usize> = (s..=s + 2).filter(|&t| t <= n).collect();
            let probs: &[f64] = match arcs.len() {
                3 => &[0.6, 0.3, 0.1],
                2 => &[0.65, 0.35],
                _ => &[1.0],
            };
            for (i, &t) in arcs.iter().enumerate() {
                row[t] = logs::from_prob(probs[i]);
            }
            rows.push(row);
        }
        rows
    }

    /// Add a CI phone; its phone id doubles as tmat id and CI ssid.
    pub fn add_phone(&mut self, name: &str) -> PhoneId {
        let p = self.phone_names.len() as PhoneId;
        self.phone_names.push(name.to_string());
        self.tmat.push(self.default_tmat());
        let sens = self.fresh_senones();
        self.sseq.push(sens);
        p
    }

    /// Override the transition rows of a phone's matrix.
    pub fn set_transitions(&mut self, p: PhoneId, rows: Vec<Vec<i32>>) {
        assert_eq!(rows.len(), self.n_emit_state);
        self.tmat[p as usize] = rows;
    }

    /// Add a triphone with its own senone sequence.
    pub fn add_triphone(
        &mut self,
        base: PhoneId,
        lc: PhoneId,
        rc: PhoneId,
        pos: WordPosition,
    ) -> SsId {
        let sens = self.fresh_senones();
        self.add_triphone_tied(base, lc, rc, pos, sens)
    }

    /// Add a triphone whose states map onto existing (tied) senones.
    pub fn add_triphone_tied(
        &mut self,
        base: PhoneId,
        lc: PhoneId,
        rc: PhoneId,
        pos: WordPosition,
        senones: Vec<SenId>,
    ) -> SsId {
        assert_eq!(senones.len(), self.n_emit_state);
        let ssid = self.sseq.len() as SsId;
        self.sseq.push(senones);
        self.triphones.insert((base, lc, rc, pos), ssid);
        ssid
    }

    pub fn build(self, sil_name: &str) -> Result<AcousticModel, crate::DecodeError> {
        let sil = self
            .phone_names
            .iter()
            .position(|p| p == sil_name)
            .ok_or_else(|| {
                crate::DecodeError::Config(format!("silence phone {sil_name} not in model"))
            })? as PhoneId;
        Ok(AcousticModel {
            n_emit_state: self.n_emit_state,
            phone_names: self.phone_names,
            sil,
            tmat: self.tmat,
            sseq: self.sseq,
            n_sen: self.n_sen,
            triphones: self.triphones,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> AcousticModel {
        let mut b = AcousticModelBuilder::new(3);
        b.add_phone("SIL");
        b.add_phone("G");
        b.add_phone("OW");
        b.build("SIL").unwrap()
    }

    #[test]
    fn ci_ssids_match_phone_ids() {
        let am = toy();
        let g = am.phone_id("G").unwrap();
        assert_eq!(am.ci_ssid(g), g);
        assert_eq!(am.sseq(am.ci_ssid(g)).len(), 3);
    }

    #[test]
    fn triphone_falls_back_to_ci() {
        let am = toy();
        let g = am.phone_id("G").unwrap();
        let ow = am.phone_id("OW").unwrap();
        let sil = am.sil_phone();
        assert_eq!(
            am.triphone_ssid(g, sil, ow, WordPosition::Begin),
            am.ci_ssid(g)
        );
    }

    #[test]
    fn transition_topology() {
        let am = toy();
        // self, +1, +2 defined; backward arc undefined
        assert!(am.tprob(0, 0, 0) > logs::WORST_SCORE);
        assert!(am.tprob(0, 0, 1) > logs::WORST_SCORE);
        assert!(am.tprob(0, 0, 2) > logs::WORST_SCORE);
        assert_eq!(am.tprob(0, 1, 0), logs::WORST_SCORE);
        // last emitting state reaches the exit state
        assert!(am.tprob(0, 2, 3) > logs::WORST_SCORE);
    }

    #[test]
    fn distinct_senones_per_phone() {
        let am = toy();
        let a: Vec<_> = am.sseq(0).to_vec();
        let b: Vec<_> = am.sseq(1).to_vec();
        assert!(a.iter().all(|s| !b.contains(s)));
        assert_eq!(am.n_senones(), 9);
    }
}
