//! XOR-distance selection and its verifiable proof
//!
//! Hash domains are fixed by the protocol and must stay bit-exact:
//! - summary = SHA256 over (hash ‖ distance) pairs sorted by hash
//! - proof   = SHA256(selected_hash ‖ selected_distance ‖ summary)

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use wes_primitives::H256;

use crate::error::{ConsensusError, ConsensusResult};
use crate::types::{CandidateBlock, DistanceResult, DistanceSelectionProof};

/// Winner of a selection plus whether the tie-break decided it.
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    /// The winning candidate and its distance
    pub result: DistanceResult,
    /// True when at least two candidates shared the winning distance
    pub tie_break_applied: bool,
}

/// The selection algorithm. Stateless; a pure function of the candidate
/// set and the parent hash.
pub struct DistanceSelector;

impl DistanceSelector {
    /// XOR distance of every candidate's hash to the parent hash.
    pub fn calculate_distances(
        candidates: &[CandidateBlock],
        parent_hash: &H256,
    ) -> Vec<DistanceResult> {
        candidates
            .iter()
            .map(|candidate| DistanceResult {
                distance: candidate.block_hash.xor(parent_hash),
                candidate: candidate.clone(),
            })
            .collect()
    }

    /// Linear argmin by lexicographic distance; exact ties go to the
    /// lexicographically smallest block hash.
    pub fn select_closest(results: &[DistanceResult]) -> ConsensusResult<SelectionOutcome> {
        let winner = results
            .iter()
            .min_by(|a, b| {
                a.distance
                    .cmp(&b.distance)
                    .then_with(|| a.candidate.block_hash.cmp(&b.candidate.block_hash))
            })
            .ok_or_else(|| ConsensusError::SelectionFailed("empty candidate set".to_string()))?;

        let tie_break_applied = results
            .iter()
            .filter(|r| r.distance == winner.distance)
            .count()
            > 1;

        debug!(
            selected = %winner.candidate.block_hash.short_hex(),
            distance = %winner.distance.short_hex(),
            tie_break_applied,
            total = results.len(),
            "candidate selected"
        );

        Ok(SelectionOutcome {
            result: winner.clone(),
            tie_break_applied,
        })
    }

    /// Builds the verifiable proof over the full distance set.
    pub fn generate_distance_proof(
        selected: &SelectionOutcome,
        all: &[DistanceResult],
    ) -> DistanceSelectionProof {
        let distance_summary_hash = summary_hash(all);
        let proof_hash = proof_hash(
            &selected.result.candidate.block_hash,
            &selected.result.distance,
            &distance_summary_hash,
        );

        DistanceSelectionProof {
            selected_hash: selected.result.candidate.block_hash,
            selected_distance: selected.result.distance,
            distance_summary_hash,
            generated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            tie_breaking_applied: selected.tie_break_applied,
            proof_hash,
        }
    }

    /// Audits an aggregator's claim from the candidate set and parent hash
    /// the verifier already holds.
    pub fn verify_distance_selection(
        selected: &CandidateBlock,
        candidates: &[CandidateBlock],
        parent_hash: &H256,
        proof: &DistanceSelectionProof,
    ) -> ConsensusResult<()> {
        if proof.selected_hash != selected.block_hash {
            return Err(ConsensusError::ProofVerification(
                "selected hash does not match proof".to_string(),
            ));
        }

        let expected_distance = selected.block_hash.xor(parent_hash);
        if proof.selected_distance != expected_distance {
            return Err(ConsensusError::ProofVerification(
                "selected distance does not match recomputation".to_string(),
            ));
        }

        let distances = Self::calculate_distances(candidates, parent_hash);
        let expected_summary = summary_hash(&distances);
        if proof.distance_summary_hash != expected_summary {
            return Err(ConsensusError::ProofVerification(
                "distance summary hash mismatch".to_string(),
            ));
        }

        let expected_proof = proof_hash(
            &proof.selected_hash,
            &proof.selected_distance,
            &proof.distance_summary_hash,
        );
        if proof.proof_hash != expected_proof {
            return Err(ConsensusError::ProofVerification(
                "proof hash mismatch".to_string(),
            ));
        }

        Ok(())
    }
}

/// SHA-256 over all (hash ‖ distance) pairs sorted ascending by hash.
fn summary_hash(results: &[DistanceResult]) -> H256 {
    let mut pairs: Vec<(&H256, &H256)> = results
        .iter()
        .map(|r| (&r.candidate.block_hash, &r.distance))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (hash, distance) in pairs {
        hasher.update(hash.as_bytes());
        hasher.update(distance.as_bytes());
    }
    H256::from_bytes(hasher.finalize().into())
}

fn proof_hash(selected_hash: &H256, selected_distance: &H256, summary: &H256) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(selected_hash.as_bytes());
    hasher.update(selected_distance.as_bytes());
    hasher.update(summary.as_bytes());
    H256::from_bytes(hasher.finalize().into())
}
