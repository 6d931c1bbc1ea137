//! Candidate search: which issues are worth linking to a signal, and how similar they are.
//!
//! Two interchangeable strategies implement [`CandidateSearch`]:
//!
//! - **[`ExhaustiveSearch`]** scores a signal against every issue it is not
//!   yet associated with, by cosine similarity. Scores lie in `[-1, 1]`.
//! - **[`IndexedSearch`]** asks a [`NeighborIndex`] for the `top_k` issues
//!   nearest by squared L2 distance and converts each distance with
//!   [`distance_to_similarity`]. Scores lie in `(0, 1]`. Issues ranked
//!   below `top_k` are never seen.
//!
//! The two score scales are not comparable. The association method string
//! records which one produced a row.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::embedding::{cosine_with_norms, l2_norm};
use crate::index::{build_index, IndexKind, NeighborIndex};

/// One scored issue for a signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub issue_id: String,
    /// Backend-native value: cosine similarity or index distance.
    pub raw: f32,
    /// Similarity on the backend's scale; higher is closer.
    pub score: f64,
}

/// A strategy producing ranked issue candidates for one signal vector.
pub trait CandidateSearch: Send + Sync {
    /// Short strategy name, used as the prefix of the association method.
    fn name(&self) -> String;

    /// Dimensionality of the issue vectors, if any are loaded.
    fn dims(&self) -> Option<usize>;

    /// Candidates for `signal`, best first, excluding `associated` issue ids.
    fn candidates(&self, signal: &[f32], associated: Option<&HashSet<String>>) -> Result<Vec<Candidate>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Exhaustive,
    Indexed,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Exhaustive => "exhaustive",
            BackendKind::Indexed => "indexed",
        })
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exhaustive" => Ok(BackendKind::Exhaustive),
            "indexed" => Ok(BackendKind::Indexed),
            other => bail!("Unknown association backend: {}. Use exhaustive or indexed.", other),
        }
    }
}

/// Map an index distance to a similarity in `(0, 1]`: `1 / (1 + d)`.
///
/// Monotonically decreasing in `d`; a distance of zero maps to `1.0`.
/// Negative distances (rounding noise) are treated as zero. This is an
/// approximation tied to the indexed backend; it is not a cosine value.
pub fn distance_to_similarity(distance: f32) -> f64 {
    let d = f64::from(distance.max(0.0));
    1.0 / (1.0 + d)
}

/// Build the configured backend over all issue vectors.
///
/// For the indexed backend this is the blocking index-construction step
/// that must finish before any signal is queried.
pub fn build_backend(
    kind: BackendKind,
    index: IndexKind,
    top_k: usize,
    issues: Vec<(String, Vec<f32>)>,
) -> Result<Box<dyn CandidateSearch>> {
    match kind {
        BackendKind::Exhaustive => Ok(Box::new(ExhaustiveSearch::new(issues))),
        BackendKind::Indexed => Ok(Box::new(IndexedSearch::new(
            build_index(index, issues)?,
            index,
            top_k,
        ))),
    }
}

struct PreparedIssue {
    id: String,
    vector: Vec<f32>,
    norm: f32,
}

/// Full pairwise cosine comparison.
pub struct ExhaustiveSearch {
    issues: Vec<PreparedIssue>,
}

impl ExhaustiveSearch {
    pub fn new(issues: Vec<(String, Vec<f32>)>) -> Self {
        let issues = issues
            .into_iter()
            .map(|(id, vector)| {
                let norm = l2_norm(&vector);
                PreparedIssue { id, vector, norm }
            })
            .collect();
        Self { issues }
    }
}

impl CandidateSearch for ExhaustiveSearch {
    fn name(&self) -> String {
        "exhaustive".to_string()
    }

    fn dims(&self) -> Option<usize> {
        self.issues.first().map(|i| i.vector.len())
    }

    fn candidates(&self, signal: &[f32], associated: Option<&HashSet<String>>) -> Result<Vec<Candidate>> {
        let signal_norm = l2_norm(signal);
        let mut out = Vec::new();

        for issue in &self.issues {
            if associated.is_some_and(|a| a.contains(&issue.id)) {
                continue;
            }
            if issue.vector.len() != signal.len() {
                continue;
            }
            // Zero-norm pairs have no defined cosine and are skipped.
            if let Some(sim) = cosine_with_norms(signal, signal_norm, &issue.vector, issue.norm) {
                out.push(Candidate {
                    issue_id: issue.id.clone(),
                    raw: sim,
                    score: f64::from(sim),
                });
            }
        }

        out.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(out)
    }
}

/// Top-K nearest-neighbor lookup against a prebuilt index.
pub struct IndexedSearch {
    index: Box<dyn NeighborIndex>,
    kind: IndexKind,
    top_k: usize,
}

impl IndexedSearch {
    pub fn new(index: Box<dyn NeighborIndex>, kind: IndexKind, top_k: usize) -> Self {
        Self { index, kind, top_k }
    }
}

impl CandidateSearch for IndexedSearch {
    fn name(&self) -> String {
        format!("indexed-{}", self.kind)
    }

    fn dims(&self) -> Option<usize> {
        if self.index.is_empty() {
            None
        } else {
            Some(self.index.dims())
        }
    }

    fn candidates(&self, signal: &[f32], associated: Option<&HashSet<String>>) -> Result<Vec<Candidate>> {
        // Already-linked issues still occupy top-K slots; the query is not widened.
        let hits = self.index.query(signal, self.top_k)?;

        Ok(hits
            .into_iter()
            .filter(|(id, _)| !associated.is_some_and(|a| a.contains(id)))
            .map(|(issue_id, distance)| Candidate {
                issue_id,
                raw: distance,
                score: distance_to_similarity(distance),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issues() -> Vec<(String, Vec<f32>)> {
        vec![
            ("ENG-1".to_string(), vec![1.0, 0.0]),
            ("ENG-2".to_string(), vec![0.0, 1.0]),
            ("ENG-3".to_string(), vec![-1.0, 0.0]),
            ("ENG-4".to_string(), vec![0.0, 0.0]),
        ]
    }

    #[test]
    fn exhaustive_ranks_by_cosine_and_skips_zero_norm() {
        let search = ExhaustiveSearch::new(issues());
        let c = search.candidates(&[2.0, 1.0], None).unwrap();
        let ids: Vec<&str> = c.iter().map(|c| c.issue_id.as_str()).collect();
        assert_eq!(ids, vec!["ENG-1", "ENG-2", "ENG-3"]);
        assert!((c[0].score - 2.0 / 5f64.sqrt()).abs() < 1e-6);
        assert!((c[2].score + 2.0 / 5f64.sqrt()).abs() < 1e-6);
        for cand in &c {
            assert!((-1.0..=1.0).contains(&cand.score));
            assert_eq!(cand.score, f64::from(cand.raw));
        }
    }

    #[test]
    fn exhaustive_zero_signal_yields_nothing() {
        let search = ExhaustiveSearch::new(issues());
        assert!(search.candidates(&[0.0, 0.0], None).unwrap().is_empty());
    }

    #[test]
    fn exhaustive_excludes_associated() {
        let search = ExhaustiveSearch::new(issues());
        let linked: HashSet<String> = ["ENG-1".to_string()].into_iter().collect();
        let c = search.candidates(&[1.0, 0.0], Some(&linked)).unwrap();
        assert!(c.iter().all(|c| c.issue_id != "ENG-1"));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn exhaustive_skips_dimension_mismatch() {
        let search = ExhaustiveSearch::new(issues());
        assert!(search.candidates(&[1.0, 0.0, 0.0], None).unwrap().is_empty());
    }

    #[test]
    fn similarity_transform_bounds() {
        assert_eq!(distance_to_similarity(0.0), 1.0);
        assert_eq!(distance_to_similarity(1.0), 0.5);
        assert_eq!(distance_to_similarity(-1e-7), 1.0);
        let far = distance_to_similarity(1e30);
        assert!(far > 0.0 && far < 1e-20);
        assert!(distance_to_similarity(0.2) > distance_to_similarity(0.3));
    }

    #[test]
    fn indexed_applies_top_k_then_filters() {
        let search =
            build_backend(BackendKind::Indexed, IndexKind::Flat, 2, issues()).unwrap();
        assert_eq!(search.name(), "indexed-flat");

        let c = search.candidates(&[1.0, 0.0], None).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].issue_id, "ENG-1");
        assert_eq!(c[0].score, 1.0);
        // ENG-4 at the origin is the second nearest (distance 1).
        assert_eq!(c[1].issue_id, "ENG-4");
        assert_eq!(c[1].score, 0.5);

        // The linked issue is dropped without pulling in rank 3.
        let linked: HashSet<String> = ["ENG-1".to_string()].into_iter().collect();
        let c = search.candidates(&[1.0, 0.0], Some(&linked)).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].issue_id, "ENG-4");
        for cand in &c {
            assert!(cand.score > 0.0 && cand.score <= 1.0);
        }
    }

    #[test]
    fn backend_kind_parses() {
        assert_eq!("indexed".parse::<BackendKind>().unwrap(), BackendKind::Indexed);
        assert!("chroma".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Exhaustive.to_string(), "exhaustive");
    }
}
