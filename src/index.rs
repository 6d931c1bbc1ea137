//! Nearest-neighbor indexes over issue vectors.
//!
//! The indexed association backend builds one [`NeighborIndex`] per run and
//! queries it once per signal. Distances are squared Euclidean (L2) for
//! every provider, smaller meaning closer.
//!
//! | Kind | Type | Recall |
//! |------|------|--------|
//! | `flat` | [`FlatIndex`] | exact, O(n) per query |
//! | `hnsw` | `HnswIndex` (feature `hnsw`) | approximate graph search |

use anyhow::{bail, Result};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::embedding::squared_l2_distance;

/// A built, read-only nearest-neighbor index keyed by issue identifier.
pub trait NeighborIndex: Send + Sync {
    /// Vector dimensionality every entry and query must match.
    fn dims(&self) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The `k` nearest entries to `vector`, closest first, as `(id, distance)`.
    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f32)>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    #[default]
    Flat,
    Hnsw,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Flat => "flat",
            IndexKind::Hnsw => "hnsw",
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat" => Ok(IndexKind::Flat),
            "hnsw" => Ok(IndexKind::Hnsw),
            other => bail!("Unknown index kind: {}. Use flat or hnsw.", other),
        }
    }
}

/// Build an index of the given kind over `entries`.
///
/// All vectors must share one dimensionality. An empty entry list yields an
/// empty index whose queries return nothing.
pub fn build_index(kind: IndexKind, entries: Vec<(String, Vec<f32>)>) -> Result<Box<dyn NeighborIndex>> {
    match kind {
        IndexKind::Flat => Ok(Box::new(FlatIndex::build(entries)?)),
        #[cfg(feature = "hnsw")]
        IndexKind::Hnsw => Ok(Box::new(HnswIndex::build(entries)?)),
        #[cfg(not(feature = "hnsw"))]
        IndexKind::Hnsw => bail!("association.index = \"hnsw\" requires --features hnsw"),
    }
}

fn uniform_dims(entries: &[(String, Vec<f32>)]) -> Result<usize> {
    let dims = entries.first().map(|(_, v)| v.len()).unwrap_or(0);
    for (id, v) in entries {
        if v.len() != dims {
            bail!(
                "cannot index {}: vector has {} dims, expected {}",
                id,
                v.len(),
                dims
            );
        }
    }
    Ok(dims)
}

/// Exact index: scans every entry per query.
pub struct FlatIndex {
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
    dims: usize,
}

impl FlatIndex {
    pub fn build(entries: Vec<(String, Vec<f32>)>) -> Result<Self> {
        let dims = uniform_dims(&entries)?;
        let (ids, vectors) = entries.into_iter().unzip();
        Ok(Self { ids, vectors, dims })
    }
}

impl NeighborIndex for FlatIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != self.dims {
            bail!(
                "query vector has {} dims, index has {}",
                vector.len(),
                self.dims
            );
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, squared_l2_distance(vector, v)))
            .collect();

        let k = k.min(scored.len());
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, |a, b| a.1.total_cmp(&b.1));
            scored.truncate(k);
        }
        // Ties resolve by insertion order so results are deterministic.
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        Ok(scored
            .into_iter()
            .map(|(i, d)| (self.ids[i].clone(), d))
            .collect())
    }
}

/// Approximate HNSW index backed by `hora`, using the Euclidean metric.
#[cfg(feature = "hnsw")]
pub struct HnswIndex {
    index: hora::index::hnsw_idx::HNSWIndex<f32, usize>,
    ids: Vec<String>,
    dims: usize,
}

#[cfg(feature = "hnsw")]
impl HnswIndex {
    pub fn build(entries: Vec<(String, Vec<f32>)>) -> Result<Self> {
        use hora::core::ann_index::ANNIndex;
        use hora::core::metrics::Metric;
        use hora::index::hnsw_idx::HNSWIndex;
        use hora::index::hnsw_params::HNSWParams;

        let dims = uniform_dims(&entries)?;
        let mut index = HNSWIndex::<f32, usize>::new(dims, &HNSWParams::<f32>::default());
        let mut ids = Vec::with_capacity(entries.len());

        for (i, (id, vector)) in entries.into_iter().enumerate() {
            index
                .add(&vector, i)
                .map_err(|e| anyhow::anyhow!("failed to add {} to HNSW index: {}", id, e))?;
            ids.push(id);
        }

        if !ids.is_empty() {
            index
                .build(Metric::Euclidean)
                .map_err(|e| anyhow::anyhow!("failed to build HNSW index: {}", e))?;
        }

        Ok(Self { index, ids, dims })
    }
}

#[cfg(feature = "hnsw")]
impl NeighborIndex for HnswIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        use hora::core::ann_index::ANNIndex;

        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != self.dims {
            bail!(
                "query vector has {} dims, index has {}",
                vector.len(),
                self.dims
            );
        }

        let mut hits = Vec::with_capacity(k);
        for (node, distance) in self.index.search_nodes(vector, k) {
            if let Some(i) = *node.idx() {
                if let Some(id) = self.ids.get(i) {
                    hits.push((id.clone(), distance));
                }
            }
        }
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<(String, Vec<f32>)> {
        vec![
            ("ENG-1".to_string(), vec![0.0, 0.0]),
            ("ENG-2".to_string(), vec![1.0, 0.0]),
            ("ENG-3".to_string(), vec![3.0, 4.0]),
            ("ENG-4".to_string(), vec![-2.0, 0.0]),
        ]
    }

    #[test]
    fn flat_returns_k_nearest_in_order() {
        let index = FlatIndex::build(entries()).unwrap();
        let hits = index.query(&[0.9, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "ENG-2");
        assert_eq!(hits[1].0, "ENG-1");
        assert!((hits[0].1 - 0.01).abs() < 1e-6);
        assert!((hits[1].1 - 0.81).abs() < 1e-6);
    }

    #[test]
    fn flat_k_larger_than_index() {
        let index = FlatIndex::build(entries()).unwrap();
        let hits = index.query(&[0.0, 0.0], 50).unwrap();
        assert_eq!(hits.len(), 4);
        let distances: Vec<f32> = hits.iter().map(|h| h.1).collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(hits[3], ("ENG-3".to_string(), 25.0));
    }

    #[test]
    fn flat_empty_index_returns_nothing() {
        let index = FlatIndex::build(Vec::new()).unwrap();
        assert!(index.is_empty());
        assert!(index.query(&[1.0, 2.0, 3.0], 5).unwrap().is_empty());
    }

    #[test]
    fn flat_rejects_mixed_dims() {
        let mut e = entries();
        e.push(("ENG-9".to_string(), vec![1.0, 2.0, 3.0]));
        assert!(FlatIndex::build(e).is_err());
    }

    #[test]
    fn flat_rejects_wrong_query_dims() {
        let index = FlatIndex::build(entries()).unwrap();
        assert!(index.query(&[1.0, 2.0, 3.0], 1).is_err());
    }

    #[test]
    fn index_kind_parses() {
        assert_eq!("flat".parse::<IndexKind>().unwrap(), IndexKind::Flat);
        assert_eq!("hnsw".parse::<IndexKind>().unwrap(), IndexKind::Hnsw);
        assert!("ivf".parse::<IndexKind>().is_err());
    }

    #[cfg(not(feature = "hnsw"))]
    #[test]
    fn hnsw_requires_feature() {
        assert!(build_index(IndexKind::Hnsw, entries()).is_err());
    }

    #[cfg(feature = "hnsw")]
    #[test]
    fn hnsw_finds_exact_match() {
        let index = build_index(IndexKind::Hnsw, entries()).unwrap();
        let hits = index.query(&[3.0, 4.0], 1).unwrap();
        assert_eq!(hits[0].0, "ENG-3");
    }
}
