use crate::config::HnswConfig;
use crate::index::{top_k, NearestNeighbors, Neighbor};
use crate::vector::EmbeddingMatrix;
use crate::{Error, Result};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Bit vector for visited node tracking during one layer search
struct VisitedSet {
    bits: Vec<u64>,
}

impl VisitedSet {
    #[inline]
    fn new(capacity: usize) -> Self {
        Self {
            bits: vec![0; (capacity + 63) / 64],
        }
    }

    #[inline]
    fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Returns true if `idx` was not yet visited.
    #[inline]
    fn insert(&mut self, idx: usize) -> bool {
        let word = idx / 64;
        let mask = 1u64 << (idx % 64);
        if word >= self.bits.len() {
            self.bits.resize(word + 1, 0);
        }
        let fresh = self.bits[word] & mask == 0;
        self.bits[word] |= mask;
        fresh
    }

    #[cfg(test)]
    fn contains(&self, idx: usize) -> bool {
        self.bits
            .get(idx / 64)
            .map(|w| w & (1u64 << (idx % 64)) != 0)
            .unwrap_or(false)
    }
}

/// Candidate ordered so the closest pops first from a max-heap
#[derive(Clone, Copy, PartialEq, Eq)]
struct Nearest {
    idx: usize,
    dist: OrderedFloat<f32>,
}

impl Ord for Nearest {
    fn cmp(&self, other: &Self) -> Ordering {
        other.dist.cmp(&self.dist).then_with(|| other.idx.cmp(&self.idx))
    }
}

impl PartialOrd for Nearest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Candidate ordered so the furthest pops first from a max-heap
#[derive(Clone, Copy, PartialEq, Eq)]
struct Furthest {
    idx: usize,
    dist: OrderedFloat<f32>,
}

impl Ord for Furthest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.cmp(&other.dist).then_with(|| self.idx.cmp(&other.idx))
    }
}

impl PartialOrd for Furthest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// HNSW index for approximate nearest neighbor search.
///
/// Level assignment draws from a seeded RNG, so the same rows in the same
/// order always produce the same graph. Searches borrow `&self` and keep
/// their visited set on the stack, so a published index can be queried
/// from many threads at once.
///
/// Recall is not guaranteed to be 100%: a query explores `max(ef_search, k)`
/// candidates on layer 0. Larger `ef_search` trades latency for recall; on
/// corpora of a few thousand papers the flat index is usually just as fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswIndex {
    ids: Vec<String>,
    vectors: EmbeddingMatrix,
    /// links[node][layer] = neighbor slots
    links: Vec<Vec<Vec<usize>>>,
    entry_point: Option<usize>,
    top_layer: usize,
    max_connections: usize,
    max_layers: usize,
    ef_construction: usize,
    ef_search: usize,
}

impl HnswIndex {
    pub fn build(config: &HnswConfig, seed: u64, ids: Vec<String>, vectors: &EmbeddingMatrix) -> Result<Self> {
        if ids.len() != vectors.rows() {
            return Err(Error::InvalidDimension {
                expected: ids.len(),
                actual: vectors.rows(),
            });
        }

        let mut index = Self {
            links: Vec::with_capacity(ids.len()),
            ids,
            vectors: vectors.clone(),
            entry_point: None,
            top_layer: 0,
            max_connections: config.max_connections.max(1),
            max_layers: config.max_layers.max(1),
            ef_construction: config.ef_construction.max(1),
            ef_search: config.ef_search.max(1),
        };

        let mut rng = StdRng::seed_from_u64(seed);
        let mut visited = VisitedSet::new(index.ids.len());
        for slot in 0..index.ids.len() {
            let level = index.select_layer(&mut rng);
            index.insert(slot, level, &mut visited);
        }
        Ok(index)
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Exponential decay, capped at `max_layers - 1`
    #[inline]
    fn select_layer(&self, rng: &mut StdRng) -> usize {
        let mut layer = 0;
        while layer < self.max_layers - 1 && rng.random::<f32>() < 0.5 {
            layer += 1;
        }
        layer
    }

    #[inline]
    fn distance(&self, query: &[f32], node: usize) -> f32 {
        1.0 - crate::simd::dot_product_simd(query, self.vectors.row(node))
    }

    #[inline]
    fn layer_capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.max_connections * 2
        } else {
            self.max_connections
        }
    }

    /// Best-first search on one layer; results sorted closest first.
    fn search_layer(
        &self,
        query: &[f32],
        entry: usize,
        ef: usize,
        layer: usize,
        visited: &mut VisitedSet,
    ) -> Vec<(usize, f32)> {
        visited.clear();

        let entry_dist = OrderedFloat(self.distance(query, entry));
        let mut candidates = BinaryHeap::with_capacity(ef * 2);
        let mut results = BinaryHeap::with_capacity(ef + 1);
        candidates.push(Nearest { idx: entry, dist: entry_dist });
        results.push(Furthest { idx: entry, dist: entry_dist });
        visited.insert(entry);

        while let Some(current) = candidates.pop() {
            let worst = results.peek().map(|f: &Furthest| f.dist).unwrap_or(entry_dist);
            if results.len() >= ef && current.dist > worst {
                break;
            }

            let Some(neighbors) = self.links[current.idx].get(layer) else {
                continue;
            };
            for &neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = OrderedFloat(self.distance(query, neighbor));
                let worst = results.peek().map(|f| f.dist).unwrap_or(dist);
                if results.len() < ef || dist < worst {
                    candidates.push(Nearest { idx: neighbor, dist });
                    results.push(Furthest { idx: neighbor, dist });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut found: Vec<(usize, f32)> = results.into_iter().map(|f| (f.idx, f.dist.0)).collect();
        found.sort_unstable_by(|a, b| OrderedFloat(a.1).cmp(&OrderedFloat(b.1)).then_with(|| a.0.cmp(&b.0)));
        found
    }

    /// Greedy descent through the upper layers down to `target_layer + 1`.
    fn descend(&self, query: &[f32], mut entry: usize, target_layer: usize, visited: &mut VisitedSet) -> usize {
        let mut layer = self.top_layer;
        while layer > target_layer {
            if let Some(&(closest, _)) = self.search_layer(query, entry, 1, layer, visited).first() {
                entry = closest;
            }
            layer -= 1;
        }
        entry
    }

    fn insert(&mut self, slot: usize, level: usize, visited: &mut VisitedSet) {
        self.links.push(vec![Vec::new(); level + 1]);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(slot);
            self.top_layer = level;
            return;
        };

        let query = self.vectors.row(slot).to_vec();
        let mut entry = self.descend(&query, entry, level, visited);

        for layer in (0..=level.min(self.top_layer)).rev() {
            let candidates = self.search_layer(&query, entry, self.ef_construction, layer, visited);
            let neighbors: Vec<usize> = candidates
                .iter()
                .map(|&(idx, _)| idx)
                .take(self.layer_capacity(layer))
                .collect();

            for &neighbor in &neighbors {
                self.links[neighbor][layer].push(slot);
                if self.links[neighbor][layer].len() > self.layer_capacity(layer) {
                    self.prune(neighbor, layer);
                }
            }
            self.links[slot][layer] = neighbors;

            if let Some(&(closest, _)) = candidates.first() {
                entry = closest;
            }
        }

        if level > self.top_layer {
            self.entry_point = Some(slot);
            self.top_layer = level;
        }
    }

    /// Keep only the closest `layer_capacity` links of `node` on `layer`.
    fn prune(&mut self, node: usize, layer: usize) {
        let base = self.vectors.row(node).to_vec();
        let mut connections = std::mem::take(&mut self.links[node][layer]);
        connections.sort_by_cached_key(|&other| {
            (OrderedFloat(crate::simd::squared_l2(&base, self.vectors.row(other))), other)
        });
        connections.truncate(self.layer_capacity(layer));
        self.links[node][layer] = connections;
    }
}

impl NearestNeighbors for HnswIndex {
    fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 || query.len() != self.vectors.dim() {
            return Vec::new();
        }

        let ef = self.ef_search.max(k);
        let mut visited = VisitedSet::new(self.ids.len());
        let entry = self.descend(query, entry, 0, &mut visited);
        let scored: Vec<(usize, f32)> = self
            .search_layer(query, entry, ef, 0, &mut visited)
            .into_iter()
            .map(|(idx, dist)| (idx, 1.0 - dist))
            .collect();
        top_k(scored, &self.ids, k)
    }

    fn size(&self) -> usize {
        self.ids.len()
    }

    fn dimension(&self) -> usize {
        self.vectors.dim()
    }
}
