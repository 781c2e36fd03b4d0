//! Approximate nearest-neighbor index over embedded chunks.
//!
//! A single-layer navigable graph: every inserted vector links to its
//! nearest existing neighbors, search walks the graph greedily from a fixed
//! entry point. Small indices fall back to exact scan, so recall only
//! degrades once the graph is large enough for the walk to pay off.

use serde::{Deserialize, Serialize};

use crate::index::chunk::Chunk;

/// Bidirectional links created per insertion.
const GRAPH_NEIGHBORS: usize = 32;
/// Candidate list width while building the graph.
const EF_CONSTRUCTION: usize = 200;
/// Candidate list width while searching.
const EF_SEARCH: usize = 50;
/// Neighbor lists are pruned back once they grow past this.
const MAX_NEIGHBORS: usize = GRAPH_NEIGHBORS * 2;

/// One search result: the matched chunk and its cosine score.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub score: f32,
}

/// Serializable in-memory vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    dim: usize,
    vectors: Vec<Vec<f32>>,
    chunks: Vec<Chunk>,
    neighbors: Vec<Vec<usize>>,
    entry: Option<usize>,
}

impl VectorIndex {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        debug_assert!(dim > 0);
        Self {
            dim,
            vectors: Vec::new(),
            chunks: Vec::new(),
            neighbors: Vec::new(),
            entry: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Insert one vector and its chunk, wiring it into the graph.
    pub fn insert(&mut self, vector: Vec<f32>, chunk: Chunk) {
        debug_assert_eq!(vector.len(), self.dim);

        let id = self.vectors.len();
        let links = if self.entry.is_some() {
            self.walk(&vector, EF_CONSTRUCTION)
                .into_iter()
                .take(GRAPH_NEIGHBORS)
                .map(|(peer, _)| peer)
                .collect()
        } else {
            Vec::new()
        };

        self.vectors.push(vector);
        self.chunks.push(chunk);
        self.neighbors.push(links.clone());
        if self.entry.is_none() {
            self.entry = Some(id);
        }

        for peer in links {
            self.neighbors[peer].push(id);
            if self.neighbors[peer].len() > MAX_NEIGHBORS {
                self.prune(peer);
            }
        }
    }

    /// Top-k chunks by cosine similarity to `query`, best first.
    #[must_use]
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<SearchHit> {
        debug_assert_eq!(query.len(), self.dim);

        if self.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let ranked = if self.len() <= EF_SEARCH {
            self.scan(query)
        } else {
            self.walk(query, EF_SEARCH)
        };
        ranked
            .into_iter()
            .take(top_k)
            .map(|(id, score)| SearchHit {
                chunk: self.chunks[id].clone(),
                score,
            })
            .collect()
    }

    /// Exact scoring over every vector, best first.
    fn scan(&self, query: &[f32]) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(id, vector)| (id, cosine(query, vector)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
    }

    /// Greedy best-first walk from the entry point, keeping up to `ef`
    /// candidates. Returns visited nodes sorted best first.
    fn walk(&self, query: &[f32], ef: usize) -> Vec<(usize, f32)> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };

        let mut visited = vec![false; self.vectors.len()];
        visited[entry] = true;
        let entry_score = cosine(query, &self.vectors[entry]);
        // Frontier is sorted worst first so `pop` expands the best
        // candidate; results are sorted best first and capped at `ef`.
        let mut frontier = vec![(entry, entry_score)];
        let mut results = vec![(entry, entry_score)];

        while let Some((current, current_score)) = frontier.pop() {
            if results.len() >= ef {
                let worst = results.last().map_or(f32::MIN, |(_, score)| *score);
                if current_score < worst {
                    break;
                }
            }
            for &peer in &self.neighbors[current] {
                if visited[peer] {
                    continue;
                }
                visited[peer] = true;
                let score = cosine(query, &self.vectors[peer]);
                let worst = if results.len() >= ef {
                    results.last().map_or(f32::MIN, |(_, s)| *s)
                } else {
                    f32::MIN
                };
                if score > worst || results.len() < ef {
                    insert_descending(&mut results, (peer, score));
                    results.truncate(ef);
                    insert_ascending(&mut frontier, (peer, score));
                }
            }
        }
        results
    }

    /// Keep only the closest links of an overgrown neighbor list.
    fn prune(&mut self, id: usize) {
        let anchor = self.vectors[id].clone();
        let mut scored: Vec<(usize, f32)> = self.neighbors[id]
            .iter()
            .map(|&peer| (peer, cosine(&anchor, &self.vectors[peer])))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(GRAPH_NEIGHBORS);
        self.neighbors[id] = scored.into_iter().map(|(peer, _)| peer).collect();
    }
}

fn insert_descending(list: &mut Vec<(usize, f32)>, item: (usize, f32)) {
    let at = list
        .binary_search_by(|entry| item.1.total_cmp(&entry.1))
        .unwrap_or_else(|pos| pos);
    list.insert(at, item);
}

fn insert_ascending(list: &mut Vec<(usize, f32)>, item: (usize, f32)) {
    let at = list
        .binary_search_by(|entry| entry.1.total_cmp(&item.1))
        .unwrap_or_else(|pos| pos);
    list.insert(at, item);
}

/// Cosine similarity; zero vectors score zero against everything.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn chunk(text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            url: None,
        }
    }

    fn axis(dim: usize, at: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[at] = 1.0;
        v
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn small_index_ranks_exactly() {
        let mut index = VectorIndex::new(3);
        index.insert(axis(3, 0), chunk("x"));
        index.insert(axis(3, 1), chunk("y"));
        index.insert(axis(3, 2), chunk("z"));

        let hits = index.search(&[0.9, 0.1, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.text, "x");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = VectorIndex::new(4);
        assert!(index.search(&[1.0, 0.0, 0.0, 0.0], 5).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn graph_walk_finds_the_planted_match() {
        // Enough vectors to leave the exact-scan fallback.
        let mut index = VectorIndex::new(8);
        for i in 0..200 {
            let mut v = vec![0.0_f32; 8];
            v[i % 8] = 1.0;
            v[(i + 3) % 8] = 0.5;
            index.insert(v, chunk(&format!("filler-{i}")));
        }
        let mut target = vec![0.0_f32; 8];
        target[1] = 1.0;
        target[5] = 1.0;
        index.insert(target.clone(), chunk("planted"));

        let hits = index.search(&target, 5);
        assert!(
            hits.iter().any(|h| h.chunk.text == "planted"),
            "walk reaches the planted vector"
        );
    }

    #[test]
    fn serialization_roundtrip_preserves_search_results() {
        let mut index = VectorIndex::new(3);
        index.insert(axis(3, 0), chunk("x"));
        index.insert(axis(3, 1), chunk("y"));

        let encoded =
            bincode::serde::encode_to_vec(&index, bincode::config::standard()).expect("encode");
        let (decoded, _) = bincode::serde::decode_from_slice::<VectorIndex, _>(
            &encoded,
            bincode::config::standard(),
        )
        .expect("decode");

        let before = index.search(&axis(3, 0), 1);
        let after = decoded.search(&axis(3, 0), 1);
        assert_eq!(before, after);
    }

    proptest! {
        #[test]
        fn search_never_exceeds_top_k(count in 0usize..80, top_k in 0usize..12) {
            let mut index = VectorIndex::new(4);
            for i in 0..count {
                index.insert(axis(4, i % 4), chunk(&format!("c{i}")));
            }
            let hits = index.search(&axis(4, 0), top_k);
            prop_assert!(hits.len() <= top_k.min(count));
            for pair in hits.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
