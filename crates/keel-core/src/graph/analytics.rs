//! Graph analytics: cycles, importance, centrality, communities, coupling
//!
//! Pure functions over a [`CodeGraph`] snapshot. Results keyed by entity id
//! and sorted deterministically (score desc, then id).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

use super::snapshot::CodeGraph;

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

/// A strongly connected component with at least two members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    /// Members sorted by id
    pub members: Vec<String>,
}

impl Cycle {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|m| m == id)
    }
}

/// All cycles of size >= 2 (Tarjan SCC), largest first
pub fn detect_cycles(graph: &CodeGraph) -> Vec<Cycle> {
    let mut cycles: Vec<Cycle> = tarjan_scc(graph.graph())
        .into_iter()
        .filter(|component| component.len() >= 2)
        .map(|component| {
            let mut members: Vec<String> = component
                .into_iter()
                .map(|idx| graph.id_of(idx).to_string())
                .collect();
            members.sort();
            Cycle { members }
        })
        .collect();

    cycles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.members.cmp(&b.members)));
    cycles
}

// ---------------------------------------------------------------------------
// Importance ranking
// ---------------------------------------------------------------------------

/// PageRank parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankConfig {
    pub damping: f64,
    /// Stop once the L1 delta between iterations falls below this
    pub epsilon: f64,
    pub max_iterations: usize,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            damping: 0.85,
            epsilon: 1e-6,
            max_iterations: 100,
        }
    }
}

/// PageRank scores with convergence diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportanceRanking {
    pub scores: HashMap<String, f64>,
    pub iterations: usize,
    /// False when the iteration cap was hit first; scores are still usable
    pub converged: bool,
}

impl ImportanceRanking {
    pub fn score(&self, id: &str) -> f64 {
        self.scores.get(id).copied().unwrap_or(0.0)
    }

    /// Score scaled so the top-ranked entity is 1.0
    pub fn normalized(&self, id: &str) -> f64 {
        let max = self.scores.values().copied().fold(0.0, f64::max);
        if max <= 0.0 { 0.0 } else { self.score(id) / max }
    }

    /// Highest ranked entities, score desc then id
    pub fn top(&self, n: usize) -> Vec<(String, f64)> {
        sorted_scores(&self.scores).into_iter().take(n).collect()
    }
}

/// PageRank with dangling-mass redistribution
///
/// Edges point from dependent to dependency, so heavily depended-upon
/// entities accumulate rank. Never fails: hitting the iteration cap returns
/// the last iterate with `converged = false`.
pub fn importance_rank(graph: &CodeGraph, config: &RankConfig) -> ImportanceRanking {
    let n = graph.node_count();
    if n == 0 {
        return ImportanceRanking {
            converged: true,
            ..Default::default()
        };
    }

    let g = graph.graph();
    let out_adj: Vec<Vec<usize>> = g
        .node_indices()
        .map(|idx| {
            g.neighbors_directed(idx, Direction::Outgoing)
                .map(|n| n.index())
                .collect()
        })
        .collect();

    let init = 1.0 / n as f64;
    let mut rank = vec![init; n];
    let mut iterations = 0;
    let mut converged = false;

    while iterations < config.max_iterations {
        iterations += 1;
        let mut next = vec![0.0; n];
        let mut dangling_mass = 0.0;

        for (u, out) in out_adj.iter().enumerate() {
            if out.is_empty() {
                dangling_mass += rank[u];
                continue;
            }
            let share = rank[u] / out.len() as f64;
            for &v in out {
                next[v] += share;
            }
        }

        let teleport = (1.0 - config.damping) / n as f64;
        let dangling_share = dangling_mass / n as f64;
        for value in next.iter_mut() {
            *value = teleport + config.damping * (*value + dangling_share);
        }

        let delta: f64 = next.iter().zip(rank.iter()).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < config.epsilon {
            converged = true;
            break;
        }
    }

    let scores = g
        .node_indices()
        .map(|idx| (graph.id_of(idx).to_string(), rank[idx.index()]))
        .collect();

    ImportanceRanking {
        scores,
        iterations,
        converged,
    }
}

// ---------------------------------------------------------------------------
// Betweenness centrality
// ---------------------------------------------------------------------------

/// Brandes betweenness over directed shortest paths, scaled to `[0, 1]`
pub fn betweenness(graph: &CodeGraph) -> HashMap<String, f64> {
    let g = graph.graph();
    let n = g.node_count();
    let mut cb = vec![0.0f64; n];

    for s in g.node_indices() {
        let mut stack: Vec<usize> = Vec::new();
        let mut pred: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0f64; n];
        let mut dist = vec![-1i64; n];

        sigma[s.index()] = 1.0;
        dist[s.index()] = 0;

        let mut queue = VecDeque::new();
        queue.push_back(s);

        while let Some(v) = queue.pop_front() {
            let vi = v.index();
            stack.push(vi);
            for w in g.neighbors_directed(v, Direction::Outgoing) {
                let wi = w.index();
                if dist[wi] < 0 {
                    dist[wi] = dist[vi] + 1;
                    queue.push_back(w);
                }
                if dist[wi] == dist[vi] + 1 {
                    sigma[wi] += sigma[vi];
                    pred[wi].push(vi);
                }
            }
        }

        let mut delta = vec![0.0f64; n];
        while let Some(w) = stack.pop() {
            for &v in &pred[w] {
                if sigma[w] > 0.0 {
                    delta[v] += (sigma[v] / sigma[w]) * (1.0 + delta[w]);
                }
            }
            if w != s.index() {
                cb[w] += delta[w];
            }
        }
    }

    let max = cb.iter().copied().fold(0.0, f64::max);
    g.node_indices()
        .map(|idx| {
            let raw = cb[idx.index()];
            let value = if max > 0.0 { raw / max } else { 0.0 };
            (graph.id_of(idx).to_string(), value)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Community detection
// ---------------------------------------------------------------------------

/// Community assignment with its modularity score
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Communities {
    /// Entity id to dense community id
    pub assignments: HashMap<String, usize>,
    pub count: usize,
    /// Newman modularity of the assignment, in `[-0.5, 1]`
    pub modularity: f64,
}

impl Communities {
    /// Members of each community, sorted
    pub fn groups(&self) -> Vec<Vec<String>> {
        let mut groups: Vec<Vec<String>> = vec![Vec::new(); self.count];
        for (id, &c) in &self.assignments {
            if let Some(group) = groups.get_mut(c) {
                group.push(id.clone());
            }
        }
        for group in &mut groups {
            group.sort();
        }
        groups
    }
}

/// Greedy modularity clustering (one Louvain local-moving level)
///
/// Edge direction is ignored. Deterministic: nodes are visited in id order and
/// ties go to the lowest community id.
pub fn communities(graph: &CodeGraph) -> Communities {
    let g = graph.graph();
    let n = g.node_count();
    if n == 0 {
        return Communities::default();
    }

    let adj = undirected_adjacency(graph);
    let degree: Vec<f64> = adj.iter().map(|nbrs| nbrs.len() as f64).collect();
    let m2: f64 = degree.iter().sum();

    let mut community: Vec<usize> = (0..n).collect();
    if m2 > 0.0 {
        let mut tot: Vec<f64> = degree.clone();
        for _pass in 0..20 {
            let mut moved_any = false;
            for u in 0..n {
                let current = community[u];

                let mut weights: BTreeMap<usize, f64> = BTreeMap::new();
                for &v in &adj[u] {
                    *weights.entry(community[v]).or_insert(0.0) += 1.0;
                }

                tot[current] -= degree[u];

                let stay_gain =
                    weights.get(&current).copied().unwrap_or(0.0) - degree[u] * tot[current] / m2;
                let mut best = current;
                let mut best_gain = stay_gain;
                for (&c, &k_in) in &weights {
                    let gain = k_in - degree[u] * tot[c] / m2;
                    if gain > best_gain + 1e-12 {
                        best_gain = gain;
                        best = c;
                    }
                }

                community[u] = best;
                tot[best] += degree[u];
                if best != current {
                    moved_any = true;
                }
            }
            if !moved_any {
                break;
            }
        }
    }

    // Dense ids in first-seen order
    let mut dense: BTreeMap<usize, usize> = BTreeMap::new();
    let mut next = 0;
    for c in community.iter_mut() {
        let id = *dense.entry(*c).or_insert_with(|| {
            let d = next;
            next += 1;
            d
        });
        *c = id;
    }

    let modularity = modularity(&adj, &community, next);
    let assignments = g
        .node_indices()
        .map(|idx| (graph.id_of(idx).to_string(), community[idx.index()]))
        .collect();

    Communities {
        assignments,
        count: next,
        modularity,
    }
}

fn modularity(adj: &[Vec<usize>], community: &[usize], count: usize) -> f64 {
    let m2: f64 = adj.iter().map(|n| n.len() as f64).sum();
    if m2 == 0.0 {
        return 0.0;
    }

    let mut internal = vec![0.0f64; count];
    let mut total = vec![0.0f64; count];
    for (u, nbrs) in adj.iter().enumerate() {
        total[community[u]] += nbrs.len() as f64;
        for &v in nbrs {
            if community[u] == community[v] {
                internal[community[u]] += 1.0;
            }
        }
    }

    (0..count)
        .map(|c| internal[c] / m2 - (total[c] / m2).powi(2))
        .sum()
}

fn undirected_adjacency(graph: &CodeGraph) -> Vec<Vec<usize>> {
    let g = graph.graph();
    let mut adj: Vec<HashSet<usize>> = vec![HashSet::new(); g.node_count()];
    for edge in g.edge_indices() {
        if let Some((a, b)) = g.edge_endpoints(edge) {
            adj[a.index()].insert(b.index());
            adj[b.index()].insert(a.index());
        }
    }
    adj.into_iter()
        .map(|set| {
            let mut v: Vec<usize> = set.into_iter().collect();
            v.sort_unstable();
            v
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Coupling metrics
// ---------------------------------------------------------------------------

/// Afferent/efferent coupling of one entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CouplingMetrics {
    /// Entities depending on this one
    pub afferent: usize,
    /// Entities this one depends on
    pub efferent: usize,
    /// `efferent / (afferent + efferent)`, 0 for an isolated entity
    pub instability: f64,
}

/// Coupling metrics for every entity
pub fn coupling(graph: &CodeGraph) -> HashMap<String, CouplingMetrics> {
    let g = graph.graph();
    g.node_indices()
        .map(|idx| {
            let afferent = distinct_neighbors(graph, idx, Direction::Incoming);
            let efferent = distinct_neighbors(graph, idx, Direction::Outgoing);
            let total = afferent + efferent;
            let instability = if total == 0 {
                0.0
            } else {
                efferent as f64 / total as f64
            };
            (
                graph.id_of(idx).to_string(),
                CouplingMetrics {
                    afferent,
                    efferent,
                    instability,
                },
            )
        })
        .collect()
}

fn distinct_neighbors(graph: &CodeGraph, idx: NodeIndex, direction: Direction) -> usize {
    graph
        .graph()
        .neighbors_directed(idx, direction)
        .collect::<HashSet<_>>()
        .len()
}

// ---------------------------------------------------------------------------
// Reachability
// ---------------------------------------------------------------------------

/// An entity reached by a traversal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectedEntity {
    pub id: String,
    /// Hops from the nearest seed
    pub distance: usize,
    /// Normalized betweenness, when known
    pub centrality: f64,
}

/// Entities transitively affected by a change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlastRadius {
    /// Seed files that resolved to graph nodes
    pub seeds: Vec<String>,
    /// Seed files with no node in the graph
    pub unknown: Vec<String>,
    /// Affected entities, excluding the seeds, nearest first
    pub affected: Vec<AffectedEntity>,
    pub total_entities: usize,
    /// `affected / total_entities * 100`
    pub percentage: f64,
}

impl BlastRadius {
    pub fn affected_ids(&self) -> Vec<&str> {
        self.affected.iter().map(|a| a.id.as_str()).collect()
    }
}

/// Reverse BFS from the entities in `files` along incoming edges
///
/// Everything that (transitively) depends on a changed file is affected.
pub fn blast_radius(graph: &CodeGraph, files: &[String], max_depth: usize) -> BlastRadius {
    let (seeds, seed_ids, unknown) = resolve_seeds(graph, files);
    let reached = bfs(graph, &seeds, max_depth, Direction::Incoming);

    let affected: Vec<AffectedEntity> = reached
        .into_iter()
        .map(|(idx, distance)| AffectedEntity {
            id: graph.id_of(idx).to_string(),
            distance,
            centrality: 0.0,
        })
        .collect();

    let total_entities = graph.node_count();
    let percentage = if total_entities == 0 {
        0.0
    } else {
        affected.len() as f64 / total_entities as f64 * 100.0
    };

    BlastRadius {
        seeds: seed_ids,
        unknown,
        affected,
        total_entities,
        percentage,
    }
}

/// Forward closure of `files` along outgoing edges, bounded by `depth`
///
/// Returns the dependencies (excluding the seeds), nearest first.
pub fn expand_scope(graph: &CodeGraph, files: &[String], depth: usize) -> Vec<AffectedEntity> {
    let (seeds, _, _) = resolve_seeds(graph, files);
    bfs(graph, &seeds, depth, Direction::Outgoing)
        .into_iter()
        .map(|(idx, distance)| AffectedEntity {
            id: graph.id_of(idx).to_string(),
            distance,
            centrality: 0.0,
        })
        .collect()
}

fn resolve_seeds(graph: &CodeGraph, files: &[String]) -> (Vec<NodeIndex>, Vec<String>, Vec<String>) {
    let mut seeds = Vec::new();
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for file in files {
        let nodes = graph.nodes_for_path(file);
        if nodes.is_empty() {
            unknown.push(file.clone());
        } else {
            known.push(file.clone());
            seeds.extend(nodes);
        }
    }
    seeds.sort();
    seeds.dedup();
    known.sort();
    known.dedup();
    unknown.sort();
    unknown.dedup();
    (seeds, known, unknown)
}

fn bfs(
    graph: &CodeGraph,
    seeds: &[NodeIndex],
    max_depth: usize,
    direction: Direction,
) -> Vec<(NodeIndex, usize)> {
    let g = graph.graph();
    let mut seen: HashSet<NodeIndex> = seeds.iter().copied().collect();
    let mut queue: VecDeque<(NodeIndex, usize)> = seeds.iter().map(|&s| (s, 0)).collect();
    let mut reached = Vec::new();

    while let Some((node, distance)) = queue.pop_front() {
        if distance >= max_depth {
            continue;
        }
        for next in g.neighbors_directed(node, direction) {
            if seen.insert(next) {
                reached.push((next, distance + 1));
                queue.push_back((next, distance + 1));
            }
        }
    }

    reached.sort_by(|a, b| {
        a.1.cmp(&b.1)
            .then_with(|| graph.id_of(a.0).cmp(graph.id_of(b.0)))
    });
    reached
}

/// Sort a score map by score desc, then id
pub fn sorted_scores(scores: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut items: Vec<(String, f64)> = scores.iter().map(|(k, v)| (k.clone(), *v)).collect();
    items.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    items
}
