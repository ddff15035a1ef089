//! Maximum cardinality matching in bipartite graphs
//!
//! Hopcroft-Karp over a graph given as an adjacency list: `graph[u]` holds
//! the right-hand vertices u may be matched with. Returns, for every
//! left-hand vertex that could be matched, the index of its partner.
//!
//! The hub uses this to decide whether an import spec's parts can all be
//! assigned to distinct parts of a place.

use std::collections::VecDeque;

const INFINITY: usize = usize::MAX;

/// Compute a maximum matching. `right_count` is the number of right-hand
/// vertices; entries of `graph` must be smaller than it.
pub fn find_matching(graph: &[Vec<usize>], right_count: usize) -> Vec<Option<usize>> {
    // match_left[u] / match_right[v] hold the current partner, if any.
    let n = graph.len();
    let mut match_left: Vec<Option<usize>> = vec![None; n];
    let mut match_right: Vec<Option<usize>> = vec![None; right_count];
    let mut layer = vec![INFINITY; n];

    // Breadth-first search for the shortest augmenting paths: start at the
    // free left vertices, alternate unmatched and matched edges. Returns
    // whether any free right vertex was reached.
    fn bfs(
        graph: &[Vec<usize>],
        match_left: &[Option<usize>],
        match_right: &[Option<usize>],
        layer: &mut [usize],
    ) -> bool {
        let mut queue = VecDeque::new();
        for (u, m) in match_left.iter().enumerate() {
            if m.is_none() {
                layer[u] = 0;
                queue.push_back(u);
            } else {
                layer[u] = INFINITY;
            }
        }

        let mut found_free = false;
        let mut free_layer = INFINITY;

        while let Some(u) = queue.pop_front() {
            if layer[u] >= free_layer {
                continue;
            }
            for &v in &graph[u] {
                match match_right[v] {
                    None => {
                        found_free = true;
                        free_layer = free_layer.min(layer[u] + 1);
                    }
                    Some(next_u) => {
                        if layer[next_u] == INFINITY {
                            layer[next_u] = layer[u] + 1;
                            queue.push_back(next_u);
                        }
                    }
                }
            }
        }
        found_free
    }

    // Depth-first search along the layers found by the BFS, flipping
    // matched and unmatched edges along every augmenting path it finds.
    fn dfs(
        u: usize,
        graph: &[Vec<usize>],
        match_left: &mut [Option<usize>],
        match_right: &mut [Option<usize>],
        layer: &mut [usize],
    ) -> bool {
        for i in 0..graph[u].len() {
            let v = graph[u][i];
            let next = match_right[v];
            let advances = match next {
                None => true,
                Some(next_u) => {
                    layer[next_u] == layer[u] + 1
                        && dfs(next_u, graph, match_left, match_right, layer)
                }
            };
            if advances {
                match_left[u] = Some(v);
                match_right[v] = Some(u);
                return true;
            }
        }
        layer[u] = INFINITY;
        false
    }

    while bfs(graph, &match_left, &match_right, &mut layer) {
        for u in 0..n {
            if match_left[u].is_none() {
                dfs(u, graph, &mut match_left, &mut match_right, &mut layer);
            }
        }
    }

    match_left
}

/// Convenience wrapper: a perfect matching of every left vertex, or `None`
/// if one of them cannot be assigned.
pub fn find_perfect_matching(graph: &[Vec<usize>], right_count: usize) -> Option<Vec<usize>> {
    find_matching(graph, right_count)
        .into_iter()
        .collect::<Option<Vec<_>>>()
}
