//! Static partition of agents into clusters, and the per-cycle fan-out that
//! runs one worker thread per cluster.
//!
//! Each worker receives exclusive access to the slots of its own agents, so
//! no two workers ever write the same agent's results. Everything else a
//! worker reads is shared immutably.

/// Round-robin partition: agent `i` belongs to cluster `i % clusters`.
/// Never returns an empty cluster.
pub fn partition(num_agents: usize, max_clusters: usize) -> Vec<Vec<usize>> {
    let clusters = max_clusters.max(1).min(num_agents);
    let mut out = vec![Vec::new(); clusters];
    for agent in 0..num_agents {
        out[agent % clusters].push(agent);
    }
    out
}

/// Runs `work(agent, slot)` for every clustered agent, one scoped thread per
/// cluster, and returns once all of them have finished. `slots[i]` belongs to
/// agent `i`; agents outside every cluster are left untouched.
pub fn run_clusters<S, F>(clusters: &[Vec<usize>], slots: &mut [S], work: F)
where
    S: Send,
    F: Fn(usize, &mut S) + Sync,
{
    let mut owner = vec![None; slots.len()];
    for (c, members) in clusters.iter().enumerate() {
        for &agent in members {
            if agent < owner.len() {
                owner[agent] = Some(c);
            }
        }
    }

    let mut buckets: Vec<Vec<(usize, &mut S)>> = clusters
        .iter()
        .map(|members| Vec::with_capacity(members.len()))
        .collect();
    for (agent, slot) in slots.iter_mut().enumerate() {
        if let Some(c) = owner[agent] {
            buckets[c].push((agent, slot));
        }
    }

    let work = &work;
    std::thread::scope(|scope| {
        for bucket in buckets {
            scope.spawn(move || {
                for (agent, slot) in bucket {
                    work(agent, slot);
                }
            });
        }
    });
}
