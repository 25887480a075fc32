//! Trajectory connectivity: which trajectories have been tied together
//! by loop closures, and when they were last connected.

use std::collections::{BTreeMap, HashMap};

use crate::core::{Time, TrajectoryId};

/// Union-find over trajectory ids with per-pair last-connection times.
#[derive(Clone, Debug, Default)]
pub struct TrajectoryConnectivityState {
    /// Disjoint-set forest; roots map to themselves.
    parent: HashMap<TrajectoryId, TrajectoryId>,
    rank: HashMap<TrajectoryId, u32>,
    /// Last connection time per unordered pair, keyed (min, max).
    connection_times: BTreeMap<(TrajectoryId, TrajectoryId), Time>,
}

impl TrajectoryConnectivityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trajectory. Idempotent.
    pub fn add(&mut self, trajectory_id: TrajectoryId) {
        self.parent.entry(trajectory_id).or_insert(trajectory_id);
        self.rank.entry(trajectory_id).or_insert(0);
    }

    fn find(&mut self, trajectory_id: TrajectoryId) -> TrajectoryId {
        self.add(trajectory_id);
        let mut current = trajectory_id;
        // Path halving.
        loop {
            let parent = self.parent[&current];
            if parent == current {
                return current;
            }
            let grandparent = self.parent[&parent];
            self.parent.insert(current, grandparent);
            current = grandparent;
        }
    }

    /// Record a connection between two trajectories at `time`.
    ///
    /// Unions the components and raises the pair's last-connection time
    /// to `max(existing, time)`.
    pub fn connect(&mut self, a: TrajectoryId, b: TrajectoryId, time: Time) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            let (low, high) = if self.rank[&root_a] < self.rank[&root_b] {
                (root_a, root_b)
            } else {
                (root_b, root_a)
            };
            self.parent.insert(low, high);
            if self.rank[&root_a] == self.rank[&root_b] {
                *self.rank.get_mut(&high).expect("rank present") += 1;
            }
        }
        if a != b {
            let key = (a.min(b), a.max(b));
            let entry = self.connection_times.entry(key).or_insert(Time::MIN);
            *entry = (*entry).max(time);
        }
    }

    /// Whether two trajectories are in the same component.
    pub fn transitively_connected(&mut self, a: TrajectoryId, b: TrajectoryId) -> bool {
        a == b || self.find(a) == self.find(b)
    }

    /// Last recorded connection time for the pair.
    ///
    /// `Time::MAX` when `a == b` (a trajectory is always connected to
    /// itself), `Time::MIN` for a pair that was never directly connected.
    pub fn last_connection_time(&self, a: TrajectoryId, b: TrajectoryId) -> Time {
        if a == b {
            return Time::MAX;
        }
        self.connection_times
            .get(&(a.min(b), a.max(b)))
            .copied()
            .unwrap_or(Time::MIN)
    }

    /// The connected components, each sorted, ordered by smallest member.
    pub fn components(&mut self) -> Vec<Vec<TrajectoryId>> {
        let ids: Vec<TrajectoryId> = {
            let mut ids: Vec<_> = self.parent.keys().copied().collect();
            ids.sort_unstable();
            ids
        };
        let mut by_root: BTreeMap<TrajectoryId, Vec<TrajectoryId>> = BTreeMap::new();
        for id in ids {
            let root = self.find(id);
            by_root.entry(root).or_default().push(id);
        }
        let mut components: Vec<Vec<TrajectoryId>> = by_root.into_values().collect();
        components.sort_by_key(|c| c[0]);
        components
    }
}
