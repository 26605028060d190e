// graph.rs
//
// Static road graph. Nodes are edges of the road network, arcs are the legal
// transitions between them. Built once at startup and shared read-only; the
// live parts (lane closures, travel times) come from a `NetworkConditions`.

use crate::error::{ControlError, ControlResult};
use crate::network::topology::TopologyDocument;
use crate::shared_data::{EdgeId, LaneId, VehicleClass};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Live network state the graph needs for blockage and travel-time queries.
pub trait NetworkConditions {
    /// Classes currently not allowed on the lane.
    fn lane_disallowed(&self, lane_id: &str) -> ControlResult<HashSet<VehicleClass>>;
    /// Current traversal-time estimate in seconds.
    fn edge_travel_time(&self, edge_id: &str) -> ControlResult<f64>;
}

/// Everything open, no live travel times. Used for offline route precomputation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticConditions;

impl NetworkConditions for StaticConditions {
    fn lane_disallowed(&self, _lane_id: &str) -> ControlResult<HashSet<VehicleClass>> {
        Ok(HashSet::new())
    }

    fn edge_travel_time(&self, edge_id: &str) -> ControlResult<f64> {
        Err(ControlError::Simulation(format!(
            "no live travel time for {}",
            edge_id
        )))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeWeight {
    #[default]
    Length,
    /// Live travel time, falling back to free-flow time when the query fails.
    TravelTime,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub id: EdgeId,
    pub length: f64,
    pub max_speed: f64,
    pub lanes: Vec<LaneId>,
}

impl Edge {
    pub fn free_flow_time(&self) -> f64 {
        self.length / self.max_speed.max(0.1)
    }
}

#[derive(Debug)]
pub struct NetworkGraph {
    edges: Vec<Edge>,
    index: HashMap<EdgeId, usize>,
    adjacency: Vec<Vec<usize>>,
    relevant_class: VehicleClass,
    weight: EdgeWeight,
}

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    cost: f64,
    seq: u64,
    edge: usize,
}

// Min-heap on cost, then on discovery order so equal-cost ties resolve to the
// first candidate discovered.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl NetworkGraph {
    pub fn from_topology(doc: &TopologyDocument) -> ControlResult<Self> {
        doc.validate()?;
        let mut edges = Vec::with_capacity(doc.edges.len());
        let mut index = HashMap::with_capacity(doc.edges.len());
        for spec in &doc.edges {
            index.insert(spec.id.clone(), edges.len());
            edges.push(Edge {
                id: spec.id.clone(),
                length: spec.length,
                max_speed: spec.max_speed,
                lanes: spec.lane_ids(),
            });
        }

        let mut adjacency = vec![Vec::new(); edges.len()];
        for conn in &doc.connections {
            let (from, to) = match (index.get(&conn.from), index.get(&conn.to)) {
                (Some(&from), Some(&to)) => (from, to),
                _ => {
                    return Err(ControlError::Configuration(format!(
                        "connection {} -> {} references an unknown edge",
                        conn.from, conn.to
                    )))
                }
            };
            let next: &mut Vec<usize> = &mut adjacency[from];
            if !next.contains(&to) {
                next.push(to);
            }
        }

        Ok(Self {
            edges,
            index,
            adjacency,
            relevant_class: VehicleClass::Passenger,
            weight: EdgeWeight::Length,
        })
    }

    pub fn with_weight(mut self, weight: EdgeWeight) -> Self {
        self.weight = weight;
        self
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.index.get(id).map(|&i| &self.edges[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                self.adjacency[i]
                    .iter()
                    .map(|&j| self.edges[j].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True iff every lane of the edge is closed to the relevant class.
    ///
    /// Fails open: a lane query error or an unknown edge reports the edge as open.
    pub fn is_blocked<C: NetworkConditions + ?Sized>(&self, conditions: &C, edge_id: &str) -> bool {
        match self.index.get(edge_id) {
            Some(&i) => self.is_blocked_at(conditions, i),
            None => false,
        }
    }

    fn is_blocked_at<C: NetworkConditions + ?Sized>(&self, conditions: &C, i: usize) -> bool {
        let lanes = &self.edges[i].lanes;
        if lanes.is_empty() {
            return false;
        }
        for lane in lanes {
            match conditions.lane_disallowed(lane) {
                Ok(disallowed) if disallowed.contains(&self.relevant_class) => {}
                Ok(_) => return false,
                Err(e) => {
                    log::debug!("[NetworkGraph] lane {} query failed, treating as open: {}", lane, e);
                    return false;
                }
            }
        }
        true
    }

    /// Live travel time, or free-flow time when no estimate is available.
    pub fn travel_time<C: NetworkConditions + ?Sized>(&self, conditions: &C, edge_id: &str) -> f64 {
        match self.edge(edge_id) {
            Some(edge) => conditions
                .edge_travel_time(edge_id)
                .ok()
                .filter(|t| t.is_finite() && *t >= 0.0)
                .unwrap_or_else(|| edge.free_flow_time()),
            None => 0.0,
        }
    }

    fn weight_at<C: NetworkConditions + ?Sized>(&self, conditions: &C, i: usize) -> f64 {
        let edge = &self.edges[i];
        match self.weight {
            EdgeWeight::Length => edge.length,
            EdgeWeight::TravelTime => self.travel_time(conditions, &edge.id),
        }
    }

    pub fn path_cost<C: NetworkConditions + ?Sized>(&self, conditions: &C, path: &[EdgeId]) -> f64 {
        path.iter()
            .filter_map(|id| self.index.get(id))
            .map(|&i| self.weight_at(conditions, i))
            .sum()
    }

    /// Dijkstra from `start` to `dest`. Expanding from an edge costs that edge's weight.
    ///
    /// With `avoid_blocked`, blocked candidate edges are never expanded; the start
    /// edge is exempt since the vehicle is already on it. Returns an empty path when
    /// either end is unknown or no path exists.
    pub fn shortest_path<C: NetworkConditions + ?Sized>(
        &self,
        conditions: &C,
        start: &str,
        dest: &str,
        avoid_blocked: bool,
    ) -> Vec<EdgeId> {
        let (start_idx, dest_idx) = match (self.index.get(start), self.index.get(dest)) {
            (Some(&s), Some(&d)) => (s, d),
            _ => {
                log::debug!("[NetworkGraph] unknown start '{}' or destination '{}'", start, dest);
                return Vec::new();
            }
        };
        if start_idx == dest_idx {
            return vec![self.edges[start_idx].id.clone()];
        }

        let n = self.edges.len();
        let mut dist = vec![f64::INFINITY; n];
        let mut parent: Vec<Option<usize>> = vec![None; n];
        let mut visited = vec![false; n];
        let mut blocked: Vec<Option<bool>> = vec![None; n];
        let mut heap = BinaryHeap::new();
        let mut seq = 0u64;

        dist[start_idx] = 0.0;
        heap.push(QueueEntry {
            cost: 0.0,
            seq,
            edge: start_idx,
        });

        while let Some(QueueEntry { cost, edge: u, .. }) = heap.pop() {
            if visited[u] {
                continue;
            }
            visited[u] = true;
            if u == dest_idx {
                break;
            }
            let weight = self.weight_at(conditions, u);
            for &v in &self.adjacency[u] {
                if visited[v] {
                    continue;
                }
                if avoid_blocked {
                    let is_blocked =
                        *blocked[v].get_or_insert_with(|| self.is_blocked_at(conditions, v));
                    if is_blocked {
                        continue;
                    }
                }
                let next_cost = cost + weight;
                if next_cost < dist[v] {
                    dist[v] = next_cost;
                    parent[v] = Some(u);
                    seq += 1;
                    heap.push(QueueEntry {
                        cost: next_cost,
                        seq,
                        edge: v,
                    });
                }
            }
        }

        if !dist[dest_idx].is_finite() {
            log::debug!("[NetworkGraph] no path found between {} and {}", start, dest);
            return Vec::new();
        }

        let mut path = Vec::new();
        let mut cursor = Some(dest_idx);
        while let Some(i) = cursor {
            path.push(self.edges[i].id.clone());
            cursor = parent[i];
        }
        path.reverse();
        path
    }
}
