// topology.rs
//
// Topology and route documents consumed at startup, plus the built-in demo grid
// used when no topology file is configured.

use crate::error::{ControlError, ControlResult};
use crate::shared_data::{lane_edge, EdgeId, IntersectionId, LaneId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

fn default_lanes() -> u32 {
    1
}

fn default_max_speed() -> f64 {
    13.89
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub id: EdgeId,
    /// Length in meters.
    pub length: f64,
    #[serde(default = "default_lanes")]
    pub lanes: u32,
    /// Speed limit in m/s.
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

impl EdgeSpec {
    pub fn lane_ids(&self) -> Vec<LaneId> {
        (0..self.lanes).map(|i| format!("{}_{}", self.id, i)).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub from: EdgeId,
    pub to: EdgeId,
}

/// Signal plan of one intersection. Each phase string carries one state character
/// per controlled lane, in the order of `controlled_lanes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntersectionSpec {
    pub id: IntersectionId,
    pub controlled_lanes: Vec<LaneId>,
    pub phases: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyDocument {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
    #[serde(default)]
    pub intersections: Vec<IntersectionSpec>,
}

impl TopologyDocument {
    pub fn load(path: impl AsRef<Path>) -> ControlResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| ControlError::Configuration(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str) -> ControlResult<Self> {
        let doc: TopologyDocument = serde_json::from_str(text)
            .map_err(|e| ControlError::Configuration(format!("malformed topology: {}", e)))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn validate(&self) -> ControlResult<()> {
        let node_ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut lanes_per_edge: HashMap<&str, u32> = HashMap::new();

        for edge in &self.edges {
            if lanes_per_edge.insert(edge.id.as_str(), edge.lanes).is_some() {
                return Err(config_error(format!("duplicate edge '{}'", edge.id)));
            }
            if !(edge.length.is_finite() && edge.length > 0.0) {
                return Err(config_error(format!(
                    "edge '{}' has invalid length {}",
                    edge.id, edge.length
                )));
            }
            if !(edge.max_speed.is_finite() && edge.max_speed > 0.0) {
                return Err(config_error(format!(
                    "edge '{}' has invalid max_speed {}",
                    edge.id, edge.max_speed
                )));
            }
            if edge.lanes == 0 {
                return Err(config_error(format!("edge '{}' has no lanes", edge.id)));
            }
            for node in edge.from.iter().chain(edge.to.iter()) {
                if !node_ids.is_empty() && !node_ids.contains(node.as_str()) {
                    return Err(config_error(format!(
                        "edge '{}' references unknown node '{}'",
                        edge.id, node
                    )));
                }
            }
        }

        for conn in &self.connections {
            for end in [&conn.from, &conn.to] {
                if !lanes_per_edge.contains_key(end.as_str()) {
                    return Err(config_error(format!(
                        "connection {} -> {} references unknown edge '{}'",
                        conn.from, conn.to, end
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for intersection in &self.intersections {
            if !seen.insert(intersection.id.as_str()) {
                return Err(config_error(format!(
                    "duplicate intersection '{}'",
                    intersection.id
                )));
            }
            if intersection.phases.is_empty() {
                return Err(config_error(format!(
                    "intersection '{}' has no phases",
                    intersection.id
                )));
            }
            for lane in &intersection.controlled_lanes {
                let known = lane
                    .rsplit_once('_')
                    .and_then(|(edge, idx)| {
                        let lanes = lanes_per_edge.get(edge)?;
                        idx.parse::<u32>().ok().map(|i| i < *lanes)
                    })
                    .unwrap_or(false);
                if !known {
                    return Err(config_error(format!(
                        "intersection '{}' controls unknown lane '{}'",
                        intersection.id, lane
                    )));
                }
            }
            for (index, state) in intersection.phases.iter().enumerate() {
                if state.chars().count() != intersection.controlled_lanes.len() {
                    return Err(config_error(format!(
                        "intersection '{}' phase {} has {} states for {} controlled lanes",
                        intersection.id,
                        index,
                        state.chars().count(),
                        intersection.controlled_lanes.len()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn all_lanes(&self) -> Vec<LaneId> {
        self.edges.iter().flat_map(|e| e.lane_ids()).collect()
    }
}

/// One precomputed route. `edges` may list lane ids; they are mapped to their edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub origin: String,
    pub destination: String,
    pub edges: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutesDocument {
    pub routes: Vec<RouteEntry>,
}

impl RoutesDocument {
    pub fn load(path: impl AsRef<Path>) -> ControlResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ControlError::Configuration(format!("{}: {}", path.display(), e)))
    }
}

fn config_error(msg: String) -> ControlError {
    ControlError::Configuration(msg)
}

/// Builds a `rows` x `cols` grid of two-way streets, 100 m blocks.
///
/// Edges are named `h<r><c>` (eastbound from node (r,c)), `v<r><c>` (southbound),
/// with `-` prefixed twins in the opposite direction. Every node with three or
/// more approaches becomes a signalized intersection `J<r><c>` with a two-way
/// split: horizontal approaches, then vertical approaches, each followed by a
/// yellow and an all-red phase.
pub fn demo_grid(rows: usize, cols: usize) -> TopologyDocument {
    let node_name = |r: usize, c: usize| format!("n{}{}", r, c);
    let mut nodes = Vec::new();
    for r in 0..rows {
        for c in 0..cols {
            nodes.push(NodeSpec {
                id: node_name(r, c),
                x: c as f64 * 100.0,
                y: r as f64 * 100.0,
            });
        }
    }

    // (edge id, from node, to node, horizontal?)
    let mut links: Vec<(String, String, String, bool)> = Vec::new();
    for r in 0..rows {
        for c in 0..cols {
            if c + 1 < cols {
                links.push((format!("h{}{}", r, c), node_name(r, c), node_name(r, c + 1), true));
                links.push((format!("-h{}{}", r, c), node_name(r, c + 1), node_name(r, c), true));
            }
            if r + 1 < rows {
                links.push((format!("v{}{}", r, c), node_name(r, c), node_name(r + 1, c), false));
                links.push((format!("-v{}{}", r, c), node_name(r + 1, c), node_name(r, c), false));
            }
        }
    }

    let edges = links
        .iter()
        .map(|(id, from, to, _)| EdgeSpec {
            id: id.clone(),
            length: 100.0,
            lanes: 1,
            max_speed: default_max_speed(),
            from: Some(from.clone()),
            to: Some(to.clone()),
        })
        .collect();

    // No U-turns.
    let mut connections = Vec::new();
    for (a, a_from, a_to, _) in &links {
        for (b, b_from, b_to, _) in &links {
            if b_from == a_to && b_to != a_from {
                connections.push(ConnectionSpec {
                    from: a.clone(),
                    to: b.clone(),
                });
            }
        }
    }

    let mut intersections = Vec::new();
    for r in 0..rows {
        for c in 0..cols {
            let node = node_name(r, c);
            let incoming: Vec<_> = links.iter().filter(|(_, _, to, _)| *to == node).collect();
            if incoming.len() < 3 {
                continue;
            }
            let horizontal: Vec<LaneId> = incoming
                .iter()
                .filter(|(_, _, _, h)| *h)
                .map(|(id, _, _, _)| format!("{}_0", id))
                .collect();
            let vertical: Vec<LaneId> = incoming
                .iter()
                .filter(|(_, _, _, h)| !*h)
                .map(|(id, _, _, _)| format!("{}_0", id))
                .collect();
            let (h, v) = (horizontal.len(), vertical.len());
            let state = |hc: char, vc: char| {
                let mut s = String::new();
                s.extend(std::iter::repeat(hc).take(h));
                s.extend(std::iter::repeat(vc).take(v));
                s
            };
            let phases = vec![
                state('G', 'r'),
                state('y', 'r'),
                state('r', 'r'),
                state('r', 'G'),
                state('r', 'y'),
                state('r', 'r'),
            ];
            let mut controlled_lanes = horizontal;
            controlled_lanes.extend(vertical);
            intersections.push(IntersectionSpec {
                id: format!("J{}{}", r, c),
                controlled_lanes,
                phases,
            });
        }
    }

    TopologyDocument {
        nodes,
        edges,
        connections,
        intersections,
    }
}

/// Edge id of every lane listed by an intersection, in plan order, de-duplicated.
pub fn approach_edges(intersection: &IntersectionSpec) -> Vec<EdgeId> {
    let mut seen = HashSet::new();
    intersection
        .controlled_lanes
        .iter()
        .map(|lane| lane_edge(lane).to_string())
        .filter(|edge| seen.insert(edge.clone()))
        .collect()
}
