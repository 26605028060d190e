use crate::error::{ControlError, ControlResult};
use crate::network::graph::{NetworkConditions, NetworkGraph};
use crate::network::topology::RoutesDocument;
use crate::shared_data::{lane_edge, EdgeId};
use std::collections::HashMap;

/// Precomputed full paths indexed by their final edge. Read-only once built.
#[derive(Debug, Default)]
pub struct RouteDatabase {
    routes: Vec<Vec<EdgeId>>,
    by_destination: HashMap<EdgeId, Vec<usize>>,
}

impl RouteDatabase {
    pub fn from_document(doc: &RoutesDocument, graph: &NetworkGraph) -> ControlResult<Self> {
        let mut db = RouteDatabase::default();
        for (n, entry) in doc.routes.iter().enumerate() {
            let mut path: Vec<EdgeId> = Vec::with_capacity(entry.edges.len());
            for token in &entry.edges {
                let edge = normalise(graph, token).ok_or_else(|| {
                    ControlError::Configuration(format!(
                        "route {} ({} -> {}) references unknown edge '{}'",
                        n, entry.origin, entry.destination, token
                    ))
                })?;
                if path.last().map(String::as_str) != Some(edge) {
                    path.push(edge.to_string());
                }
            }
            let last = match path.last() {
                Some(last) => last,
                None => {
                    return Err(ControlError::Configuration(format!(
                        "route {} ({} -> {}) is empty",
                        n, entry.origin, entry.destination
                    )))
                }
            };
            if normalise(graph, &entry.destination) != Some(last.as_str()) {
                return Err(ControlError::Configuration(format!(
                    "route {} ends at '{}' but declares destination '{}'",
                    n, last, entry.destination
                )));
            }
            db.insert(path);
        }
        log::info!(
            "[RouteDatabase] loaded {} unique routes to {} destinations",
            db.len(),
            db.by_destination.len()
        );
        Ok(db)
    }

    /// Builds the corpus from live shortest paths between the given pairs.
    pub fn precompute<C, I>(graph: &NetworkGraph, conditions: &C, pairs: I) -> Self
    where
        C: NetworkConditions + ?Sized,
        I: IntoIterator<Item = (EdgeId, EdgeId)>,
    {
        let mut db = RouteDatabase::default();
        for (origin, destination) in pairs {
            let path = graph.shortest_path(conditions, &origin, &destination, false);
            if path.len() > 1 {
                db.insert(path);
            }
        }
        db
    }

    /// Adds a path unless an identical one is already known.
    pub fn insert(&mut self, path: Vec<EdgeId>) -> bool {
        let Some(dest) = path.last().cloned() else {
            return false;
        };
        let slot = self.by_destination.entry(dest).or_default();
        if slot.iter().any(|&i| self.routes[i] == path) {
            return false;
        }
        slot.push(self.routes.len());
        self.routes.push(path);
        true
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Every known route in insertion order.
    pub fn routes(&self) -> &[Vec<EdgeId>] {
        &self.routes
    }

    /// All known full paths ending at `dest`.
    pub fn candidate_routes(&self, dest: &str) -> Vec<&[EdgeId]> {
        self.by_destination
            .get(dest)
            .map(|idx| idx.iter().map(|&i| self.routes[i].as_slice()).collect())
            .unwrap_or_default()
    }

    /// Cheapest open suffix, starting exactly at `current`, of any route to `dest`.
    ///
    /// Only edges after `current` are checked for blockage. Ties keep the first
    /// candidate in insertion order.
    pub fn best_suffix<C: NetworkConditions + ?Sized>(
        &self,
        graph: &NetworkGraph,
        conditions: &C,
        current: &str,
        dest: &str,
    ) -> Option<Vec<EdgeId>> {
        let mut best: Option<(f64, &[EdgeId])> = None;
        for route in self.candidate_routes(dest) {
            let Some(pos) = route.iter().position(|e| e == current) else {
                continue;
            };
            let suffix = &route[pos..];
            if suffix[1..].iter().any(|e| graph.is_blocked(conditions, e)) {
                continue;
            }
            let cost = graph.path_cost(conditions, suffix);
            if best.map_or(true, |(best_cost, _)| cost < best_cost) {
                best = Some((cost, suffix));
            }
        }
        best.map(|(_, suffix)| suffix.to_vec())
    }
}

fn normalise<'a>(graph: &NetworkGraph, token: &'a str) -> Option<&'a str> {
    if graph.contains(token) {
        return Some(token);
    }
    let edge = lane_edge(token);
    graph.contains(edge).then_some(edge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::graph::tests::{diamond_topology, ScriptedConditions};
    use crate::network::graph::StaticConditions;
    use crate::network::topology::{demo_grid, RouteEntry};

    fn entry(origin: &str, destination: &str, edges: &[&str]) -> RouteEntry {
        RouteEntry {
            origin: origin.to_string(),
            destination: destination.to_string(),
            edges: edges.iter().map(|e| e.to_string()).collect(),
        }
    }

    fn diamond_db(graph: &NetworkGraph) -> RouteDatabase {
        let doc = RoutesDocument {
            routes: vec![
                entry("A", "D", &["A_0", "B_0", "B_1", "D_0"]),
                entry("A", "D", &["A", "C", "D"]),
                entry("A", "D", &["A", "B", "D"]),
            ],
        };
        RouteDatabase::from_document(&doc, graph).unwrap()
    }

    #[test]
    fn lane_sequences_are_normalised_and_deduplicated() {
        let graph = NetworkGraph::from_topology(&diamond_topology()).unwrap();
        let db = diamond_db(&graph);
        assert_eq!(db.len(), 2);
        let candidates = db.candidate_routes("D");
        assert_eq!(candidates[0], ["A", "B", "D"]);
        assert_eq!(candidates[1], ["A", "C", "D"]);
        assert!(db.candidate_routes("B").is_empty());
    }

    #[test]
    fn unknown_edge_is_a_configuration_error() {
        let graph = NetworkGraph::from_topology(&diamond_topology()).unwrap();
        let doc = RoutesDocument {
            routes: vec![entry("A", "D", &["A", "Q", "D"])],
        };
        assert!(matches!(
            RouteDatabase::from_document(&doc, &graph),
            Err(ControlError::Configuration(_))
        ));
    }

    #[test]
    fn mismatched_destination_is_rejected() {
        let graph = NetworkGraph::from_topology(&diamond_topology()).unwrap();
        let doc = RoutesDocument {
            routes: vec![entry("A", "C", &["A", "B", "D"])],
        };
        assert!(RouteDatabase::from_document(&doc, &graph).is_err());
    }

    #[test]
    fn best_suffix_starts_at_current_and_skips_blocked() {
        let graph = NetworkGraph::from_topology(&diamond_topology()).unwrap();
        let db = diamond_db(&graph);
        let conditions = ScriptedConditions::default();

        assert_eq!(
            db.best_suffix(&graph, &conditions, "A", "D"),
            Some(vec!["A".to_string(), "B".to_string(), "D".to_string()])
        );
        assert_eq!(
            db.best_suffix(&graph, &conditions, "C", "D"),
            Some(vec!["C".to_string(), "D".to_string()])
        );

        conditions.close("B_0");
        conditions.close("B_1");
        assert_eq!(
            db.best_suffix(&graph, &conditions, "A", "D"),
            Some(vec!["A".to_string(), "C".to_string(), "D".to_string()])
        );
        assert_eq!(db.best_suffix(&graph, &conditions, "B", "D"), Some(vec!["B".to_string(), "D".to_string()]));

        conditions.close("C_0");
        assert_eq!(db.best_suffix(&graph, &conditions, "A", "D"), None);
    }

    #[test]
    fn precomputed_grid_routes_are_indexed_by_destination() {
        let doc = demo_grid(3, 3);
        let graph = NetworkGraph::from_topology(&doc).unwrap();
        let pairs = vec![
            ("h00".to_string(), "h21".to_string()),
            ("v00".to_string(), "h21".to_string()),
            ("h00".to_string(), "h00".to_string()),
        ];
        let db = RouteDatabase::precompute(&graph, &StaticConditions, pairs);
        assert_eq!(db.len(), 2);
        for route in db.candidate_routes("h21") {
            assert_eq!(route.last().map(String::as_str), Some("h21"));
        }
    }
}
