use crate::config::RouteStrategyKind;
use crate::error::{ControlError, ControlResult};
use crate::network::graph::{NetworkConditions, NetworkGraph};
use crate::network::route_database::RouteDatabase;
use crate::shared_data::EdgeId;
use std::sync::Arc;

/// Picks a replacement path from the vehicle's current edge to its destination,
/// either by live search or from the precomputed corpus.
#[derive(Debug, Clone)]
pub struct Router {
    graph: Arc<NetworkGraph>,
    database: Option<Arc<RouteDatabase>>,
    strategy: RouteStrategyKind,
}

impl Router {
    pub fn new(
        graph: Arc<NetworkGraph>,
        database: Option<Arc<RouteDatabase>>,
        strategy: RouteStrategyKind,
    ) -> ControlResult<Self> {
        if strategy != RouteStrategyKind::Live && database.is_none() {
            return Err(ControlError::Configuration(format!(
                "route strategy {:?} needs a route database",
                strategy
            )));
        }
        Ok(Self {
            graph,
            database,
            strategy,
        })
    }

    pub fn live(graph: Arc<NetworkGraph>) -> Self {
        Self {
            graph,
            database: None,
            strategy: RouteStrategyKind::Live,
        }
    }

    pub fn graph(&self) -> &NetworkGraph {
        &self.graph
    }

    pub fn database(&self) -> Option<&RouteDatabase> {
        self.database.as_deref()
    }

    pub fn strategy(&self) -> RouteStrategyKind {
        self.strategy
    }

    /// Open path from `current` to `dest`, starting at `current`.
    pub fn find_route<C: NetworkConditions + ?Sized>(
        &self,
        conditions: &C,
        current: &str,
        dest: &str,
    ) -> ControlResult<Vec<EdgeId>> {
        let from_database = || {
            self.database
                .as_ref()
                .and_then(|db| db.best_suffix(&self.graph, conditions, current, dest))
        };
        let live = || {
            let path = self.graph.shortest_path(conditions, current, dest, true);
            (!path.is_empty()).then_some(path)
        };
        let found = match self.strategy {
            RouteStrategyKind::Live => live(),
            RouteStrategyKind::Database => from_database(),
            RouteStrategyKind::DatabaseThenLive => from_database().or_else(live),
        };
        found.ok_or_else(|| ControlError::NoRoute {
            from: current.to_string(),
            to: dest.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::graph::tests::{diamond_topology, ScriptedConditions};
    use crate::network::topology::{RouteEntry, RoutesDocument};

    fn setup() -> (Arc<NetworkGraph>, Arc<RouteDatabase>) {
        let graph = Arc::new(NetworkGraph::from_topology(&diamond_topology()).unwrap());
        let doc = RoutesDocument {
            routes: vec![RouteEntry {
                origin: "A".into(),
                destination: "D".into(),
                edges: vec!["A".into(), "C".into(), "D".into()],
            }],
        };
        let db = Arc::new(RouteDatabase::from_document(&doc, &graph).unwrap());
        (graph, db)
    }

    #[test]
    fn database_strategy_requires_database() {
        let (graph, _) = setup();
        assert!(Router::new(graph, None, RouteStrategyKind::Database).is_err());
    }

    #[test]
    fn strategies_differ_in_source() {
        let (graph, db) = setup();
        let conditions = ScriptedConditions::default();

        let live = Router::live(graph.clone());
        assert_eq!(
            live.find_route(&conditions, "A", "D").unwrap(),
            vec!["A", "B", "D"]
        );

        let database =
            Router::new(graph.clone(), Some(db.clone()), RouteStrategyKind::Database).unwrap();
        assert_eq!(
            database.find_route(&conditions, "A", "D").unwrap(),
            vec!["A", "C", "D"]
        );
        // Not in the corpus.
        assert!(matches!(
            database.find_route(&conditions, "B", "D"),
            Err(ControlError::NoRoute { .. })
        ));

        let hybrid = Router::new(graph, Some(db), RouteStrategyKind::DatabaseThenLive).unwrap();
        assert_eq!(
            hybrid.find_route(&conditions, "B", "D").unwrap(),
            vec!["B", "D"]
        );
    }

    #[test]
    fn no_open_path_is_a_routing_failure() {
        let (graph, _) = setup();
        let conditions = ScriptedConditions::default();
        conditions.close("D_0");
        let router = Router::live(graph);
        let err = router.find_route(&conditions, "A", "D").unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "no route from A to D");
    }
}
