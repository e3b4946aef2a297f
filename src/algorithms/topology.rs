//! Relay graph queries
//!
//! The topology is a simple undirected graph whose vertices are relays and
//! whose edge weights are physical distances. All path queries run
//! Dijkstra with deterministic tie-breaking on the vertex id, so the same
//! graph always yields the same routes regardless of insertion order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use tracing::trace;

use crate::core::{NodeId, Position, Relay, POSITION_EPSILON};
use crate::validation::error::{LocatorError, LocatorResult};

/// Shortest path between two relays with the distance already covered at each vertex
#[derive(Debug, Clone, PartialEq)]
struct Route {
    vertices: Vec<NodeId>,
    cumulative: Vec<f64>,
}

impl Route {
    fn weight(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    fn index_of(&self, vertex: NodeId) -> Option<usize> {
        self.vertices.iter().position(|&v| v == vertex)
    }

    /// Index of the route edge joining `a` and `b`, and whether the route walks it from `a` to `b`
    fn edge_index(&self, a: NodeId, b: NodeId) -> Option<(usize, bool)> {
        self.vertices.windows(2).enumerate().find_map(|(k, pair)| {
            if pair[0] == a && pair[1] == b {
                Some((k, true))
            } else if pair[0] == b && pair[1] == a {
                Some((k, false))
            } else {
                None
            }
        })
    }

    fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.vertices.windows(2).map(|pair| (pair[0], pair[1]))
    }
}

#[derive(Debug)]
struct State {
    cost: f64,
    vertex: NodeId,
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for State {}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap, lower vertex id first on equal cost
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.vertex.cmp(&self.vertex))
    }
}

/// Weighted relay graph
#[derive(Debug, Clone, Default)]
pub struct TopologyAnalyzer {
    relays: BTreeMap<NodeId, Relay>,
    adjacency: BTreeMap<NodeId, BTreeMap<NodeId, f64>>,
}

impl TopologyAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Small demonstration network: 1003 and 1004 branch off 1002, which is 100 units from 1001
    pub fn sample() -> Self {
        let mut topology = Self::new();
        let edges = [(1001, 1002, 100.0), (1003, 1002, 70.0), (1002, 1004, 50.0)];
        for (start, end, weight) in edges {
            let added = topology.add_edge(start, end, weight);
            debug_assert!(added.is_ok(), "sample edge {}-{} rejected", start, end);
        }
        topology
    }

    /// Registers a relay with the default radius, keeping an existing entry untouched
    pub fn add_relay(&mut self, id: NodeId) -> LocatorResult<()> {
        if !self.relays.contains_key(&id) {
            let relay = Relay::new(id)?;
            self.relays.insert(id, relay);
            self.adjacency.entry(id).or_default();
        }
        Ok(())
    }

    /// Registers a relay with an explicit radius, replacing any earlier radius
    pub fn add_relay_with_radius(&mut self, id: NodeId, radius: f64) -> LocatorResult<()> {
        let relay = Relay::with_radius(id, radius)?;
        self.relays.insert(id, relay);
        self.adjacency.entry(id).or_default();
        Ok(())
    }

    /// Adds or re-weights an undirected edge, creating unknown relays on the fly
    pub fn add_edge(&mut self, start: NodeId, end: NodeId, weight: f64) -> LocatorResult<()> {
        if start == end || !weight.is_finite() || weight < 0.0 {
            return Err(LocatorError::InvalidEdge { start, end, weight });
        }
        self.add_relay(start)?;
        self.add_relay(end)?;
        self.adjacency.entry(start).or_default().insert(end, weight);
        self.adjacency.entry(end).or_default().insert(start, weight);
        Ok(())
    }

    pub fn relay(&self, id: NodeId) -> Option<&Relay> {
        self.relays.get(&id)
    }

    pub fn contains_relay(&self, id: NodeId) -> bool {
        self.relays.contains_key(&id)
    }

    pub fn relays(&self) -> impl Iterator<Item = &Relay> {
        self.relays.values()
    }

    pub fn radius(&self, id: NodeId) -> LocatorResult<f64> {
        self.relay(id)
            .map(|r| r.radius)
            .ok_or(LocatorError::NotFound(id))
    }

    pub fn edge_weight(&self, a: NodeId, b: NodeId) -> Option<f64> {
        self.adjacency.get(&a).and_then(|n| n.get(&b)).copied()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(|n| n.len()).sum::<usize>() / 2
    }

    fn shortest_path(&self, from: NodeId, to: NodeId) -> LocatorResult<Route> {
        for id in [from, to] {
            if !self.contains_relay(id) {
                return Err(LocatorError::NotFound(id));
            }
        }
        if from == to {
            return Ok(Route {
                vertices: vec![from],
                cumulative: vec![0.0],
            });
        }

        let mut distances: BTreeMap<NodeId, f64> = BTreeMap::new();
        let mut previous: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        let mut heap = BinaryHeap::new();

        distances.insert(from, 0.0);
        heap.push(State {
            cost: 0.0,
            vertex: from,
        });

        while let Some(State { cost, vertex }) = heap.pop() {
            if vertex == to {
                break;
            }
            if let Some(&d) = distances.get(&vertex) {
                if cost > d {
                    continue;
                }
            }

            if let Some(neighbours) = self.adjacency.get(&vertex) {
                for (&next, &weight) in neighbours {
                    let candidate = cost + weight;
                    let better = distances.get(&next).map_or(true, |&d| candidate < d);
                    if better {
                        distances.insert(next, candidate);
                        previous.insert(next, vertex);
                        heap.push(State {
                            cost: candidate,
                            vertex: next,
                        });
                    }
                }
            }
        }

        if !distances.contains_key(&to) {
            return Err(LocatorError::NoPath { from, to });
        }

        let mut vertices = vec![to];
        let mut current = to;
        while let Some(&p) = previous.get(&current) {
            vertices.push(p);
            current = p;
            if current == from {
                break;
            }
        }
        vertices.reverse();

        let mut cumulative = Vec::with_capacity(vertices.len());
        let mut covered = 0.0;
        cumulative.push(covered);
        for pair in vertices.windows(2) {
            covered += self.edge_weight(pair[0], pair[1]).unwrap_or(0.0);
            cumulative.push(covered);
        }

        trace!(from, to, weight = covered, hops = vertices.len() - 1, "shortest path");
        Ok(Route {
            vertices,
            cumulative,
        })
    }

    /// Length of the shortest path between two relays
    pub fn distance(&self, from: NodeId, to: NodeId) -> LocatorResult<f64> {
        Ok(self.shortest_path(from, to)?.weight())
    }

    /// Re-expresses a position on a multi-edge route relative to the single edge containing it.
    ///
    /// The returned position is oriented in travel direction.
    pub fn graph_edge_position(&self, position: &Position) -> LocatorResult<Position> {
        let Position::Anchored {
            start,
            dest,
            offset,
            ..
        } = *position
        else {
            return Err(LocatorError::InvariantViolation(format!(
                "cannot locate the edge of an unanchored position ({})",
                position
            )));
        };
        if position.is_degenerate() {
            return Ok(*position);
        }

        let route = self.shortest_path(start, dest)?;
        let mut left = offset;
        for (k, (a, b)) in route.edges().enumerate() {
            let weight = route.cumulative[k + 1] - route.cumulative[k];
            if weight + POSITION_EPSILON >= left {
                return Ok(Position::anchored(a, b, left.min(weight), weight));
            }
            left -= weight;
        }

        Err(LocatorError::InvariantViolation(format!(
            "offset {} exceeds the {} units between relay {} and relay {}",
            offset,
            route.weight(),
            start,
            dest
        )))
    }

    /// Re-expresses an edge position relative to the shortest route from `start` to `end`
    pub fn total_route_position(
        &self,
        edge_position: &Position,
        start: NodeId,
        end: NodeId,
    ) -> LocatorResult<Position> {
        let Position::Anchored {
            start: edge_start,
            dest: edge_end,
            offset,
            length,
        } = *edge_position
        else {
            return Err(LocatorError::InvariantViolation(format!(
                "cannot place an unanchored position on route {}-{}",
                start, end
            )));
        };

        let route = self.shortest_path(start, end)?;
        let total = route.weight();
        let not_in_route = LocatorError::NoSuchEdgeInRoute {
            edge_start,
            edge_end,
            start,
            end,
        };

        if self.edge_weight(edge_start, edge_end).is_none() {
            if edge_start == edge_end {
                if edge_end == end {
                    return Ok(Position::anchored(start, end, total, total));
                }
                if edge_start == start {
                    return Ok(Position::anchored(start, end, 0.0, total));
                }
            }

            // The position spans a sub-path of the route
            let sub_path = self.shortest_path(edge_start, edge_end)?;
            let contained = sub_path.edges().all(|(a, b)| route.edge_index(a, b).is_some());
            if let (true, Some(i), Some(j)) = (
                contained,
                route.index_of(edge_start),
                route.index_of(edge_end),
            ) {
                let base = route.cumulative[i];
                let covered = if i <= j { base + offset } else { base - offset };
                return Ok(Position::anchored(start, end, covered, total));
            }
            return Err(not_in_route);
        }

        match route.edge_index(edge_start, edge_end) {
            Some((k, true)) => Ok(Position::anchored(
                start,
                end,
                route.cumulative[k] + offset,
                total,
            )),
            Some((k, false)) => Ok(Position::anchored(
                start,
                end,
                route.cumulative[k + 1] - offset,
                total,
            )),
            None => {
                if (length - offset).abs() <= POSITION_EPSILON {
                    if let Some(j) = route.index_of(edge_end) {
                        return Ok(Position::anchored(start, end, route.cumulative[j], total));
                    }
                } else if offset.abs() <= POSITION_EPSILON && edge_start == end {
                    return Ok(Position::anchored(start, end, total, total));
                }
                Err(not_in_route)
            }
        }
    }

    /// Vertex from which the routes of both origins towards `dest` coincide
    pub fn earliest_shared_node(
        &self,
        start1: NodeId,
        start2: NodeId,
        dest: NodeId,
    ) -> LocatorResult<NodeId> {
        let first = self.shortest_path(start1, dest)?;
        let second = self.shortest_path(start2, dest)?;

        let mut shared = dest;
        for (a, b) in first.vertices.iter().rev().zip(second.vertices.iter().rev()) {
            if a != b {
                break;
            }
            shared = *a;
        }
        Ok(shared)
    }

    /// True if the edge lies on the route implied by `position`, or the
    /// position sits on one of the edge's endpoints without a route.
    pub fn contains(&self, edge_start: NodeId, edge_end: NodeId, position: &Position) -> LocatorResult<bool> {
        let Some(start) = position.start() else {
            return Ok(false);
        };
        let dest = position.dest();
        let route = self.shortest_path(start, dest)?;

        if position.is_degenerate() {
            return Ok(edge_start == start || edge_end == start);
        }
        if self.edge_weight(edge_start, edge_end).is_none() {
            return Ok(false);
        }
        Ok(route.edge_index(edge_start, edge_end).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_sample_distances() {
        let t = TopologyAnalyzer::sample();
        assert_eq!(t.edge_count(), 3);
        assert!(approx(t.distance(1001, 1002).unwrap(), 100.0));
        assert!(approx(t.distance(1001, 1004).unwrap(), 150.0));
        assert!(approx(t.distance(1003, 1004).unwrap(), 120.0));
        assert!(approx(t.distance(1004, 1004).unwrap(), 0.0));
    }

    #[test]
    fn test_unknown_and_disconnected_relays() {
        let mut t = TopologyAnalyzer::sample();
        assert_eq!(t.distance(1001, 1009), Err(LocatorError::NotFound(1009)));

        t.add_relay(1005).unwrap();
        let err = t.distance(1001, 1005).unwrap_err();
        assert_eq!(err, LocatorError::NoPath { from: 1001, to: 1005 });
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_invalid_edges_rejected() {
        let mut t = TopologyAnalyzer::new();
        assert!(matches!(t.add_edge(1001, 1001, 1.0), Err(LocatorError::InvalidEdge { .. })));
        assert!(matches!(t.add_edge(1001, 1002, -3.0), Err(LocatorError::InvalidEdge { .. })));
        assert!(matches!(t.add_edge(1001, 1002, f64::NAN), Err(LocatorError::InvalidEdge { .. })));
        assert_eq!(t.add_edge(5, 1002, 1.0), Err(LocatorError::NotARelay(5)));
    }

    #[test]
    fn test_radius_override_and_default() {
        let mut t = TopologyAnalyzer::new();
        t.add_relay_with_radius(1001, 7.5).unwrap();
        t.add_edge(1001, 1002, 10.0).unwrap();
        assert_eq!(t.radius(1001).unwrap(), 7.5);
        assert!(approx(t.radius(1002).unwrap(), 10f64.sqrt()));
        assert_eq!(t.radius(1003), Err(LocatorError::NotFound(1003)));
    }

    #[test]
    fn test_deterministic_tie_break() {
        // Two equally long routes 1001 -> 1004, via 1002 or 1003
        let mut t = TopologyAnalyzer::new();
        t.add_edge(1001, 1003, 10.0).unwrap();
        t.add_edge(1003, 1004, 10.0).unwrap();
        t.add_edge(1001, 1002, 10.0).unwrap();
        t.add_edge(1002, 1004, 10.0).unwrap();

        let edge = t
            .graph_edge_position(&Position::anchored(1001, 1004, 5.0, 20.0))
            .unwrap();
        assert_eq!(edge, Position::anchored(1001, 1002, 5.0, 10.0));
    }

    #[test]
    fn test_graph_edge_position() {
        let t = TopologyAnalyzer::sample();
        let edge = t
            .graph_edge_position(&Position::anchored(1001, 1004, 120.0, 150.0))
            .unwrap();
        assert_eq!(edge, Position::anchored(1002, 1004, 20.0, 50.0));

        // Travel direction is kept even though the edge was declared 1001-1002
        let edge = t
            .graph_edge_position(&Position::anchored(1004, 1001, 60.0, 150.0))
            .unwrap();
        assert_eq!(edge, Position::anchored(1002, 1001, 10.0, 100.0));

        let same = Position::anchored(1002, 1002, 0.0, 0.0);
        assert_eq!(t.graph_edge_position(&same).unwrap(), same);
    }

    #[test]
    fn test_graph_edge_position_errors() {
        let t = TopologyAnalyzer::sample();
        assert!(matches!(
            t.graph_edge_position(&Position::anchored(1001, 1004, 151.0, 150.0)),
            Err(LocatorError::InvariantViolation(_))
        ));
        assert!(matches!(
            t.graph_edge_position(&Position::unanchored(1004)),
            Err(LocatorError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_total_route_position_on_route() {
        let t = TopologyAnalyzer::sample();
        let forward = t
            .total_route_position(&Position::anchored(1002, 1004, 20.0, 50.0), 1001, 1004)
            .unwrap();
        assert!(approx(forward.offset(), 120.0));
        assert!(approx(forward.total_distance(), 150.0));

        let reversed = t
            .total_route_position(&Position::anchored(1004, 1002, 30.0, 50.0), 1001, 1004)
            .unwrap();
        assert!(approx(reversed.offset(), 120.0));
    }

    #[test]
    fn test_total_route_position_degenerate() {
        let t = TopologyAnalyzer::sample();
        let at_end = t
            .total_route_position(&Position::anchored(1004, 1004, 0.0, 0.0), 1001, 1004)
            .unwrap();
        assert_eq!(at_end, Position::anchored(1001, 1004, 150.0, 150.0));

        let at_start = t
            .total_route_position(&Position::anchored(1001, 1001, 0.0, 0.0), 1001, 1004)
            .unwrap();
        assert_eq!(at_start, Position::anchored(1001, 1004, 0.0, 150.0));
    }

    #[test]
    fn test_total_route_position_sub_path() {
        let mut t = TopologyAnalyzer::sample();
        t.add_edge(1004, 1005, 30.0).unwrap();
        // 1002 -> 1005 is a sub-path of 1001 -> 1005
        let pos = t
            .total_route_position(&Position::anchored(1002, 1005, 60.0, 80.0), 1001, 1005)
            .unwrap();
        assert!(approx(pos.offset(), 160.0));
        assert!(approx(pos.total_distance(), 180.0));
    }

    #[test]
    fn test_total_route_position_waypoint() {
        let t = TopologyAnalyzer::sample();
        // Fully travelled 1003 -> 1002, route 1001 -> 1004 passes 1002
        let pos = t
            .total_route_position(&Position::anchored(1003, 1002, 70.0, 70.0), 1001, 1004)
            .unwrap();
        assert!(approx(pos.offset(), 100.0));

        let err = t
            .total_route_position(&Position::anchored(1003, 1002, 20.0, 70.0), 1001, 1004)
            .unwrap_err();
        assert!(matches!(err, LocatorError::NoSuchEdgeInRoute { .. }));
    }

    #[test]
    fn test_earliest_shared_node() {
        let t = TopologyAnalyzer::sample();
        assert_eq!(t.earliest_shared_node(1003, 1001, 1004).unwrap(), 1002);
        assert_eq!(t.earliest_shared_node(1001, 1001, 1004).unwrap(), 1001);
        // 1002 lies on 1001's route, so both share it
        assert_eq!(t.earliest_shared_node(1001, 1002, 1004).unwrap(), 1002);
    }

    #[test]
    fn test_contains() {
        let t = TopologyAnalyzer::sample();
        let route = Position::route(1001, 1004);
        assert!(t.contains(1001, 1002, &route).unwrap());
        assert!(t.contains(1004, 1002, &route).unwrap());
        assert!(!t.contains(1002, 1003, &route).unwrap());
        assert!(!t.contains(1001, 1004, &route).unwrap());

        let at_relay = Position::anchored(1002, 1002, 0.0, 0.0);
        assert!(t.contains(1001, 1002, &at_relay).unwrap());
        assert!(!t.contains(1003, 1004, &at_relay).unwrap());
        assert!(!t.contains(1001, 1002, &Position::unanchored(1002)).unwrap());
    }

    const SAMPLE_IDS: [NodeId; 4] = [1001, 1002, 1003, 1004];

    proptest! {
        #[test]
        fn prop_distance_is_symmetric(a in 0usize..4, b in 0usize..4) {
            let t = TopologyAnalyzer::sample();
            let forward = t.distance(SAMPLE_IDS[a], SAMPLE_IDS[b]).unwrap();
            let backward = t.distance(SAMPLE_IDS[b], SAMPLE_IDS[a]).unwrap();
            prop_assert!((forward - backward).abs() < 1e-9);
        }

        #[test]
        fn prop_edge_position_round_trip(a in 0usize..4, b in 0usize..4, fraction in 0.0f64..=1.0) {
            prop_assume!(a != b);
            let t = TopologyAnalyzer::sample();
            let (start, dest) = (SAMPLE_IDS[a], SAMPLE_IDS[b]);
            let total = t.distance(start, dest).unwrap();
            let initial = Position::anchored(start, dest, fraction * total, total);

            let edge = t.graph_edge_position(&initial).unwrap();
            let back = t.total_route_position(&edge, start, dest).unwrap();
            prop_assert!((back.offset() - initial.offset()).abs() < 1e-6);
            prop_assert!((back.total_distance() - total).abs() < 1e-9);
        }
    }
}
