//! Circular reference detection
//!
//! Two tiers:
//!
//! - local mode only sees one subject's own dependency set and flags literal
//!   self-reference. Indirect cycles through other subjects are out of reach
//!   without the full graph and are deliberately not guessed at.
//! - graph mode walks a complete [`DependencyGraph`] depth-first and returns
//!   the first cycle found as a concrete path.

use crate::error::EngineError;
use crate::graph::DependencyGraph;
use petgraph::graph::NodeIndex;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

struct Frame {
    node: NodeIndex,
    neighbors: Vec<NodeIndex>,
    cursor: usize,
}

/// Stateless cycle detector
pub struct CircularReferenceDetector;

impl CircularReferenceDetector {
    /// Local mode: fail if `dependencies` names the subject itself, under its
    /// id or any of its aliases.
    pub fn check_self_reference(
        name: &str,
        aliases: &[&str],
        dependencies: &BTreeSet<String>,
    ) -> Result<(), EngineError> {
        let hit = std::iter::once(name)
            .chain(aliases.iter().copied())
            .find(|candidate| dependencies.contains(*candidate));

        match hit {
            Some(_) => Err(EngineError::CircularDependency {
                path: vec![name.to_string(), name.to_string()],
            }),
            None => Ok(()),
        }
    }

    /// Graph mode: first cycle reachable from `start`, or from each declared
    /// name in declaration order when no start is given. The path runs from
    /// the first occurrence of the repeated node to the edge closing the cycle,
    /// so `A -> B -> C -> A` is reported as `[A, B, C, A]`.
    pub fn find_cycle(graph: &DependencyGraph, start: Option<&str>) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; graph.node_count()];

        let roots: Vec<NodeIndex> = match start {
            Some(name) => vec![graph.index_of(name)?],
            None => graph.declared_indices().to_vec(),
        };

        for root in roots {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            if let Some(cycle) = Self::search(graph, root, &mut marks) {
                return Some(
                    cycle
                        .into_iter()
                        .map(|i| graph.name_of(i).to_string())
                        .collect(),
                );
            }
        }
        None
    }

    /// Graph mode as a result
    pub fn check(graph: &DependencyGraph, start: Option<&str>) -> Result<(), EngineError> {
        match Self::find_cycle(graph, start) {
            Some(path) => Err(EngineError::CircularDependency { path }),
            None => Ok(()),
        }
    }

    fn search(graph: &DependencyGraph, root: NodeIndex, marks: &mut [Mark]) -> Option<Vec<NodeIndex>> {
        let mut path = vec![root];
        let mut frames = vec![Frame {
            node: root,
            neighbors: graph.sorted_neighbors(root),
            cursor: 0,
        }];
        marks[root.index()] = Mark::OnStack;

        while let Some(frame) = frames.last_mut() {
            let node = frame.node;
            let next = frame.neighbors.get(frame.cursor).copied();
            frame.cursor += 1;

            let Some(next) = next else {
                marks[node.index()] = Mark::Done;
                path.pop();
                frames.pop();
                continue;
            };

            match marks[next.index()] {
                Mark::OnStack => {
                    let first = path.iter().position(|&n| n == next)?;
                    let mut cycle = path[first..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks[next.index()] = Mark::OnStack;
                    path.push(next);
                    frames.push(Frame {
                        node: next,
                        neighbors: graph.sorted_neighbors(next),
                        cursor: 0,
                    });
                }
                Mark::Done => {}
            }
        }
        None
    }
}
