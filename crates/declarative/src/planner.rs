//! Execution planner - orders resources by their dependencies

use crate::error::GraphError;
use crate::spec::ResourceSpec;
use std::collections::{BTreeMap, HashMap};

/// Resources in an order where every dependency comes first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    order: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl ExecutionPlan {
    /// Build a plan from declared specifications
    pub fn build(specs: &[ResourceSpec]) -> Result<Self, GraphError> {
        Self::from_nodes(specs.iter().map(|s| (s.id.as_str(), s.depends_on.as_slice())))
    }

    /// Build a plan from `(id, dependencies)` pairs in declaration order.
    ///
    /// Depth-first topological sort. Independent resources keep their
    /// declaration order, and dependencies are visited in declaration order
    /// too, so the same input always yields the same plan.
    pub fn from_nodes<'a, I>(nodes: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let nodes: Vec<(&str, &[String])> = nodes.into_iter().collect();
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (*id, i))
            .collect();

        // Resolve edges up front so dangling references fail before any sort
        let mut edges: Vec<Vec<usize>> = Vec::with_capacity(nodes.len());
        for (id, deps) in &nodes {
            let mut resolved = Vec::with_capacity(deps.len());
            for dep in *deps {
                match index.get(dep.as_str()) {
                    Some(&i) if dep != id => resolved.push(i),
                    _ => {
                        return Err(GraphError::DanglingDependency {
                            id: (*id).to_string(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
            resolved.sort_unstable();
            resolved.dedup();
            edges.push(resolved);
        }

        let mut marks = vec![Mark::Unvisited; nodes.len()];
        let mut path = Vec::new();
        let mut order = Vec::with_capacity(nodes.len());
        for start in 0..nodes.len() {
            visit(start, &edges, &mut marks, &mut path, &mut order).map_err(|cycle| {
                GraphError::CycleDetected {
                    ids: cycle.iter().map(|&i| nodes[i].0.to_string()).collect(),
                }
            })?;
        }

        let dependencies = nodes
            .iter()
            .zip(&edges)
            .map(|((id, _), deps)| {
                (
                    (*id).to_string(),
                    deps.iter().map(|&i| nodes[i].0.to_string()).collect(),
                )
            })
            .collect();

        Ok(Self {
            order: order.into_iter().map(|i| nodes[i].0.to_string()).collect(),
            dependencies,
        })
    }

    /// Identifiers in execution order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Total number of resources in the plan
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if plan is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Position of a resource in the plan
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|o| o == id)
    }

    /// Direct dependencies of a resource, deduplicated and ordered by where
    /// each dependency is itself declared (not by the `depends_on` list)
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Resources that directly depend on `id`, in plan order
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.order
            .iter()
            .filter(|other| self.dependencies_of(other).iter().any(|d| d == id))
            .map(String::as_str)
            .collect()
    }

    /// Widest set of resources sharing a dependency depth.
    ///
    /// Depth 0 holds resources with no dependencies; every other resource
    /// sits one level below its deepest dependency.
    pub fn frontier_width(&self) -> usize {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut widths: BTreeMap<usize, usize> = BTreeMap::new();
        for id in &self.order {
            let d = self
                .dependencies_of(id)
                .iter()
                .filter_map(|dep| depth.get(dep.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id, d);
            *widths.entry(d).or_default() += 1;
        }
        widths.values().copied().max().unwrap_or(0)
    }

    /// Keep only `targets` and everything they transitively depend on
    pub fn restrict_to<S: AsRef<str>>(&self, targets: &[S]) -> Result<Self, GraphError> {
        let mut keep: Vec<&str> = Vec::new();
        let mut stack: Vec<&str> = Vec::new();
        for target in targets {
            let target = target.as_ref();
            let Some(pos) = self.position(target) else {
                return Err(GraphError::UnknownTarget {
                    id: target.to_string(),
                });
            };
            stack.push(&self.order[pos]);
        }

        while let Some(id) = stack.pop() {
            if keep.contains(&id) {
                continue;
            }
            keep.push(id);
            stack.extend(self.dependencies_of(id).iter().map(String::as_str));
        }

        let order: Vec<String> = self
            .order
            .iter()
            .filter(|id| keep.contains(&id.as_str()))
            .cloned()
            .collect();
        let dependencies = order
            .iter()
            .map(|id| (id.clone(), self.dependencies_of(id).to_vec()))
            .collect();

        Ok(Self {
            order,
            dependencies,
        })
    }
}

/// Post-order DFS. On a back edge, returns the cycle path with the first id repeated last.
fn visit(
    node: usize,
    edges: &[Vec<usize>],
    marks: &mut [Mark],
    path: &mut Vec<usize>,
    order: &mut Vec<usize>,
) -> Result<(), Vec<usize>> {
    match marks[node] {
        Mark::Done => return Ok(()),
        Mark::InProgress => {
            let start = path.iter().position(|&n| n == node).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(node);
            return Err(cycle);
        }
        Mark::Unvisited => {}
    }

    marks[node] = Mark::InProgress;
    path.push(node);
    for &dep in &edges[node] {
        visit(dep, edges, marks, path, order)?;
    }
    path.pop();
    marks[node] = Mark::Done;
    order.push(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ResourceKind;
    use proptest::prelude::*;

    fn spec(id: &str, deps: &[&str]) -> ResourceSpec {
        deps.iter().fold(
            ResourceSpec::new(id, ResourceKind::ProcessInvocation).with("command", "true"),
            |s, d| s.after(d),
        )
    }

    #[test]
    fn test_independent_resources_keep_declaration_order() {
        let plan = ExecutionPlan::build(&[spec("c", &[]), spec("a", &[]), spec("b", &[])]).unwrap();
        assert_eq!(plan.order(), ["c", "a", "b"]);
        assert_eq!(plan.frontier_width(), 3);
    }

    #[test]
    fn test_dependencies_come_first() {
        let plan = ExecutionPlan::build(&[
            spec("app", &["db", "config"]),
            spec("db", &[]),
            spec("config", &["db"]),
            spec("proxy", &[]),
        ])
        .unwrap();

        assert_eq!(plan.order(), ["db", "config", "app", "proxy"]);
        assert_eq!(plan.dependents_of("db"), vec!["config", "app"]);
        assert_eq!(plan.dependencies_of("app"), ["db", "config"]);
        assert_eq!(plan.frontier_width(), 2);
    }

    #[test]
    fn test_dependencies_follow_declaration_not_list_order() {
        let plan = ExecutionPlan::build(&[
            spec("db", &[]),
            spec("cache", &[]),
            spec("app", &["cache", "db", "cache"]),
        ])
        .unwrap();

        assert_eq!(plan.dependencies_of("app"), ["db", "cache"]);
    }

    #[test]
    fn test_cycle_names_participants() {
        let err = ExecutionPlan::build(&[
            spec("a", &["b"]),
            spec("b", &["c"]),
            spec("c", &["a"]),
            spec("d", &[]),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            GraphError::CycleDetected {
                ids: vec!["a".into(), "b".into(), "c".into(), "a".into()],
            }
        );
    }

    #[test]
    fn test_self_dependency_is_dangling() {
        let err = ExecutionPlan::build(&[spec("a", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingDependency {
                id: "a".into(),
                dependency: "a".into(),
            }
        );
    }

    #[test]
    fn test_unknown_dependency_is_dangling() {
        let err = ExecutionPlan::build(&[spec("app", &["db"])]).unwrap_err();
        assert!(matches!(err, GraphError::DanglingDependency { dependency, .. } if dependency == "db"));
    }

    #[test]
    fn test_restrict_to_pulls_in_dependencies() {
        let plan = ExecutionPlan::build(&[
            spec("db", &[]),
            spec("cache", &[]),
            spec("app", &["db"]),
            spec("worker", &["cache"]),
        ])
        .unwrap();

        let only = plan.restrict_to(&["app"]).unwrap();
        assert_eq!(only.order(), ["db", "app"]);

        assert_eq!(
            plan.restrict_to(&["nope"]).unwrap_err(),
            GraphError::UnknownTarget { id: "nope".into() }
        );
    }

    #[test]
    fn test_empty_plan() {
        let plan = ExecutionPlan::build(&[]).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.frontier_width(), 0);
    }

    /// Random DAGs: each node may only depend on nodes declared before it,
    /// then declaration order is shuffled by reversing.
    fn dag() -> impl Strategy<Value = Vec<(String, Vec<String>)>> {
        (1usize..12).prop_flat_map(|n| {
            prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..3), n)
                .prop_map(move |picks| {
                    let mut nodes: Vec<(String, Vec<String>)> = Vec::new();
                    for (i, deps) in picks.into_iter().enumerate() {
                        let deps = if i == 0 {
                            Vec::new()
                        } else {
                            deps.iter().map(|d| format!("r{}", d.index(i))).collect()
                        };
                        nodes.push((format!("r{i}"), deps));
                    }
                    nodes.reverse();
                    nodes
                })
        })
    }

    proptest! {
        #[test]
        fn plan_respects_dependencies_and_is_deterministic(nodes in dag()) {
            let build = || ExecutionPlan::from_nodes(
                nodes.iter().map(|(id, deps)| (id.as_str(), deps.as_slice())),
            );
            let plan = build().unwrap();
            prop_assert_eq!(plan.len(), nodes.len());

            for (id, deps) in &nodes {
                let pos = plan.position(id).unwrap();
                for dep in deps {
                    prop_assert!(plan.position(dep).unwrap() < pos);
                }
            }

            prop_assert_eq!(build().unwrap(), plan);
        }
    }
}
