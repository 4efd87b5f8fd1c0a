use crate::error::{CoreError, Result};
use crate::types::Transition;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

// ─── Node classification ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Start,
    End,
    Linear,
    SplitAnd,
    SplitOr,
    Foreach,
    Join,
}

impl StepKind {
    pub fn is_split(&self) -> bool {
        matches!(self, StepKind::SplitAnd | StepKind::SplitOr | StepKind::Foreach)
    }
}

/// One analysed step: classification, ordered edges, split bookkeeping.
#[derive(Clone, Debug)]
pub struct FlowNode {
    pub name: String,
    pub kind: StepKind,
    /// Predecessors, in registration order of their declarations.
    pub in_steps: Vec<String>,
    /// Successors, in declared target order.
    pub out_steps: Vec<String>,
    pub foreach_var: Option<String>,
    pub condition_var: Option<String>,
    pub switch_map: Option<BTreeMap<String, String>>,
    /// Foreach source declared unbounded at build time.
    pub unbounded_foreach: bool,
    /// Degree of a parallel split (set on the split and its child step).
    pub num_parallel: usize,
    /// The child step of a `num_parallel` split.
    pub parallel_step: bool,
    /// The join that closes this split at the same nesting depth.
    pub matching_join: Option<String>,
    /// Registered with a join body (second `Inputs` parameter).
    pub takes_inputs: bool,
}

impl FlowNode {
    fn new(name: &str, takes_inputs: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: StepKind::Linear,
            in_steps: Vec::new(),
            out_steps: Vec::new(),
            foreach_var: None,
            condition_var: None,
            switch_map: None,
            unbounded_foreach: false,
            num_parallel: 0,
            parallel_step: false,
            matching_join: None,
            takes_inputs,
        }
    }

    /// A switch that lists itself among its targets (bounded loop).
    pub fn is_self_referencing_switch(&self) -> bool {
        self.kind == StepKind::SplitOr && self.out_steps.iter().any(|t| t == &self.name)
    }
}

/// Declaration handed to the analyser per registered step.
#[derive(Clone, Debug)]
pub struct StepDecl {
    pub name: String,
    pub next: Transition,
    pub takes_inputs: bool,
}

// ─── Graph ────────────────────────────────────────────────────

/// The analysed flow DAG. Node payloads live in a petgraph `DiGraph`; a
/// name index and a precomputed topological order sit beside it.
#[derive(Debug)]
pub struct FlowGraph {
    pub flow_name: String,
    graph: DiGraph<FlowNode, ()>,
    index: BTreeMap<String, NodeIndex>,
    topo: Vec<String>,
}

impl FlowGraph {
    /// Analyse step declarations into a typed graph.
    ///
    /// Classification, join detection, matching-join resolution and the
    /// topological order are all computed here; failures surface as
    /// `MissingStart` / `MissingEnd` / `UnreachableJoin` / `GraphInvariant`.
    pub fn analyse(flow_name: &str, decls: &[StepDecl]) -> Result<Self> {
        let mut graph: DiGraph<FlowNode, ()> = DiGraph::new();
        let mut index = BTreeMap::new();

        for decl in decls {
            if index.contains_key(&decl.name) {
                return Err(CoreError::GraphInvariant(format!(
                    "duplicate step '{}'",
                    decl.name
                )));
            }
            let idx = graph.add_node(FlowNode::new(&decl.name, decl.takes_inputs));
            index.insert(decl.name.clone(), idx);
        }

        if !index.contains_key("start") {
            return Err(CoreError::MissingStart);
        }
        if !index.contains_key("end") {
            return Err(CoreError::MissingEnd);
        }

        graph[index["start"]].kind = StepKind::Start;
        graph[index["end"]].kind = StepKind::End;

        // Classify from declared transitions and wire edges.
        for decl in decls {
            Self::apply_transition(&mut graph, &index, decl)?;
        }

        // Joins: a registered join body makes a join regardless of in-edge
        // count; so does any linear step with several predecessors.
        for decl in decls {
            let idx = index[&decl.name];
            let node = &graph[idx];
            if node.name == "start" || node.name == "end" {
                continue;
            }
            if node.kind == StepKind::Linear && (node.takes_inputs || node.in_steps.len() > 1) {
                graph[idx].kind = StepKind::Join;
            }
        }

        let mut fg = Self {
            flow_name: flow_name.to_string(),
            graph,
            index,
            topo: Vec::new(),
        };

        fg.resolve_matching_joins()?;
        fg.check_reachability()?;
        fg.topo = fg.compute_topo_order();
        Ok(fg)
    }

    fn apply_transition(
        graph: &mut DiGraph<FlowNode, ()>,
        index: &BTreeMap<String, NodeIndex>,
        decl: &StepDecl,
    ) -> Result<()> {
        let t = &decl.next;
        let modes = [
            t.foreach_var.is_some(),
            t.condition_var.is_some(),
            t.num_parallel.is_some(),
        ]
        .iter()
        .filter(|m| **m)
        .count();
        if modes > 1 {
            return Err(CoreError::GraphInvariant(format!(
                "step '{}': at most one of foreach, condition, num_parallel may be set",
                decl.name
            )));
        }

        let idx = index[&decl.name];

        if t.targets.is_empty() {
            if decl.name != "end" {
                return Err(CoreError::GraphInvariant(format!(
                    "step '{}' declares no transition but is not 'end'",
                    decl.name
                )));
            }
            return Ok(());
        }
        if decl.name == "end" {
            return Err(CoreError::GraphInvariant(
                "'end' must not declare a transition".to_string(),
            ));
        }

        for target in &t.targets {
            let tidx = *index.get(target).ok_or_else(|| {
                CoreError::GraphInvariant(format!(
                    "step '{}' transitions to unknown step '{}'",
                    decl.name, target
                ))
            })?;
            graph[idx].out_steps.push(target.clone());
            if !graph[tidx].in_steps.contains(&decl.name) {
                graph[tidx].in_steps.push(decl.name.clone());
            }
            if tidx != idx {
                graph.add_edge(idx, tidx, ());
            }
        }

        // Classification may overwrite the 'start' sentinel kind: a start
        // step that declares a foreach or switch is dispatched as one.
        if let Some(var) = &t.foreach_var {
            if t.targets.len() != 1 {
                return Err(CoreError::GraphInvariant(format!(
                    "foreach step '{}' must have exactly one target",
                    decl.name
                )));
            }
            let node = &mut graph[idx];
            node.kind = StepKind::Foreach;
            node.foreach_var = Some(var.clone());
            node.unbounded_foreach = t.unbounded;
        } else if let Some(n) = t.num_parallel {
            if t.targets.len() != 1 {
                return Err(CoreError::GraphInvariant(format!(
                    "parallel split '{}' must have exactly one target",
                    decl.name
                )));
            }
            {
                let node = &mut graph[idx];
                node.kind = StepKind::Foreach;
                node.num_parallel = n;
            }
            let cidx = index[&t.targets[0]];
            graph[cidx].parallel_step = true;
            graph[cidx].num_parallel = n;
        } else if let Some(cond) = &t.condition_var {
            let node = &mut graph[idx];
            node.kind = StepKind::SplitOr;
            node.condition_var = Some(cond.clone());
            node.switch_map = t.switch_map.clone();
        } else if t.targets.len() > 1 {
            graph[idx].kind = StepKind::SplitAnd;
        }

        Ok(())
    }

    /// Walk forward from every split, counting nesting depth, until the
    /// join that closes it at depth zero. Self-referencing switches are
    /// loops, not nested splits, and are exempt from the requirement.
    fn resolve_matching_joins(&mut self) -> Result<()> {
        let names: Vec<String> = self.index.keys().cloned().collect();
        for name in names {
            let node = &self.graph[self.index[&name]];
            if !node.kind.is_split() {
                continue;
            }
            let self_ref = node.is_self_referencing_switch();
            let found = self.walk_to_matching_join(&name);
            match found {
                Some(join) => self.graph[self.index[&name]].matching_join = Some(join),
                None if self_ref => {
                    // Bounded loop: the taken branch eventually leaves the
                    // switch; no structural join is required.
                }
                None => return Err(CoreError::UnreachableJoin(name.clone())),
            }
        }
        Ok(())
    }

    fn walk_to_matching_join(&self, split: &str) -> Option<String> {
        let node = self.node(split)?;
        let mut current = node
            .out_steps
            .iter()
            .find(|t| t.as_str() != split)
            .cloned()?;
        let mut depth: i32 = 1;
        let mut visited: HashSet<String> = HashSet::from([split.to_string()]);

        loop {
            if visited.contains(&current) {
                return None;
            }
            visited.insert(current.clone());
            let cn = self.node(&current)?;

            if cn.kind.is_split() {
                if !cn.is_self_referencing_switch() {
                    depth += 1;
                }
            } else if cn.kind == StepKind::Join {
                depth -= 1;
                if depth == 0 {
                    return Some(current);
                }
            }

            // Follow the first out-edge; when it loops back into visited
            // territory (recursive switch), hop to an unvisited alternate.
            let mut next = cn.out_steps.first().cloned()?;
            if visited.contains(&next) {
                next = cn
                    .out_steps
                    .iter()
                    .find(|t| !visited.contains(*t))
                    .cloned()?;
            }
            current = next;
        }
    }

    /// Every step must be reachable from 'start'.
    fn check_reachability(&self) -> Result<()> {
        let start = self.index["start"];
        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(nx) = dfs.next(&self.graph) {
            reachable.insert(nx);
        }
        for (name, idx) in &self.index {
            if !reachable.contains(idx) {
                return Err(CoreError::GraphInvariant(format!(
                    "step '{name}' is not reachable from 'start'"
                )));
            }
        }
        Ok(())
    }

    /// Depth-first post-order from 'start', reversed: every non-loop edge
    /// points forward. Self-edges at recursive switches are the only
    /// back-edges and are skipped by the visited set.
    fn compute_topo_order(&self) -> Vec<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut order: Vec<String> = Vec::new();

        fn visit(
            graph: &FlowGraph,
            name: &str,
            visited: &mut HashSet<String>,
            order: &mut Vec<String>,
        ) {
            if visited.contains(name) {
                return;
            }
            visited.insert(name.to_string());
            if let Some(node) = graph.node(name) {
                for out in &node.out_steps {
                    visit(graph, out, visited, order);
                }
            }
            order.push(name.to_string());
        }

        visit(self, "start", &mut visited, &mut order);
        let names: Vec<String> = self.index.keys().cloned().collect();
        for name in names {
            visit(self, &name, &mut visited, &mut order);
        }

        order.reverse();
        order
    }

    // ── Accessors ──

    pub fn node(&self, name: &str) -> Option<&FlowNode> {
        self.index.get(name).map(|idx| &self.graph[*idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn topo_order(&self) -> &[String] {
        &self.topo
    }

    pub fn step_names(&self) -> impl Iterator<Item = &String> {
        self.index.keys()
    }

    /// Serialisable shape summary, persisted as the `_graph_info` artifact
    /// of the start task so tooling can reconstruct the DAG without the
    /// flow definition.
    pub fn info_value(&self) -> Value {
        let nodes: Vec<Value> = self
            .topo
            .iter()
            .filter_map(|name| self.node(name))
            .map(|n| {
                serde_json::json!({
                    "name": n.name,
                    "type": n.kind,
                    "out_steps": n.out_steps,
                    "foreach_var": n.foreach_var,
                    "condition_var": n.condition_var,
                    "num_parallel": if n.num_parallel > 0 { Some(n.num_parallel) } else { None },
                    "matching_join": n.matching_join,
                })
            })
            .collect();
        serde_json::json!({ "flow": self.flow_name, "steps": nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, targets: &[&str]) -> StepDecl {
        StepDecl {
            name: name.to_string(),
            next: Transition {
                targets: targets.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            takes_inputs: false,
        }
    }

    fn foreach_decl(name: &str, target: &str, var: &str) -> StepDecl {
        StepDecl {
            name: name.to_string(),
            next: Transition {
                targets: vec![target.to_string()],
                foreach_var: Some(var.to_string()),
                ..Default::default()
            },
            takes_inputs: false,
        }
    }

    fn switch_decl(name: &str, targets: &[&str], cond: &str) -> StepDecl {
        StepDecl {
            name: name.to_string(),
            next: Transition {
                targets: targets.iter().map(|s| s.to_string()).collect(),
                condition_var: Some(cond.to_string()),
                ..Default::default()
            },
            takes_inputs: false,
        }
    }

    fn join_decl(name: &str, targets: &[&str]) -> StepDecl {
        StepDecl {
            takes_inputs: true,
            ..decl(name, targets)
        }
    }

    /// Linear flow classifies start/linear/end
    #[test]
    fn test_linear_classification() {
        let g = FlowGraph::analyse(
            "Linear",
            &[
                decl("start", &["middle"]),
                decl("middle", &["end"]),
                decl("end", &[]),
            ],
        )
        .unwrap();
        assert_eq!(g.node("start").unwrap().kind, StepKind::Start);
        assert_eq!(g.node("middle").unwrap().kind, StepKind::Linear);
        assert_eq!(g.node("end").unwrap().kind, StepKind::End);
        assert_eq!(g.topo_order(), &["start", "middle", "end"]);
    }

    #[test]
    fn test_missing_sentinels() {
        let err = FlowGraph::analyse("NoStart", &[decl("end", &[])]).unwrap_err();
        assert!(matches!(err, CoreError::MissingStart));

        let err =
            FlowGraph::analyse("NoEnd", &[decl("start", &["start"])]).unwrap_err();
        assert!(matches!(err, CoreError::MissingEnd));
    }

    /// Foreach split resolves its matching join
    #[test]
    fn test_foreach_matching_join() {
        let g = FlowGraph::analyse(
            "Fan",
            &[
                decl("start", &["fan"]),
                foreach_decl("fan", "work", "xs"),
                decl("work", &["collect"]),
                join_decl("collect", &["end"]),
                decl("end", &[]),
            ],
        )
        .unwrap();
        let fan = g.node("fan").unwrap();
        assert_eq!(fan.kind, StepKind::Foreach);
        assert_eq!(fan.foreach_var.as_deref(), Some("xs"));
        assert_eq!(fan.matching_join.as_deref(), Some("collect"));
        assert_eq!(g.node("collect").unwrap().kind, StepKind::Join);
    }

    /// Nested foreach: each split matches its own join by depth
    #[test]
    fn test_nested_foreach_joins() {
        let g = FlowGraph::analyse(
            "Nested",
            &[
                decl("start", &["outer"]),
                foreach_decl("outer", "inner", "xs"),
                foreach_decl("inner", "leaf", "ys"),
                decl("leaf", &["inner_join"]),
                join_decl("inner_join", &["outer_join"]),
                join_decl("outer_join", &["end"]),
                decl("end", &[]),
            ],
        )
        .unwrap();
        assert_eq!(
            g.node("outer").unwrap().matching_join.as_deref(),
            Some("outer_join")
        );
        assert_eq!(
            g.node("inner").unwrap().matching_join.as_deref(),
            Some("inner_join")
        );
    }

    /// Branch split with a join detected from in-edges alone
    #[test]
    fn test_split_and_join_by_in_edges() {
        let g = FlowGraph::analyse(
            "Branch",
            &[
                decl("start", &["fork"]),
                decl("fork", &["a", "b"]),
                decl("a", &["merge"]),
                decl("b", &["merge"]),
                join_decl("merge", &["end"]),
                decl("end", &[]),
            ],
        )
        .unwrap();
        assert_eq!(g.node("fork").unwrap().kind, StepKind::SplitAnd);
        assert_eq!(g.node("fork").unwrap().matching_join.as_deref(), Some("merge"));
    }

    #[test]
    fn test_unreachable_join_detected() {
        let err = FlowGraph::analyse(
            "NoJoin",
            &[
                decl("start", &["fan"]),
                foreach_decl("fan", "work", "xs"),
                decl("work", &["end"]),
                decl("end", &[]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UnreachableJoin(s) if s == "fan"));
    }

    /// Recursive switch is a loop, not a nested split, and needs no join
    #[test]
    fn test_recursive_switch() {
        let g = FlowGraph::analyse(
            "Loop",
            &[
                decl("start", &["spin"]),
                switch_decl("spin", &["spin", "done"], "again"),
                decl("done", &["end"]),
                decl("end", &[]),
            ],
        )
        .unwrap();
        let spin = g.node("spin").unwrap();
        assert_eq!(spin.kind, StepKind::SplitOr);
        assert!(spin.is_self_referencing_switch());
        assert!(spin.matching_join.is_none());
        // Self-edge is the only back-edge: topo order still holds forward.
        let topo = g.topo_order();
        let pos = |n: &str| topo.iter().position(|s| s == n).unwrap();
        assert!(pos("start") < pos("spin"));
        assert!(pos("spin") < pos("done"));
    }

    /// Switch nested inside a foreach: the switch closes at its own
    /// convergence step (a join by in-edges), the foreach at the real join
    #[test]
    fn test_switch_inside_foreach() {
        let g = FlowGraph::analyse(
            "SwitchInFan",
            &[
                decl("start", &["fan"]),
                foreach_decl("fan", "route", "xs"),
                switch_decl("route", &["small", "large"], "size"),
                decl("small", &["merge"]),
                decl("large", &["merge"]),
                decl("merge", &["collect"]),
                join_decl("collect", &["end"]),
                decl("end", &[]),
            ],
        )
        .unwrap();
        // merge has two in-edges, so it classifies as a join even though
        // only one switch branch will ever reach it at runtime.
        assert_eq!(g.node("merge").unwrap().kind, StepKind::Join);
        assert_eq!(
            g.node("route").unwrap().matching_join.as_deref(),
            Some("merge")
        );
        assert_eq!(
            g.node("fan").unwrap().matching_join.as_deref(),
            Some("collect")
        );
    }

    /// 'start' may itself declare the foreach split
    #[test]
    fn test_start_as_foreach() {
        let g = FlowGraph::analyse(
            "StartFan",
            &[
                foreach_decl("start", "worker", "xs"),
                decl("worker", &["collect"]),
                join_decl("collect", &["end"]),
                decl("end", &[]),
            ],
        )
        .unwrap();
        assert_eq!(g.node("start").unwrap().kind, StepKind::Foreach);
        assert_eq!(
            g.node("start").unwrap().matching_join.as_deref(),
            Some("collect")
        );
    }

    #[test]
    fn test_parallel_split_marks_child() {
        let mut fan = decl("fan", &["train"]);
        fan.next.num_parallel = Some(4);
        let g = FlowGraph::analyse(
            "Par",
            &[
                decl("start", &["fan"]),
                fan,
                decl("train", &["collect"]),
                join_decl("collect", &["end"]),
                decl("end", &[]),
            ],
        )
        .unwrap();
        assert_eq!(g.node("fan").unwrap().kind, StepKind::Foreach);
        assert_eq!(g.node("fan").unwrap().num_parallel, 4);
        assert!(g.node("train").unwrap().parallel_step);
        assert_eq!(g.node("train").unwrap().num_parallel, 4);
    }

    #[test]
    fn test_ambiguous_transition_rejected() {
        let mut bad = decl("start", &["work"]);
        bad.next.foreach_var = Some("xs".to_string());
        bad.next.condition_var = Some("pick".to_string());
        let err = FlowGraph::analyse(
            "Bad",
            &[bad, decl("work", &["end"]), decl("end", &[])],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::GraphInvariant(_)));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let err = FlowGraph::analyse(
            "Dangling",
            &[decl("start", &["nowhere"]), decl("end", &[])],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::GraphInvariant(_)));
    }

    #[test]
    fn test_unreachable_step_rejected() {
        let err = FlowGraph::analyse(
            "Orphan",
            &[
                decl("start", &["end"]),
                decl("orphan", &["end"]),
                decl("end", &[]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::GraphInvariant(_)));
    }
}
