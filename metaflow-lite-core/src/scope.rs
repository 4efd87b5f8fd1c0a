use crate::error::{CoreError, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

// ─── Join inputs ──────────────────────────────────────────────

/// Artifacts of one predecessor task contributing to a join.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputSlot {
    pub step_name: String,
    pub task_id: String,
    artifacts: ArtifactMap,
}

impl InputSlot {
    pub fn new(step_name: impl Into<String>, task_id: impl Into<String>, artifacts: ArtifactMap) -> Self {
        Self {
            step_name: step_name.into(),
            task_id: task_id.into(),
            artifacts,
        }
    }

    pub fn get(&self, name: &str) -> Result<&Value> {
        self.artifacts
            .get(name)
            .ok_or_else(|| CoreError::AttributeMissing(name.to_string()))
    }

    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        serde_json::from_value(self.get(name)?.clone())
            .map_err(|e| CoreError::Internal(format!("artifact '{name}' decode: {e}")))
    }

    pub fn has(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    /// Full artifact map, internal names included (`merge_artifacts`
    /// filters them itself).
    pub fn artifacts(&self) -> &ArtifactMap {
        &self.artifacts
    }
}

/// The ordered, name-indexed collection a join step receives: one entry
/// per contributing predecessor task.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Inputs {
    slots: Vec<InputSlot>,
}

impl Inputs {
    pub fn new(slots: Vec<InputSlot>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InputSlot> {
        self.slots.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&InputSlot> {
        self.slots.get(idx)
    }

    /// Look up a branch by its step name (first match wins).
    pub fn by_step(&self, step_name: &str) -> Option<&InputSlot> {
        self.slots.iter().find(|s| s.step_name == step_name)
    }
}

impl<'a> IntoIterator for &'a Inputs {
    type Item = &'a InputSlot;
    type IntoIter = std::slice::Iter<'a, InputSlot>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter()
    }
}

// ─── Per-task flow scope ──────────────────────────────────────

/// The per-task user-facing object: an explicit artifact map plus
/// parameter/config bindings, foreach context and the recorded transition.
///
/// Parameters, configs and class constants are immutable once bound;
/// reading a name that is neither fails with `AttributeMissing`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FlowScope {
    artifacts: ArtifactMap,
    immutable: BTreeSet<String>,
    input: Option<Value>,
    index: Option<usize>,
    foreach_stack: Vec<ForeachFrame>,
    recorded: Option<Transition>,
    declared: Option<Transition>,
    current_step: String,
    join_context: bool,
}

impl FlowScope {
    pub fn for_step(step_name: &str, declared: Option<Transition>, join_context: bool) -> Self {
        Self {
            current_step: step_name.to_string(),
            declared,
            join_context,
            ..Default::default()
        }
    }

    pub fn step_name(&self) -> &str {
        &self.current_step
    }

    // ── Binding (scheduler-side, before user code) ──

    /// Bind resolved parameter values as immutable attributes.
    pub fn bind_params(&mut self, params: &ArtifactMap) {
        for (name, value) in params {
            self.artifacts.insert(name.clone(), value.clone());
            self.immutable.insert(name.clone());
        }
    }

    /// Bind resolved config values as immutable attributes.
    pub fn bind_configs(&mut self, configs: &ArtifactMap) {
        for (name, value) in configs {
            self.artifacts.insert(name.clone(), value.clone());
            self.immutable.insert(name.clone());
        }
    }

    /// Bind class-level constants; artifacts inherited from a parent win.
    pub fn bind_class_vars(&mut self, vars: &ArtifactMap) {
        for (name, value) in vars {
            self.artifacts
                .entry(name.clone())
                .or_insert_with(|| value.clone());
            self.immutable.insert(name.clone());
        }
    }

    /// Copy every non-underscore artifact from the parent and extract
    /// `_foreach_stack` verbatim.
    pub fn load_parent_state(&mut self, parent: &ArtifactMap) {
        for (name, value) in parent {
            if !is_internal_artifact(name) {
                self.artifacts.insert(name.clone(), value.clone());
            } else if name == ART_FOREACH_STACK {
                self.foreach_stack = foreach_stack_from_value(value);
            }
        }
    }

    pub fn set_foreach_context(&mut self, input: Value, index: usize, stack: Vec<ForeachFrame>) {
        self.input = Some(input);
        self.index = Some(index);
        self.foreach_stack = stack;
    }

    /// Input/index without touching the foreach stack (parallel steps).
    pub fn set_input_context(&mut self, input: Value, index: usize) {
        self.input = Some(input);
        self.index = Some(index);
    }

    /// Reconstruct input/index from the innermost foreach frame.
    pub fn adopt_innermost_frame(&mut self) {
        if let Some(frame) = self.foreach_stack.last() {
            self.input = Some(frame.value.clone());
            self.index = Some(frame.index);
        }
    }

    // ── Artifact access (user-side) ──

    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        if is_internal_artifact(name) {
            return Err(CoreError::ImmutableAttribute(name.to_string()));
        }
        if self.immutable.contains(name) {
            return Err(CoreError::ImmutableAttribute(name.to_string()));
        }
        self.artifacts.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Value> {
        self.artifacts
            .get(name)
            .ok_or_else(|| CoreError::AttributeMissing(name.to_string()))
    }

    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        serde_json::from_value(self.get(name)?.clone())
            .map_err(|e| CoreError::Internal(format!("artifact '{name}' decode: {e}")))
    }

    pub fn has(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    /// Bypass immutability and the underscore guard. Scheduler and
    /// decorator use only.
    pub fn set_raw(&mut self, name: &str, value: Value) {
        self.artifacts.insert(name.to_string(), value);
    }

    /// User-visible artifacts (no underscore prefix).
    pub fn user_artifacts(&self) -> ArtifactMap {
        self.artifacts
            .iter()
            .filter(|(k, _)| !is_internal_artifact(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // ── Foreach context ──

    /// Current foreach frame's value.
    pub fn input(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    pub fn input_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let v = self
            .input
            .as_ref()
            .ok_or_else(|| CoreError::AttributeMissing("input".to_string()))?;
        serde_json::from_value(v.clone())
            .map_err(|e| CoreError::Internal(format!("input decode: {e}")))
    }

    /// Current foreach frame's index.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// The full nesting hierarchy as `(index, num_splits, value)` triples,
    /// outermost first.
    pub fn foreach_stack(&self) -> Vec<(usize, Option<usize>, Value)> {
        self.foreach_stack
            .iter()
            .map(|f| (f.index, f.num_splits, f.value.clone()))
            .collect()
    }

    pub fn foreach_frames(&self) -> &[ForeachFrame] {
        &self.foreach_stack
    }

    // ── Transitions ──

    /// Record a linear (or end-bound) transition.
    pub fn next(&mut self, target: &str) -> Result<()> {
        self.record(Transition {
            targets: vec![target.to_string()],
            ..Default::default()
        })
    }

    /// Record a branch split over several targets.
    pub fn next_split(&mut self, targets: &[&str]) -> Result<()> {
        self.record(Transition {
            targets: targets.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    /// Record a foreach split over the list artifact `var`.
    pub fn next_foreach(&mut self, target: &str, var: &str) -> Result<()> {
        self.record(Transition {
            targets: vec![target.to_string()],
            foreach_var: Some(var.to_string()),
            ..Default::default()
        })
    }

    /// Record a switch whose condition artifact selects the target.
    pub fn next_switch(&mut self, targets: &[&str], condition_var: &str) -> Result<()> {
        self.record(Transition {
            targets: targets.iter().map(|s| s.to_string()).collect(),
            condition_var: Some(condition_var.to_string()),
            ..Default::default()
        })
    }

    /// Record a dict-style switch mapping condition values to targets.
    pub fn next_switch_map(&mut self, condition_var: &str, map: &[(&str, &str)]) -> Result<()> {
        let switch_map: BTreeMap<String, String> = map
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut targets = Vec::new();
        for (_, v) in map {
            if !targets.contains(&v.to_string()) {
                targets.push(v.to_string());
            }
        }
        self.record(Transition {
            targets,
            condition_var: Some(condition_var.to_string()),
            switch_map: Some(switch_map),
            ..Default::default()
        })
    }

    /// Record a parallel split of `num_parallel` workers.
    pub fn next_parallel(&mut self, target: &str, num_parallel: usize) -> Result<()> {
        self.record(Transition {
            targets: vec![target.to_string()],
            num_parallel: Some(num_parallel),
            ..Default::default()
        })
    }

    fn record(&mut self, t: Transition) -> Result<()> {
        if let Some(declared) = &self.declared {
            // The runtime call must agree with the registration-time
            // declaration on targets and mode (the switch map itself may
            // be rebuilt at runtime).
            let same = declared.targets == t.targets
                && declared.foreach_var == t.foreach_var
                && declared.condition_var == t.condition_var
                && declared.num_parallel == t.num_parallel;
            if !same {
                return Err(CoreError::GraphInvariant(format!(
                    "step '{}' recorded a transition that does not match its declaration",
                    self.current_step
                )));
            }
            // Carry declaration-only attributes onto the recorded form.
            let mut recorded = t;
            recorded.unbounded = declared.unbounded;
            if recorded.switch_map.is_none() {
                recorded.switch_map = declared.switch_map.clone();
            }
            self.recorded = Some(recorded);
            return Ok(());
        }
        self.recorded = Some(t);
        Ok(())
    }

    /// The transition recorded by the last `next_*` call, if any.
    pub fn transition(&self) -> Option<&Transition> {
        self.recorded.as_ref()
    }

    // ── Join merge ──

    /// Merge artifacts from join inputs onto this scope.
    ///
    /// `exclude` and `include` are mutually exclusive. Candidates present
    /// with a single distinct value are adopted; conflicting names fail
    /// with `UnhandledInMerge` before anything is applied.
    pub fn merge_artifacts(
        &mut self,
        inputs: &Inputs,
        exclude: &[&str],
        include: &[&str],
    ) -> Result<()> {
        if !self.join_context {
            return Err(CoreError::Internal(
                "merge_artifacts can only be called in join steps".to_string(),
            ));
        }
        if !exclude.is_empty() && !include.is_empty() {
            return Err(CoreError::Internal(
                "cannot specify both 'exclude' and 'include' in merge_artifacts".to_string(),
            ));
        }

        let exclude: BTreeSet<&str> = exclude.iter().copied().collect();
        let include_set: Option<BTreeSet<&str>> = if include.is_empty() {
            None
        } else {
            Some(include.iter().copied().collect())
        };

        // Collect candidate values per name across every input.
        let mut candidates: BTreeMap<String, Vec<&Value>> = BTreeMap::new();
        let mut available: BTreeSet<String> = BTreeSet::new();
        for slot in inputs.iter() {
            for (name, value) in slot.artifacts() {
                if is_internal_artifact(name) {
                    continue;
                }
                available.insert(name.clone());
                if self.immutable.contains(name) || exclude.contains(name.as_str()) {
                    continue;
                }
                if let Some(inc) = &include_set {
                    if !inc.contains(name.as_str()) {
                        continue;
                    }
                }
                candidates.entry(name.clone()).or_default().push(value);
            }
        }

        if let Some(inc) = &include_set {
            let missing: Vec<String> = inc
                .iter()
                .filter(|n| {
                    !available.contains(**n)
                        && !self.artifacts.contains_key(**n)
                        && !self.immutable.contains(**n)
                })
                .map(|n| n.to_string())
                .collect();
            if !missing.is_empty() {
                return Err(CoreError::MissingInMerge(missing));
            }
        }

        let mut conflicts: Vec<String> = Vec::new();
        let mut to_set: BTreeMap<String, Value> = BTreeMap::new();
        for (name, values) in &candidates {
            if self.artifacts.contains_key(name) {
                continue;
            }
            let mut unique: Vec<&Value> = Vec::new();
            for v in values {
                if !unique.iter().any(|u| *u == *v) {
                    unique.push(v);
                }
            }
            match unique.len() {
                0 => {}
                1 => {
                    to_set.insert(name.clone(), (*unique[0]).clone());
                }
                _ => conflicts.push(name.clone()),
            }
        }

        if !conflicts.is_empty() {
            conflicts.sort();
            return Err(CoreError::UnhandledInMerge(conflicts));
        }

        for (name, value) in to_set {
            self.artifacts.insert(name, value);
        }
        Ok(())
    }

    // ── Persistence & retry ──

    /// End-of-task snapshot: all artifacts plus `_task_ok` and the
    /// foreach stack.
    pub fn persistable_state(&self, task_ok: bool) -> ArtifactMap {
        let mut arts = self.artifacts.clone();
        arts.insert(ART_TASK_OK.to_string(), Value::Bool(task_ok));
        arts.insert(
            ART_FOREACH_STACK.to_string(),
            foreach_stack_to_value(&self.foreach_stack),
        );
        arts
    }

    /// Reset artifacts to the pre-execution snapshot between attempts.
    pub fn reset_for_retry(&mut self, base: &ArtifactMap) {
        self.artifacts = base.clone();
        self.recorded = None;
    }

    /// Raw artifact map snapshot (for the retry baseline).
    pub fn snapshot(&self) -> ArtifactMap {
        self.artifacts.clone()
    }

    pub fn set_exception(&mut self, exc: &ExceptionInfo) {
        self.artifacts
            .insert(ART_EXCEPTION.to_string(), exc.to_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn join_scope() -> FlowScope {
        FlowScope::for_step("merge", None, true)
    }

    fn slot(step: &str, task: &str, arts: &[(&str, Value)]) -> InputSlot {
        InputSlot::new(
            step,
            task,
            arts.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        )
    }

    #[test]
    fn test_parameter_immutability() {
        let mut scope = FlowScope::for_step("start", None, false);
        scope.bind_params(&ArtifactMap::from([("alpha".to_string(), json!(0.5))]));
        assert_eq!(scope.get("alpha").unwrap(), &json!(0.5));
        let err = scope.set("alpha", json!(1.0)).unwrap_err();
        assert!(matches!(err, CoreError::ImmutableAttribute(_)));
    }

    #[test]
    fn test_attribute_missing() {
        let scope = FlowScope::for_step("start", None, false);
        assert!(matches!(
            scope.get("nope").unwrap_err(),
            CoreError::AttributeMissing(_)
        ));
    }

    #[test]
    fn test_underscore_names_rejected() {
        let mut scope = FlowScope::for_step("start", None, false);
        assert!(scope.set("_task_ok", json!(true)).is_err());
    }

    /// Parent state copies user artifacts and extracts the foreach stack
    #[test]
    fn test_load_parent_state() {
        let mut scope = FlowScope::for_step("worker", None, false);
        let stack = vec![ForeachFrame {
            step: "fan".into(),
            var: "xs".into(),
            index: 1,
            value: json!(2),
            num_splits: Some(3),
        }];
        let parent = ArtifactMap::from([
            ("x".to_string(), json!(7)),
            ("_task_ok".to_string(), json!(true)),
            ("_foreach_stack".to_string(), foreach_stack_to_value(&stack)),
        ]);
        scope.load_parent_state(&parent);
        assert_eq!(scope.get("x").unwrap(), &json!(7));
        assert!(!scope.has("_task_ok"));
        assert_eq!(scope.foreach_frames(), &stack[..]);
        scope.adopt_innermost_frame();
        assert_eq!(scope.input(), Some(&json!(2)));
        assert_eq!(scope.index(), Some(1));
    }

    /// foreach_stack() yields (index, num_splits, value), outermost first
    #[test]
    fn test_foreach_stack_triples() {
        let mut scope = FlowScope::for_step("leaf", None, false);
        scope.set_foreach_context(
            json!("b"),
            1,
            vec![
                ForeachFrame {
                    step: "outer".into(),
                    var: "xs".into(),
                    index: 0,
                    value: json!("a"),
                    num_splits: Some(2),
                },
                ForeachFrame {
                    step: "inner".into(),
                    var: "ys".into(),
                    index: 1,
                    value: json!("b"),
                    num_splits: None,
                },
            ],
        );
        let triples = scope.foreach_stack();
        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0], (0, Some(2), json!("a")));
        assert_eq!(triples[1], (1, None, json!("b")));
    }

    #[test]
    fn test_merge_adopts_single_values() {
        let mut scope = join_scope();
        let inputs = Inputs::new(vec![
            slot("a", "2", &[("x", json!(1)), ("shared", json!("s"))]),
            slot("b", "3", &[("y", json!(2)), ("shared", json!("s"))]),
        ]);
        scope.merge_artifacts(&inputs, &[], &[]).unwrap();
        assert_eq!(scope.get("x").unwrap(), &json!(1));
        assert_eq!(scope.get("y").unwrap(), &json!(2));
        assert_eq!(scope.get("shared").unwrap(), &json!("s"));
    }

    #[test]
    fn test_merge_conflict_fails_atomically() {
        let mut scope = join_scope();
        let inputs = Inputs::new(vec![
            slot("a", "2", &[("v", json!(10)), ("w", json!(1))]),
            slot("b", "3", &[("v", json!(20)), ("w", json!(1))]),
        ]);
        let err = scope.merge_artifacts(&inputs, &[], &[]).unwrap_err();
        match err {
            CoreError::UnhandledInMerge(names) => assert_eq!(names, vec!["v".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        // Nothing applied, not even the non-conflicting name.
        assert!(!scope.has("w"));
    }

    #[test]
    fn test_merge_conflict_resolved_by_presetting() {
        let mut scope = join_scope();
        scope.set("v", json!(99)).unwrap();
        let inputs = Inputs::new(vec![
            slot("a", "2", &[("v", json!(10))]),
            slot("b", "3", &[("v", json!(20))]),
        ]);
        scope.merge_artifacts(&inputs, &[], &[]).unwrap();
        assert_eq!(scope.get("v").unwrap(), &json!(99));
    }

    #[test]
    fn test_merge_exclude_and_include() {
        let mut scope = join_scope();
        let inputs = Inputs::new(vec![
            slot("a", "2", &[("v", json!(10)), ("k", json!(1))]),
            slot("b", "3", &[("v", json!(20)), ("k", json!(1))]),
        ]);
        scope.merge_artifacts(&inputs, &["v"], &[]).unwrap();
        assert_eq!(scope.get("k").unwrap(), &json!(1));
        assert!(!scope.has("v"));

        let mut scope2 = join_scope();
        scope2.merge_artifacts(&inputs, &[], &["k"]).unwrap();
        assert!(scope2.has("k"));
        assert!(!scope2.has("v"));
    }

    #[test]
    fn test_merge_include_missing_fails() {
        let mut scope = join_scope();
        let inputs = Inputs::new(vec![slot("a", "2", &[("k", json!(1))])]);
        let err = scope.merge_artifacts(&inputs, &[], &["ghost"]).unwrap_err();
        assert!(matches!(err, CoreError::MissingInMerge(_)));
    }

    #[test]
    fn test_merge_outside_join_rejected() {
        let mut scope = FlowScope::for_step("worker", None, false);
        let err = scope
            .merge_artifacts(&Inputs::default(), &[], &[])
            .unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));
    }

    /// A recorded transition must match the declared one
    #[test]
    fn test_transition_declaration_check() {
        let declared = Transition {
            targets: vec!["end".to_string()],
            ..Default::default()
        };
        let mut scope = FlowScope::for_step("start", Some(declared), false);
        assert!(scope.next("elsewhere").is_err());
        scope.next("end").unwrap();
        assert_eq!(scope.transition().unwrap().targets, vec!["end".to_string()]);
    }

    #[test]
    fn test_persistable_state_stamps_internals() {
        let mut scope = FlowScope::for_step("start", None, false);
        scope.set("x", json!(1)).unwrap();
        let arts = scope.persistable_state(true);
        assert_eq!(arts.get(ART_TASK_OK), Some(&json!(true)));
        assert!(arts.contains_key(ART_FOREACH_STACK));
    }

    #[test]
    fn test_reset_for_retry() {
        let mut scope = FlowScope::for_step("start", None, false);
        scope.set("x", json!(1)).unwrap();
        let base = scope.snapshot();
        scope.set("y", json!(2)).unwrap();
        scope.next("end").unwrap();
        scope.reset_for_retry(&base);
        assert!(scope.has("x"));
        assert!(!scope.has("y"));
        assert!(scope.transition().is_none());
    }
}
