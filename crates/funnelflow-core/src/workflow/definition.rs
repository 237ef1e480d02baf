//! Workflow definition parsing, validation, and graph linting.
//!
//! Converts YAML/JSON documents into the canonical `WorkflowDefinition`,
//! validates structural constraints once at load time (unique IDs, resolvable
//! successors, well-formed step configs), and reports non-fatal findings such
//! as unreachable steps or loops that never suspend.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use funnelflow_types::workflow::{StepConfig, WorkflowDefinition};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure (including malformed step configs).
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A successor reference points at a step that does not exist.
    #[error("unknown step reference: {0}")]
    UnknownStep(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization and logs any lint
/// findings at WARN.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    finish_load(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    finish_load(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load a workflow definition file. `.json` files are parsed as JSON,
/// everything else as YAML.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

fn finish_load(def: WorkflowDefinition) -> Result<WorkflowDefinition, WorkflowError> {
    validate_definition(&def)?;
    for finding in lint_definition(&def) {
        tracing::warn!(workflow = def.name.as_str(), "{finding}");
    }
    Ok(def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty
/// - At least one step exists
/// - All step IDs are non-empty and unique
/// - Every `nextStepId` and branch target names an existing step
/// - WEBHOOK steps have a non-blank URL
/// - DELAY durations are representable
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step ID must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in &def.steps {
        for target in step.successors() {
            if !seen_ids.contains(target) {
                return Err(WorkflowError::UnknownStep(format!(
                    "step '{}' points to unknown step '{}'",
                    step.id, target
                )));
            }
        }

        match &step.config {
            StepConfig::Webhook(config) if config.url.trim().is_empty() => {
                return Err(WorkflowError::ValidationError(format!(
                    "webhook step '{}' has no url",
                    step.id
                )));
            }
            StepConfig::Delay(config) if config.duration().is_none() => {
                return Err(WorkflowError::ValidationError(format!(
                    "delay step '{}' is out of range",
                    step.id
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Lint
// ---------------------------------------------------------------------------

/// Non-fatal findings about a (valid) definition, as human-readable messages.
///
/// - steps of a type this engine does not know (they fail when dispatched)
/// - branch targets on non-CONDITION steps (ignored)
/// - steps unreachable from the entry step
/// - cycles that contain no DELAY step (they spin without suspending)
pub fn lint_definition(def: &WorkflowDefinition) -> Vec<String> {
    let mut findings = Vec::new();

    for step in &def.steps {
        if let StepConfig::Unknown { step_type, .. } = &step.config {
            findings.push(format!("step '{}' has unknown type '{step_type}'", step.id));
        }
        if step.branches.is_some() && !matches!(step.config, StepConfig::Condition(_)) {
            findings.push(format!(
                "step '{}' declares branch targets but is not a CONDITION step",
                step.id
            ));
        }
    }

    let Some(first) = def.first_step() else {
        return findings;
    };
    let (graph, index) = step_graph(def);

    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&graph, index[first.id.as_str()]);
    while let Some(node) = dfs.next(&graph) {
        reachable.insert(node);
    }
    for step in &def.steps {
        if !reachable.contains(&index[step.id.as_str()]) {
            findings.push(format!("step '{}' is unreachable from '{}'", step.id, first.id));
        }
    }

    for component in tarjan_scc(&graph) {
        let is_cycle = component.len() > 1
            || component
                .first()
                .is_some_and(|n| graph.contains_edge(*n, *n));
        if !is_cycle {
            continue;
        }
        let suspends = component.iter().any(|n| {
            def.steps
                .iter()
                .find(|s| s.id == graph[*n])
                .is_some_and(|s| matches!(s.config, StepConfig::Delay(_)))
        });
        if !suspends {
            let mut ids: Vec<&str> = component.iter().map(|n| graph[*n]).collect();
            ids.sort_unstable();
            findings.push(format!("cycle without a DELAY step: {}", ids.join(", ")));
        }
    }

    findings
}

/// Build the step graph: one node per step, one edge per successor reference.
fn step_graph(def: &WorkflowDefinition) -> (DiGraph<&str, ()>, HashMap<&str, NodeIndex>) {
    let mut graph = DiGraph::<&str, ()>::new();
    let index: HashMap<&str, NodeIndex> = def
        .steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in &def.steps {
        for target in step.successors() {
            if let Some(to) = index.get(target) {
                graph.update_edge(index[step.id.as_str()], *to, ());
            }
        }
    }
    (graph, index)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const NURTURE_YAML: &str = r#"
name: lead-nurture
description: Tag new leads and send a welcome email
steps:
  - id: welcome
    type: SEND_EMAIL
    sortOrder: 0
    config:
      subject: "Welcome, {{ contact.firstName }}"
      content: "Thanks for signing up."
    nextStepId: wait
  - id: wait
    type: DELAY
    sortOrder: 1
    config:
      delayValue: 2
      delayUnit: days
    nextStepId: check
  - id: check
    type: CONDITION
    sortOrder: 2
    config:
      logic: or
      conditions:
        - field: contact.customFields.plan
          operator: equals
          value: pro
    conditions:
      trueStepId: notify
      falseStepId: done
  - id: notify
    type: WEBHOOK
    sortOrder: 3
    config:
      url: https://hooks.example.com/pro
    nextStepId: done
  - id: done
    type: END
    sortOrder: 4
"#;

    #[test]
    fn test_parse_yaml_roundtrip() {
        let def = parse_workflow_yaml(NURTURE_YAML).expect("should parse");
        assert_eq!(def.name, "lead-nurture");
        assert_eq!(def.steps.len(), 5);
        assert!(def.active);
        assert_eq!(def.first_step().unwrap().id, "welcome");
        assert!(lint_definition(&def).is_empty());

        let yaml = serialize_workflow_yaml(&def).expect("should serialize");
        let again = parse_workflow_yaml(&yaml).expect("should re-parse");
        assert_eq!(again.id, def.id);
        assert_eq!(again.steps, def.steps);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "name": "one-shot",
            "steps": [ { "id": "only", "type": "END" } ]
        }"#;
        let def = parse_workflow_json(json).expect("should parse");
        assert_eq!(def.steps[0].id, "only");
    }

    #[test]
    fn test_load_workflow_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("nurture.yaml");
        std::fs::write(&yaml_path, NURTURE_YAML).unwrap();
        assert_eq!(load_workflow_file(&yaml_path).unwrap().name, "lead-nurture");

        let json_path = dir.path().join("single.json");
        std::fs::write(
            &json_path,
            r#"{"name":"single","steps":[{"id":"end","type":"END"}]}"#,
        )
        .unwrap();
        assert_eq!(load_workflow_file(&json_path).unwrap().name, "single");

        let missing = load_workflow_file(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, WorkflowError::IoError(_)));
    }

    #[test]
    fn test_validation_rejects_duplicate_step_ids() {
        let yaml = r#"
name: dupes
steps:
  - { id: a, type: END }
  - { id: a, type: END }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"), "got: {err}");
    }

    #[test]
    fn test_validation_rejects_dangling_references() {
        let yaml = r#"
name: dangling
steps:
  - { id: a, type: ADD_TAG, config: { tag: x }, nextStepId: ghost }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownStep(_)), "got: {err}");

        let yaml = r#"
name: dangling-branch
steps:
  - id: a
    type: CONDITION
    conditions: { trueStepId: b, falseStepId: ghost }
  - { id: b, type: END }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("ghost"), "got: {err}");
    }

    #[test]
    fn test_validation_rejects_empty_workflow() {
        let err = parse_workflow_yaml("name: empty\nsteps: []\n").unwrap_err();
        assert!(err.to_string().contains("at least one step"), "got: {err}");
    }

    #[test]
    fn test_validation_rejects_blank_webhook_url() {
        let yaml = r#"
name: hook
steps:
  - { id: a, type: WEBHOOK, config: { method: POST } }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("has no url"), "got: {err}");
    }

    #[test]
    fn test_malformed_config_is_parse_error() {
        let yaml = r#"
name: bad-delay
steps:
  - { id: a, type: DELAY, config: { delayUnit: weeks, delayValue: 1 } }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)), "got: {err}");
    }

    #[test]
    fn test_lint_reports_unknown_types_and_unreachable_steps() {
        let yaml = r#"
name: lint-me
steps:
  - { id: start, type: SEND_SMS, sortOrder: 0, nextStepId: end }
  - { id: orphan, type: END, sortOrder: 1 }
  - { id: end, type: END, sortOrder: 2 }
"#;
        let def = parse_workflow_yaml(yaml).expect("unknown types still load");
        let findings = lint_definition(&def);
        assert!(findings.iter().any(|f| f.contains("unknown type 'SEND_SMS'")));
        assert!(findings.iter().any(|f| f.contains("'orphan' is unreachable")));
        assert!(!findings.iter().any(|f| f.contains("'end' is unreachable")));
    }

    #[test]
    fn test_lint_flags_cycles_without_delay() {
        let spinning = r#"
name: spin
steps:
  - { id: a, type: ADD_TAG, config: { tag: x }, nextStepId: b }
  - { id: b, type: REMOVE_TAG, config: { tag: x }, nextStepId: a }
"#;
        let def = parse_workflow_yaml(spinning).unwrap();
        assert!(lint_definition(&def).iter().any(|f| f.contains("cycle without a DELAY step: a, b")));

        let paced = r#"
name: paced
steps:
  - { id: a, type: SEND_EMAIL, config: { subject: hi, content: x }, nextStepId: b }
  - { id: b, type: DELAY, config: { delayValue: 7, delayUnit: days }, nextStepId: a }
"#;
        let def = parse_workflow_yaml(paced).unwrap();
        assert!(lint_definition(&def).is_empty());
    }

    #[test]
    fn test_bundled_demo_workflow_is_clean() {
        let def = parse_workflow_yaml(include_str!("../../../../demos/welcome-series.yaml"))
            .expect("demo workflow should parse");
        assert_eq!(def.first_step().unwrap().id, "welcome");
        assert_eq!(def.steps.len(), 7);
        assert!(lint_definition(&def).is_empty());
    }
}
