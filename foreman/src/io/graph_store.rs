//! Task graph loading with schema validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::core::graph::{GraphSpec, build_tasks};
use crate::core::types::{Task, TaskId};

const TASK_GRAPH_SCHEMA: &str = include_str!("../../../schemas/task_graph/v1.schema.json");

/// Read a graph file, validate it against the v1 schema and build its tasks.
pub fn load_graph(path: &Path) -> Result<BTreeMap<TaskId, Task>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task graph {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse task graph {}", path.display()))?;
    let tasks = parse_graph(value).with_context(|| format!("load task graph {}", path.display()))?;
    debug!(path = %path.display(), tasks = tasks.len(), "task graph loaded");
    Ok(tasks)
}

/// Validate an already-parsed graph value and build its tasks.
pub fn parse_graph(value: Value) -> Result<BTreeMap<TaskId, Task>> {
    validate_schema(&value)?;
    let spec: GraphSpec = serde_json::from_value(value).context("deserialize task graph")?;
    build_tasks(&spec)
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(TASK_GRAPH_SCHEMA).context("parse task graph schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "task graph schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::error::{CyclicDependency, InvalidGraph};

    #[test]
    fn loads_valid_graph_from_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("graph.json");
        fs::write(
            &path,
            r#"{"tasks":[
                {"id":1,"description":"schema","files":["db.sql"]},
                {"id":2,"description":"api","depends_on":[1],"verification_command":"true"}
            ]}"#,
        )
        .expect("write");
        let tasks = load_graph(&path).expect("load");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[&TaskId(2)].phase_group, 1);
        assert_eq!(tasks[&TaskId(2)].verification_command.as_deref(), Some("true"));
    }

    #[test]
    fn schema_rejects_missing_description_and_unknown_fields() {
        let err = parse_graph(json!({"tasks":[{"id":1}]})).unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
        let err = parse_graph(json!({"tasks":[{"id":1,"description":"a","owner":"x"}]}))
            .unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn graph_errors_stay_typed() {
        let err = parse_graph(json!({"tasks":[
            {"id":1,"description":"a","depends_on":[2]},
            {"id":2,"description":"b","depends_on":[1]}
        ]}))
        .unwrap_err();
        assert!(err.downcast_ref::<CyclicDependency>().is_some());

        let err = parse_graph(json!({"tasks":[
            {"id":1,"description":"a"},
            {"id":1,"description":"b"}
        ]}))
        .unwrap_err();
        assert!(err.downcast_ref::<InvalidGraph>().is_some());
    }
}
