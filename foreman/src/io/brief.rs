//! Task brief rendered for command workers.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::types::{AttemptContext, Task};

const TASK_TEMPLATE: &str = include_str!("briefs/task.md");

pub fn render_task_brief(
    task: &Task,
    attempt: &AttemptContext,
    workspace: &Path,
    output_path: &Path,
) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("task", TASK_TEMPLATE)?;
    let template = env.get_template("task")?;
    let rendered = template.render(context! {
        task => task,
        attempt => attempt,
        branch => task.branch_name(),
        workspace => workspace.display().to_string(),
        output_path => output_path.display().to_string(),
    })?;
    Ok(rendered)
}
