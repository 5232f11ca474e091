//! Prompt rendering with Handlebars.

use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{RalphError, Result};
use crate::tasks::Task;

/// Template used when none is configured.
pub const DEFAULT_TEMPLATE: &str = "\
You are working through the plan in {{plan_path}} (iteration {{iteration}}).

Implement the following task and nothing else:

## {{task.id}}: {{task.title}}

{{task.description}}

When the task is done, commit your changes with a message starting with {{task.id}}.";

/// Values available to a prompt template.
#[derive(Debug, Serialize)]
pub struct PromptContext<'a> {
    pub task: &'a Task,
    pub iteration: u32,
    pub plan_path: String,
}

impl<'a> PromptContext<'a> {
    pub fn new(task: &'a Task, iteration: u32, plan_path: Option<&Path>) -> Self {
        Self {
            task,
            iteration,
            plan_path: plan_path.map(|p| p.display().to_string()).unwrap_or_default(),
        }
    }
}

/// Renders the per-iteration agent prompt.
pub struct PromptRenderer {
    handlebars: Handlebars<'static>,
    template: String,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE)
    }
}

impl PromptRenderer {
    pub fn new(template: impl Into<String>) -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        // Prompts are plain text, never HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        Self {
            handlebars,
            template: template.into(),
        }
    }

    /// Fail early on a template that does not parse.
    pub fn validate(&self) -> Result<()> {
        handlebars::Template::compile(&self.template)
            .map(|_| ())
            .map_err(|e| RalphError::Template(format!("Invalid prompt template: {}", e)))
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn render(&self, context: &PromptContext<'_>) -> Result<String> {
        self.handlebars
            .render_template(&self.template, context)
            .map_err(|e| RalphError::Template(format!("Failed to render prompt: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn task() -> Task {
        Task::new("US-001", "Add login").with_description("Use <form> & POST")
    }

    #[test]
    fn test_render_task_fields() {
        let renderer = PromptRenderer::new("{{task.id}} {{task.title}} #{{iteration}} {{plan_path}}");
        let task = task();
        let plan = PathBuf::from("prd.json");
        let prompt = renderer.render(&PromptContext::new(&task, 3, Some(&plan))).unwrap();
        assert_eq!(prompt, "US-001 Add login #3 prd.json");
    }

    #[test]
    fn test_no_html_escaping() {
        let renderer = PromptRenderer::new("{{task.description}}");
        let task = task();
        let prompt = renderer.render(&PromptContext::new(&task, 1, None)).unwrap();
        assert_eq!(prompt, "Use <form> & POST");
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        let renderer = PromptRenderer::new("[{{nope}}]");
        let task = task();
        assert_eq!(renderer.render(&PromptContext::new(&task, 1, None)).unwrap(), "[]");
    }

    #[test]
    fn test_default_template_mentions_task() {
        let renderer = PromptRenderer::default();
        renderer.validate().unwrap();
        let task = task();
        let prompt = renderer.render(&PromptContext::new(&task, 2, None)).unwrap();
        assert!(prompt.contains("## US-001: Add login"));
        assert!(prompt.contains("iteration 2"));
    }

    #[test]
    fn test_invalid_template() {
        let renderer = PromptRenderer::new("{{#if}}");
        assert!(matches!(renderer.validate(), Err(RalphError::Template(_))));
    }
}
