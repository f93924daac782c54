//! Prompt templates.
//!
//! Agent prompts live as markdown under `prompts/` and are compiled into the
//! binary. Placeholders are `{{VAR}}`; `{{#if VAR}}...{{/if}}` keeps its body
//! only when `VAR` is set and non-blank.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Matches `{{#if VAR}}...{{/if}}` blocks (non-greedy, dotall).
static IF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{\{#if\s+(\w+)\}\}(.*?)\{\{/if\}\}")
        .expect("BUG: if_pattern regex is invalid")
});

/// Matches `{{VAR}}` variable placeholders.
static VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{(\w+)\}\}").expect("BUG: var_pattern regex is invalid")
});

/// A named prompt shipped with the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    System,
    Planner,
    Coder,
    Reviewer,
    CiFixer,
}

impl Prompt {
    fn source(self) -> &'static str {
        match self {
            Prompt::System => include_str!("../prompts/system.md"),
            Prompt::Planner => include_str!("../prompts/planner.md"),
            Prompt::Coder => include_str!("../prompts/coder.md"),
            Prompt::Reviewer => include_str!("../prompts/reviewer.md"),
            Prompt::CiFixer => include_str!("../prompts/ci_fixer.md"),
        }
    }

    /// Render this prompt with the given variables.
    pub fn render(self, vars: &HashMap<String, String>) -> Result<String, String> {
        render_template_str(self.source(), vars)
    }
}

/// Render a template string. Unknown variables render as empty.
pub fn render_template_str(
    template: &str,
    vars: &HashMap<String, String>,
) -> Result<String, String> {
    let mut data = template.to_string();

    // Nested blocks resolve inside-out across passes
    loop {
        let mut changed = false;
        let new_data = IF_PATTERN
            .replace_all(&data, |caps: &regex::Captures| {
                changed = true;
                let var_name = &caps[1];
                let content = &caps[2];
                match vars.get(var_name) {
                    Some(value) if !value.trim().is_empty() => content.to_string(),
                    _ => String::new(),
                }
            })
            .to_string();

        data = new_data;
        if !changed {
            break;
        }
    }

    let result = VAR_PATTERN
        .replace_all(&data, |caps: &regex::Captures| {
            let var_name = &caps[1];
            vars.get(var_name).cloned().unwrap_or_default()
        })
        .to_string();

    if result.trim().is_empty() {
        return Err("empty output".to_string());
    }

    Ok(result)
}
