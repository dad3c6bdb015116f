//! Prompt assembly: the system prompt and the tool descriptors for a round.

use std::path::Path;

use chrono::Utc;

use spindle_domain::{AgentEvent, Config, ToolDefinition};

use crate::events::EventBus;

/// What the provider sees for one round. A `before_turn` hook may replace
/// the whole value for that round only.
#[derive(Debug, Clone)]
pub struct PromptParts {
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
}

/// Stable system prompt template, parameterized by workspace, wall-clock
/// day, and the configured role block.
pub(crate) fn build_system_prompt(workspace_dir: &Path, role: &str) -> String {
    let today = Utc::now().format("%Y-%m-%d");
    format!(
        "You are {role}.\n\n\
         Workspace directory: {}\n\
         Today's date: {today}\n\n\
         Use the available tools when a task needs external action or fresh \
         information; otherwise answer directly. Keep answers grounded in \
         tool results you actually received.",
        workspace_dir.display()
    )
}

/// Assemble the prompt and the tool descriptor union for one round.
///
/// Extra tools win name collisions against built-ins; each override emits a
/// `warning` event.
pub(crate) fn build_prompt(
    config: &Config,
    extra_defs: &[ToolDefinition],
    bus: &EventBus,
) -> PromptParts {
    let system_prompt = build_system_prompt(&config.workspace_dir, &config.role);

    let mut tools = crate::tools::builtin_tool_definitions(config.enable_orchestration);
    for def in extra_defs {
        if let Some(existing) = tools.iter_mut().find(|d| d.name == def.name) {
            bus.emit(AgentEvent::Warning {
                message: format!("extra tool '{}' overrides a built-in tool", def.name),
            });
            *existing = def.clone();
        } else {
            tools.push(def.clone());
        }
    }

    PromptParts {
        system_prompt,
        tools,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn system_prompt_carries_workspace_and_day() {
        let prompt = build_system_prompt(Path::new("/work/project"), "a test agent");
        assert!(prompt.contains("a test agent"));
        assert!(prompt.contains("/work/project"));
        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert!(prompt.contains(&today));
    }

    #[test]
    fn orchestration_tools_follow_config() {
        let mut config = Config::default();
        config.enable_orchestration = true;
        let parts = build_prompt(&config, &[], &EventBus::default());
        assert!(parts.tools.iter().any(|t| t.name == "sessions_spawn"));
        assert!(parts.tools.iter().any(|t| t.name == "subagents"));

        config.enable_orchestration = false;
        let parts = build_prompt(&config, &[], &EventBus::default());
        assert!(parts.tools.is_empty());
    }

    #[test]
    fn extra_tool_wins_collision_with_warning() {
        let config = Config::default();
        let warnings = Arc::new(parking_lot::Mutex::new(0usize));
        let warnings2 = warnings.clone();
        let bus = EventBus::new(vec![Arc::new(move |e: &AgentEvent| {
            if matches!(e, AgentEvent::Warning { .. }) {
                *warnings2.lock() += 1;
            }
        })]);

        let shadow = ToolDefinition {
            name: "subagents".into(),
            description: "replacement".into(),
            parameters: serde_json::json!({"type": "object"}),
        };
        let parts = build_prompt(&config, &[shadow], &bus);

        let subagents: Vec<_> = parts.tools.iter().filter(|t| t.name == "subagents").collect();
        assert_eq!(subagents.len(), 1);
        assert_eq!(subagents[0].description, "replacement");
        assert_eq!(*warnings.lock(), 1);
    }
}
