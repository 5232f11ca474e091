//! How to invoke each supported agent CLI.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// How the prompt reaches the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptDelivery {
    /// Appended as the last argument
    #[default]
    Arg,
    /// Written to stdin, which is then closed
    Stdin,
}

/// Command line recipe for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefinition {
    pub command: String,
    pub args: Vec<String>,
    pub prompt: PromptDelivery,
    /// Flag preceding the model id, e.g. `--model`
    pub model_flag: Option<String>,
    /// Flag preceding a remote server URL, e.g. `--attach`
    pub attach_flag: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for AgentDefinition {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            prompt: PromptDelivery::Arg,
            model_flag: Some("--model".to_string()),
            attach_flag: None,
            env: BTreeMap::new(),
        }
    }
}

impl AgentDefinition {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_prompt(mut self, prompt: PromptDelivery) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_attach_flag(mut self, flag: impl Into<String>) -> Self {
        self.attach_flag = Some(flag.into());
        self
    }

    /// Full argument list for one invocation.
    pub fn build_args(&self, prompt: &str, model: Option<&str>, attach_url: Option<&str>) -> Vec<String> {
        let mut args = self.args.clone();
        if let (Some(flag), Some(model)) = (&self.model_flag, model) {
            args.push(flag.clone());
            args.push(model.to_string());
        }
        if let (Some(flag), Some(url)) = (&self.attach_flag, attach_url) {
            args.push(flag.clone());
            args.push(url.to_string());
        }
        if self.prompt == PromptDelivery::Arg {
            args.push(prompt.to_string());
        }
        args
    }
}

/// Agents known without any configuration.
pub fn builtin_agents() -> HashMap<String, AgentDefinition> {
    HashMap::from([
        (
            "claude".to_string(),
            AgentDefinition::new("claude").with_args([
                "--print",
                "--verbose",
                "--output-format",
                "stream-json",
                "--permission-mode",
                "bypassPermissions",
            ]),
        ),
        (
            "opencode".to_string(),
            AgentDefinition::new("opencode")
                .with_args(["run", "--print-logs"])
                .with_attach_flag("--attach"),
        ),
        (
            "codex".to_string(),
            AgentDefinition::new("codex").with_args(["exec", "--full-auto"]),
        ),
        (
            "gemini".to_string(),
            AgentDefinition::new("gemini")
                .with_args(["--yolo"])
                .with_prompt(PromptDelivery::Stdin),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_prompt_last() {
        let def = AgentDefinition::new("claude").with_args(["--print"]);
        let args = def.build_args("do it", Some("opus"), None);
        assert_eq!(args, vec!["--print", "--model", "opus", "do it"]);
    }

    #[test]
    fn test_build_args_attach_only_with_flag() {
        let def = AgentDefinition::new("opencode").with_args(["run"]).with_attach_flag("--attach");
        let args = def.build_args("p", None, Some("http://localhost:4096"));
        assert_eq!(args, vec!["run", "--attach", "http://localhost:4096", "p"]);

        let def = AgentDefinition::new("claude");
        assert_eq!(def.build_args("p", None, Some("http://x")), vec!["p"]);
    }

    #[test]
    fn test_stdin_delivery_omits_prompt_arg() {
        let def = AgentDefinition::new("gemini").with_prompt(PromptDelivery::Stdin);
        assert!(def.build_args("secret prompt", None, None).is_empty());
    }

    #[test]
    fn test_builtins() {
        let agents = builtin_agents();
        for id in ["claude", "opencode", "codex", "gemini"] {
            assert!(agents.contains_key(id), "missing {}", id);
        }
        assert_eq!(agents["opencode"].attach_flag.as_deref(), Some("--attach"));
    }

    #[test]
    fn test_definition_from_yaml() {
        let yaml = "command: aider\nargs: [--yes, --message]\nprompt: arg\n";
        let def: AgentDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.command, "aider");
        assert_eq!(def.args, vec!["--yes", "--message"]);
        assert_eq!(def.model_flag.as_deref(), Some("--model"));
    }
}
