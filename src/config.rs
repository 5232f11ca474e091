use eyre::{Context, Result};
use ralph::agent::{AgentDefinition, builtin_agents};
use ralph::engine::EngineConfig;
use ralph::prompt::PromptRenderer;
use ralph::ratelimit::{BackoffPolicy, FallbackResolver};
use ralph::remote::DEFAULT_HEALTH_TIMEOUT;
use ralph::tasks::DEFAULT_PLAN_FILE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_agent: String,
    /// Agent definitions layered over the built-in ones
    pub agents: HashMap<String, AgentDefinition>,
    /// Primary agent id -> fallback agent id
    pub fallback_agents: HashMap<String, String>,
    pub backoff: BackoffPolicy,
    pub engine: EngineSection,
    pub plan: PlanConfig,
    pub prompt: PromptConfig,
    pub headless: HeadlessConfig,
    pub server: ServerConfig,
    pub sandbox: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_iterations: Option<u32>,
    pub continue_on_error: bool,
    pub idle_timeout_ms: Option<u64>,
    pub restore_primary_on_success: bool,
    pub use_pty: bool,
    pub pty_cols: u16,
    pub pty_rows: u16,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_iterations: None,
            continue_on_error: false,
            idle_timeout_ms: None,
            restore_primary_on_success: false,
            use_pty: false,
            pty_cols: ralph::process::DEFAULT_COLS,
            pty_rows: ralph::process::DEFAULT_ROWS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    pub path: PathBuf,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_PLAN_FILE),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Handlebars template; the built-in one when unset
    pub template: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessConfig {
    pub timestamps: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: Option<String>,
    pub health_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            health_timeout_ms: DEFAULT_HEALTH_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_agent: "claude".to_string(),
            agents: HashMap::new(),
            fallback_agents: HashMap::new(),
            backoff: BackoffPolicy::default(),
            engine: EngineSection::default(),
            plan: PlanConfig::default(),
            prompt: PromptConfig::default(),
            headless: HeadlessConfig::default(),
            server: ServerConfig::default(),
            sandbox: None,
            model: None,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");

        // Project-local: ./.<project>.yml
        let local_config = PathBuf::from(format!(".{}.yml", project_name));
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User-wide: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Built-in agents with configured ones layered on top.
    pub fn agent_definitions(&self) -> HashMap<String, AgentDefinition> {
        let mut agents = builtin_agents();
        agents.extend(self.agents.clone());
        agents
    }

    pub fn fallback_resolver(&self) -> FallbackResolver {
        FallbackResolver::new(self.fallback_agents.clone())
    }

    pub fn renderer(&self) -> Result<PromptRenderer> {
        let renderer = match &self.prompt.template {
            Some(template) => PromptRenderer::new(template.clone()),
            None => PromptRenderer::default(),
        };
        renderer.validate().context("Invalid prompt template")?;
        Ok(renderer)
    }

    /// Explicit engine settings for a run in `cwd`.
    pub fn engine_config(&self, cwd: impl Into<PathBuf>) -> EngineConfig {
        let mut engine = EngineConfig::new(cwd, self.default_agent.clone());
        engine.model = self.model.clone();
        engine.sandbox = self.sandbox.clone();
        engine.server_url = self.server.url.clone();
        engine.health_timeout = Duration::from_millis(self.server.health_timeout_ms);
        engine.max_iterations = self.engine.max_iterations;
        engine.continue_on_error = self.engine.continue_on_error;
        engine.idle_timeout = self.engine.idle_timeout_ms.map(Duration::from_millis);
        engine.restore_primary_on_success = self.engine.restore_primary_on_success;
        engine.backoff = self.backoff;
        engine
    }
}
