use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub mounts: MountsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    /// Used by the default trigger pattern ("@{name}")
    #[serde(default = "default_assistant_name")]
    pub name: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: default_assistant_name(),
        }
    }
}

fn default_assistant_name() -> String {
    "Grid".to_string()
}

/// Filesystem layout. Relative entries resolve against `project_root`.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    #[serde(default = "default_groups_dir")]
    pub groups_dir: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            groups_dir: default_groups_dir(),
            data_dir: default_data_dir(),
            store_dir: default_store_dir(),
        }
    }
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_groups_dir() -> PathBuf {
    PathBuf::from("groups")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("store")
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Global ceiling on in-flight executions
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Container runtime CLI (docker, podman, ...)
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image: default_image(),
            memory: default_memory(),
            cpus: default_cpus(),
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "nanogridbot-agent:latest".to_string()
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpus() -> String {
    "1".to_string()
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct MountsConfig {
    /// Extra host roots operator mounts may come from
    #[serde(default)]
    pub allowlist: Vec<PathBuf>,
    /// Require every mount of a non-primary group to live under the groups root
    #[serde(default = "default_confine_non_primary")]
    pub confine_non_primary: bool,
}

impl Default for MountsConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            confine_non_primary: default_confine_non_primary(),
        }
    }
}

fn default_confine_non_primary() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

impl QueueConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl RuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl PathsConfig {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    pub fn groups_root(&self) -> PathBuf {
        self.resolve(&self.groups_dir)
    }

    pub fn data_root(&self) -> PathBuf {
        self.resolve(&self.data_dir)
    }

    pub fn store_root(&self) -> PathBuf {
        self.resolve(&self.store_dir)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses TOML after expanding `${ENV_VAR}` references.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        if config.queue.max_concurrent == 0 {
            anyhow::bail!("queue.max_concurrent must be at least 1");
        }
        Ok(config)
    }

    /// The default trigger: "@{name}" at the start of the message,
    /// on a word boundary, case-insensitive.
    pub fn default_trigger_pattern(&self) -> String {
        format!(r"(?i)^@{}\b", regex::escape(&self.assistant.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.assistant.name, "Grid");
        assert_eq!(config.queue.max_concurrent, 5);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.retry_base_delay(), Duration::from_secs(5));
        assert_eq!(config.sandbox.runtime, "docker");
        assert_eq!(config.sandbox.timeout_secs, 1800);
        assert!(config.mounts.confine_non_primary);
        assert_eq!(config.runtime.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
[assistant]
name = "Andy"

[queue]
max_concurrent = 2

[mounts]
allowlist = ["/srv/shared"]
confine_non_primary = false
"#,
        )
        .unwrap();
        assert_eq!(config.assistant.name, "Andy");
        assert_eq!(config.queue.max_concurrent, 2);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.mounts.allowlist, vec![PathBuf::from("/srv/shared")]);
        assert!(!config.mounts.confine_non_primary);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = Config::parse("[queue]\nmax_concurrent = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("NANOGRIDBOT_TEST_IMAGE", "agent:test");
        let config = Config::parse("[sandbox]\nimage = \"${NANOGRIDBOT_TEST_IMAGE}\"\n").unwrap();
        assert_eq!(config.sandbox.image, "agent:test");
    }

    #[test]
    fn test_paths_resolve_against_project_root() {
        let config = Config::parse(
            r#"
[paths]
project_root = "/opt/grid"
data_dir = "/var/lib/grid"
"#,
        )
        .unwrap();
        assert_eq!(config.paths.groups_root(), PathBuf::from("/opt/grid/groups"));
        assert_eq!(config.paths.data_root(), PathBuf::from("/var/lib/grid"));
        assert_eq!(config.paths.store_root(), PathBuf::from("/opt/grid/store"));
    }

    #[test]
    fn test_default_trigger_pattern_escapes_name() {
        let mut config = Config::default();
        config.assistant.name = "G.r+id".to_string();
        assert_eq!(config.default_trigger_pattern(), r"(?i)^@G\.r\+id\b");
    }
}
