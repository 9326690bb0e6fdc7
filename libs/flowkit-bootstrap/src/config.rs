use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Application configuration: server-level settings and logging. The
/// workflow document itself is a separate file referenced by
/// `server.workflow` or the CLI.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Working directory for logs and module state; normalized to an
    /// absolute path and created on load.
    pub home_dir: String,
    /// Path to the workflow configuration document.
    #[serde(default)]
    pub workflow: Option<String>,
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit
/// subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "logs/flowd.log"; empty disables the file sink
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_backups: Option<usize>, // How many rotated files to keep
    #[serde(default)]
    pub max_size_mb: Option<u64>, // Max size of the file in MB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // Empty => $HOME/.flowd (or the platform equivalent).
            home_dir: String::new(),
            workflow: None,
        }
    }
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/flowd.log".to_string(),
            file_level: "debug".to_string(),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: Some(default_logging_config()),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file →
    /// environment variables (`FLOWD__SERVER__HOME_DIR=...`).
    /// Also normalizes `server.home_dir` into an absolute path and creates
    /// the directory.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        // Start from a minimal base so optional sections stay None unless
        // YAML/ENV provide them.
        let base = AppConfig {
            server: ServerConfig::default(),
            logging: None,
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(config_path.as_ref()))
            .merge(Env::prefixed("FLOWD__").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| "Failed to extract config from figment".to_string())?;

        normalize_home_dir_inplace(&mut config.server)
            .context("Failed to resolve server.home_dir")?;

        Ok(config)
    }

    /// Load configuration from file or create with default values.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self::default();
                normalize_home_dir_inplace(&mut c.server)
                    .context("Failed to resolve server.home_dir (defaults)")?;
                Ok(c)
            }
        }
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(workflow) = &args.workflow {
            self.server.workflow = Some(workflow.clone());
        }

        // Raise console verbosity for the "default" section per -v flags.
        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            default_section.console_level = match args.verbose {
                0 => default_section.console_level.clone(), // keep
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            };
        }
    }
}

/// Command line arguments structure.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub workflow: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
}

const fn default_subdir() -> &'static str {
    ".flowd"
}

/// Resolve and create the home directory, storing the absolute path back.
fn normalize_home_dir_inplace(server: &mut ServerConfig) -> Result<()> {
    let resolved: PathBuf = if server.home_dir.trim().is_empty() {
        let base = std::env::var_os("HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("USERPROFILE").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join(default_subdir())
    } else {
        let p = PathBuf::from(&server.home_dir);
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir()
                .context("current_dir unavailable")?
                .join(p)
        }
    };

    std::fs::create_dir_all(&resolved)
        .with_context(|| format!("Failed to create home_dir {resolved:?}"))?;
    server.home_dir = resolved.to_string_lossy().to_string();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_logging_section() {
        let cfg = AppConfig::default();
        let logging = cfg.logging.unwrap();
        assert!(logging.contains_key("default"));
    }

    #[test]
    fn load_layered_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.yaml");
        std::fs::write(
            &path,
            format!(
                "server:\n  home_dir: {}\n  workflow: flow.yaml\n",
                dir.path().join("home").display()
            ),
        )
        .unwrap();

        let cfg = AppConfig::load_layered(&path).unwrap();
        assert_eq!(cfg.server.workflow.as_deref(), Some("flow.yaml"));
        assert!(Path::new(&cfg.server.home_dir).is_absolute());
        assert!(Path::new(&cfg.server.home_dir).exists());
    }

    #[test]
    fn cli_overrides_workflow_and_verbosity() {
        let mut cfg = AppConfig::default();
        cfg.apply_cli_overrides(&CliArgs {
            workflow: Some("other.yaml".to_string()),
            verbose: 2,
            ..Default::default()
        });
        assert_eq!(cfg.server.workflow.as_deref(), Some("other.yaml"));
        let logging = cfg.logging.unwrap();
        assert_eq!(logging["default"].console_level, "trace");
    }
}
