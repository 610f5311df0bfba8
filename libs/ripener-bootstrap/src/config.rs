use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use ripener::module::{ModuleDefinition, MODULE_SYMBOLIC_NAME};
use ripener::wiring::{parse_capabilities, parse_requirements, PROVIDE_CAPABILITY, REQUIRE_CAPABILITY};
use ripener::{ModuleRegistry, RuntimeConfig};

/// Environment prefix; `RIPENER__RUNTIME__EVENT_ADMIN=false` maps to `runtime.event_admin`.
pub const ENV_PREFIX: &str = "RIPENER__";

/// One module definition as written in YAML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleEntry {
    /// Resource root. Relative paths resolve against `home_dir`; when absent
    /// the symbolic name is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Pre-listed resources, relative to the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
}

impl ModuleEntry {
    pub fn symbolic_name(&self) -> Option<&str> {
        self.headers.get(MODULE_SYMBOLIC_NAME).map(String::as_str)
    }
}

/// Application configuration: runtime policy, logging, module definitions
/// and pid configurations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Base directory for relative paths. Normalized to an absolute path on load.
    #[serde(default)]
    pub home_dir: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    /// Directory of per-module YAML files, appended to `modules` in file name order.
    #[serde(default)]
    pub modules_dir: Option<String>,
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
    /// pid → key → scalar value.
    #[serde(default)]
    pub configurations: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/ripener.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            home_dir: String::new(),
            runtime: RuntimeConfig::default(),
            logging: Some(default_logging_config()),
            modules_dir: None,
            modules: Vec::new(),
            configurations: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Layered loading: defaults → YAML file → `RIPENER__` environment.
    /// `home_dir` defaults to the directory holding the file.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        if !path.is_file() {
            anyhow::bail!("config file '{}' not found", path.display());
        }
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::extract(Some(path), &base)
    }

    /// Load from a file, or from defaults plus environment when no file is given.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let cwd = std::env::current_dir().context("Failed to read current directory")?;
                let mut config = Self::extract(None, &cwd)?;
                if config.logging.is_none() {
                    config.logging = Some(default_logging_config());
                }
                Ok(config)
            }
        }
    }

    fn extract(path: Option<&Path>, base: &Path) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        // Optional sections stay None unless YAML or env provide them.
        let defaults = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        let mut figment = Figment::new().merge(Serialized::defaults(defaults));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: AppConfig = figment
            .extract()
            .context("Failed to extract config from figment")?;

        config.home_dir = normalize_home_dir(&config.home_dir, base)?
            .to_string_lossy()
            .to_string();

        if let Some(dir) = config.modules_dir.clone() {
            let dir = resolve_path(&dir, Path::new(&config.home_dir));
            merge_module_files(&mut config.modules, &dir)
                .with_context(|| format!("Failed to read modules_dir '{}'", dir.display()))?;
        }

        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            default_section.console_level = match args.verbose {
                0 => default_section.console_level.clone(), // keep
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            };
        }
    }

    /// Module definitions in declaration order, roots resolved against `home_dir`.
    pub fn module_definitions(&self) -> Vec<ModuleDefinition> {
        let home = Path::new(&self.home_dir);
        self.modules
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let root = match (&entry.root, entry.symbolic_name()) {
                    (Some(root), _) => root.clone(),
                    (None, Some(name)) => name.to_string(),
                    (None, None) => format!("module-{i}"),
                };
                let mut definition = ModuleDefinition::new(resolve_path(&root, home));
                definition.headers = entry.headers.clone();
                definition.resources = entry.resources.clone();
                definition
            })
            .collect()
    }

    /// The configuration for `pid`, with scalar values rendered as strings.
    /// Non-scalar values are skipped.
    pub fn configuration(&self, pid: &str) -> Option<BTreeMap<String, String>> {
        let raw = self.configurations.get(pid)?;
        Some(
            raw.iter()
                .filter_map(|(k, v)| match scalar_to_string(v) {
                    Some(s) => Some((k.clone(), s)),
                    None => {
                        tracing::warn!(pid, key = %k, "Ignoring non-scalar configuration value");
                        None
                    }
                })
                .collect(),
        )
    }

    /// All pid configurations as string maps.
    pub fn configurations(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.configurations
            .keys()
            .filter_map(|pid| self.configuration(pid).map(|c| (pid.clone(), c)))
            .collect()
    }

    /// Check module headers and the priority list without starting anything.
    /// Returns warnings; malformed headers are errors.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        for (a, b) in ModuleRegistry::overlapping_prefixes(&self.runtime.priority) {
            warnings.push(format!(
                "priority prefixes '{a}' and '{b}' overlap; the first listed wins"
            ));
        }

        let mut seen = BTreeMap::new();
        for (i, entry) in self.modules.iter().enumerate() {
            let label = entry
                .symbolic_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("modules[{i}]"));
            if let Some(v) = entry.headers.get(PROVIDE_CAPABILITY) {
                parse_capabilities(v).with_context(|| format!("module '{label}'"))?;
            }
            if let Some(v) = entry.headers.get(REQUIRE_CAPABILITY) {
                parse_requirements(v).with_context(|| format!("module '{label}'"))?;
            }
            match entry.symbolic_name() {
                None => warnings.push(format!("{label} has no {MODULE_SYMBOLIC_NAME}")),
                Some(name) => {
                    if let Some(first) = seen.insert(name.to_string(), i) {
                        warnings.push(format!(
                            "symbolic name '{name}' declared by modules[{first}] and modules[{i}]"
                        ));
                    }
                }
            }
        }
        Ok(warnings)
    }
}

/// Command line arguments structure.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
}

fn normalize_home_dir(raw: &str, base: &Path) -> Result<PathBuf> {
    let base = if base.is_absolute() {
        base.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to read current directory")?
            .join(base)
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(base);
    }
    Ok(resolve_path(raw, &base))
}

fn resolve_path(p: &str, base: &Path) -> PathBuf {
    let path = Path::new(p);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn scalar_to_string(v: &serde_yaml::Value) -> Option<String> {
    match v {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn merge_module_files(modules: &mut Vec<ModuleEntry>, dir: &Path) -> Result<()> {
    use std::fs;
    if !dir.exists() {
        return Ok(());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext == "yml" || ext == "yaml" {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();
        let raw = fs::read_to_string(&path)?;
        let mut entry: ModuleEntry = serde_yaml::from_str(&raw)
            .with_context(|| format!("Invalid module file '{}'", path.display()))?;
        entry
            .headers
            .entry(MODULE_SYMBOLIC_NAME.to_string())
            .or_insert_with(|| stem.clone());
        if entry.root.is_none() {
            entry.root = Some(dir.join(&stem).to_string_lossy().to_string());
        }
        modules.push(entry);
    }
    Ok(())
}
