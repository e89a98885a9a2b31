use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// hoist.toml configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoistConfig {
    #[serde(default)]
    pub platform: PlatformConfig,
    /// Toolchain pins: toolchain name (e.g. `python`) → minimum version
    #[serde(default = "default_toolchain")]
    pub toolchain: BTreeMap<String, String>,
    #[serde(default)]
    pub build: BuildConfig,
    /// Runtime plugins: package name → version ("latest" or empty for unpinned)
    #[serde(default)]
    pub plugins: BTreeMap<String, String>,
    /// Packages deliberately left out, with the reason
    #[serde(default)]
    pub exclude: Vec<ExcludeConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub installers: InstallersConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Base distribution, `<os>-<version>`
    #[serde(default = "default_platform")]
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Source tree location, relative to the project directory
    #[serde(default = "default_source_dir")]
    pub source_dir: String,
    /// Directory inside the image where the source tree is copied and built
    #[serde(default = "default_app_dir")]
    pub app_dir: String,
    /// Build commands run in `app_dir`, in order
    #[serde(default = "default_steps")]
    pub steps: Vec<BuildStep>,
    /// Directories removed after the build (compilers' caches, node_modules, ...)
    #[serde(default = "default_build_only")]
    pub build_only: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    pub run: String,
    /// Steps that fetch from the network must set this to false
    #[serde(default = "default_true")]
    pub cacheable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeConfig {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Working directory of the running container
    #[serde(default = "default_app_dir")]
    pub workdir: String,
    /// Non-privileged account that owns `workdir` and runs the entry command
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    /// Static environment variables baked into the image
    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,
    /// Entry command, relative paths resolve against `workdir`
    #[serde(default = "default_entrypoint")]
    pub entrypoint: Vec<String>,
    /// Environment-specific configuration files, relative to the project directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<String>,
    /// Image directory the configuration files replace
    #[serde(default = "default_config_target")]
    pub config_target: String,
    /// Startup command file, relative to the project directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_script: Option<String>,
    /// Paths the running image needs; pruning must never touch them
    #[serde(default = "default_required_paths")]
    pub required_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallersConfig {
    /// Program used for system packages and toolchains
    #[serde(default = "default_system_installer")]
    pub system: String,
    /// Program used for runtime plugins, relative paths resolve against the app dir
    #[serde(default = "default_plugin_installer")]
    pub plugin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Layer cache directory, relative to the project directory
    #[serde(default = "default_cache_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Staging root holding the image filesystem, relative to the project directory
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    /// How commands see the staging root
    #[serde(default)]
    pub isolation: IsolationMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Commands run in a chroot of the staging root, bootstrapped on first use
    #[default]
    Chroot,
    /// Commands run on the host with working directories mapped under the
    /// staging root. System package installs act on the host itself.
    Rooted,
    /// Image paths are host paths; use when already inside the base image
    None,
}

impl Default for HoistConfig {
    fn default() -> Self {
        Self {
            platform: PlatformConfig::default(),
            toolchain: default_toolchain(),
            build: BuildConfig::default(),
            plugins: BTreeMap::new(),
            exclude: Vec::new(),
            runtime: RuntimeConfig::default(),
            installers: InstallersConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            target: default_platform(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            app_dir: default_app_dir(),
            steps: default_steps(),
            build_only: default_build_only(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workdir: default_app_dir(),
            user: default_user(),
            ports: default_ports(),
            env: default_env(),
            entrypoint: default_entrypoint(),
            config_dir: None,
            config_target: default_config_target(),
            startup_script: None,
            required_paths: default_required_paths(),
        }
    }
}

impl Default for InstallersConfig {
    fn default() -> Self {
        Self {
            system: default_system_installer(),
            plugin: default_plugin_installer(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            isolation: IsolationMode::default(),
        }
    }
}

impl HoistConfig {
    /// Load from hoist.toml at the given path, or return defaults if not found.
    pub fn load(project_dir: &Path) -> crate::Result<Self> {
        Self::load_file(&project_dir.join(CONFIG_FILE))
    }

    /// Load from an explicit manifest path, or return defaults if it does not exist.
    pub fn load_file(config_path: &Path) -> crate::Result<Self> {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| crate::Error::ConfigLoad {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;
            let config = toml::from_str(&content).map_err(|e| crate::Error::ConfigParse {
                path: config_path.to_path_buf(),
                source: e,
            })?;
            tracing::debug!(path = %config_path.display(), "loaded config");
            Ok(config)
        } else {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::ConfigSerialize { source: e })
    }
}

pub const CONFIG_FILE: &str = "hoist.toml";

fn default_true() -> bool {
    true
}

fn default_platform() -> String {
    "ubuntu-18.04".to_owned()
}

fn default_toolchain() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("python".to_owned(), "3.8".to_owned()),
        ("nodejs".to_owned(), "14".to_owned()),
    ])
}

fn default_source_dir() -> String {
    ".".to_owned()
}

fn default_app_dir() -> String {
    "/usr/share/hue".to_owned()
}

fn default_steps() -> Vec<BuildStep> {
    vec![
        BuildStep {
            run: "make apps".to_owned(),
            cacheable: false,
        },
        BuildStep {
            run: "npm run webpack".to_owned(),
            cacheable: true,
        },
    ]
}

fn default_build_only() -> Vec<String> {
    vec![
        "/usr/share/hue/node_modules".to_owned(),
        "/root/.cache".to_owned(),
        "/root/.npm".to_owned(),
    ]
}

fn default_user() -> String {
    "hue".to_owned()
}

fn default_ports() -> Vec<u16> {
    vec![8888]
}

fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([("PYTHON_VER".to_owned(), "python3.8".to_owned())])
}

fn default_entrypoint() -> Vec<String> {
    vec!["./startup.sh".to_owned()]
}

fn default_config_target() -> String {
    "/usr/share/hue/desktop/conf".to_owned()
}

fn default_required_paths() -> Vec<String> {
    vec![
        "/usr/share/hue/build/env".to_owned(),
        "/usr/share/hue/desktop/conf".to_owned(),
    ]
}

fn default_system_installer() -> String {
    "apt-get".to_owned()
}

fn default_plugin_installer() -> String {
    "./build/env/bin/pip".to_owned()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_cache_dir() -> String {
    ".hoist/cache".to_owned()
}

fn default_staging_dir() -> String {
    ".hoist/rootfs".to_owned()
}
