use portico_modules::{ConfigProvider, LoadPlan};

use serde_json::Value;
use std::{
    collections::HashMap,
    fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing_core::LevelFilter;

/// An error loading the host configuration.
#[derive(Debug, Error)]
pub enum ConfigError
{
    #[error("Could not read {path}: {source}")]
    Io
    {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not parse {path}: {source}")]
    Parse
    {
        path: PathBuf,
        #[source]
        source: json5::Error,
    },
}

#[derive(Clone,Debug,serde::Serialize,serde::Deserialize)]
#[serde(rename_all="lowercase")]
pub enum BuiltinLogTarget
{
    Stdout,
    Stderr,
}

#[derive(Clone,Debug,serde::Serialize,serde::Deserialize)]
#[serde(untagged)]
pub enum LogTarget
{
    File { filename: PathBuf },
    Builtin(BuiltinLogTarget),
}

#[derive(Clone,Copy,Debug,PartialEq,Eq,serde::Serialize,serde::Deserialize)]
#[serde(rename_all ="lowercase")]
pub enum LogLevel
{
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

#[derive(Clone,Copy,Debug,PartialEq,Eq,serde::Serialize,serde::Deserialize)]
#[serde(rename_all ="lowercase")]
pub enum LogFormat
{
    Full,
    Compact,
    Pretty
}

#[derive(Clone,Debug,serde::Deserialize)]
pub struct LogEntry
{
    pub target: LogTarget,
    #[serde(default)]
    pub modules: Vec<String>,
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
}

#[derive(Clone,Debug,serde::Deserialize)]
#[serde(rename_all="kebab-case")]
pub struct LoggingConfig
{
    pub dir: PathBuf,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub default_level: Option<LogLevel>,
    #[serde(default)]
    pub module_levels: HashMap<String, LogLevel>,
    #[serde(default)]
    pub targets: Vec<LogEntry>,
}

impl LoggingConfig
{
    pub fn prefix_file(&self, filename: impl AsRef<Path>) -> PathBuf
    {
        let mut path = self.dir.clone();
        path.push(filename);
        path
    }
}

impl From<LogLevel> for LevelFilter
{
    fn from(arg: LogLevel) -> LevelFilter
    {
        match arg
        {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info  => LevelFilter::INFO,
            LogLevel::Warn  => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off   => LevelFilter::OFF,
        }
    }
}

fn default_console_mode() -> u32 { 0o600 }

/// The operator console socket.
#[derive(Clone,Debug,serde::Deserialize)]
pub struct ConsoleConfig
{
    pub path: PathBuf,
    #[serde(default = "default_console_mode")]
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[derive(Clone,Debug,Default,serde::Deserialize)]
#[serde(default, rename_all="kebab-case")]
pub struct ModulesConfig
{
    /// Where shared-library modules live. Without it only built-in modules
    /// can be loaded.
    pub directory: Option<PathBuf>,
    #[serde(flatten)]
    pub plan: LoadPlan,
    /// Per-module parameters, keyed by module name.
    pub settings: HashMap<String, Value>,
}

fn default_server_name() -> String { "portico".to_string() }
fn default_listen_address() -> IpAddr { IpAddr::V4(Ipv4Addr::UNSPECIFIED) }
fn default_accept_poll_ms() -> u64 { 500 }

/// Configuration for the service host
#[derive(Clone,Debug,serde::Deserialize)]
#[serde(rename_all="kebab-case")]
pub struct ServerConfig
{
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,
    pub console: ConsoleConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
    pub log: LoggingConfig,
}

fn read_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError>
{
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    json5::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

impl ServerConfig
{
    /// Load configuration from a file
    pub fn load_file(filename: impl AsRef<Path>) -> Result<Self, ConfigError>
    {
        read_config(filename.as_ref())
    }
}

#[derive(Default,serde::Deserialize)]
struct SettingsOnly
{
    #[serde(default)]
    modules: SettingsSection,
}

#[derive(Default,serde::Deserialize)]
struct SettingsSection
{
    #[serde(default)]
    settings: HashMap<String, Value>,
}

/// Supplies module parameters from the `modules.settings` section of the
/// host configuration file.
///
/// The file is read again for every request, so reloading a module picks up
/// whatever the file says now.
pub struct FileConfigProvider
{
    path: PathBuf,
}

impl FileConfigProvider
{
    pub fn new(path: impl Into<PathBuf>) -> Self
    {
        Self { path: path.into() }
    }
}

impl ConfigProvider for FileConfigProvider
{
    fn module_config(&self, name: &str) -> anyhow::Result<Option<Value>>
    {
        let mut file: SettingsOnly = read_config(&self.path)?;
        Ok(file.modules.settings.remove(name))
    }
}
