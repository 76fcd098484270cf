//! App discovery: maps an app name to how it is launched
//!
//! The default [`DirRegistry`] treats each entry in the apps directory as
//! one app. A directory (or a symlink to one) is launched with the
//! configured command; a plain file holding a port number or `host:port`
//! points at a server that is already running.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Env files read from an app directory, later files override earlier ones
const ENV_FILES: &[&str] = &[".env", ".powenv", ".devgate.env"];

/// How an app is brought up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSpec {
    /// A supervised process. `$PORT` in `args` is replaced with the bind port.
    Command {
        program: String,
        args: Vec<String>,
        dir: Option<PathBuf>,
        env: Vec<(String, String)>,
    },
    /// A server that is already listening; never spawned or killed
    Static { addr: String },
}

impl LaunchSpec {
    /// Build a command spec from a shell-style command line
    pub fn command(command_line: &str) -> Result<Self, RegistryError> {
        let mut words = shell_words::split(command_line)
            .map_err(|e| RegistryError::Invalid(format!("bad command '{}': {}", command_line, e)))?;
        if words.is_empty() {
            return Err(RegistryError::Invalid("empty command".to_string()));
        }
        let program = words.remove(0);
        Ok(LaunchSpec::Command {
            program,
            args: words,
            dir: None,
            env: Vec::new(),
        })
    }

    /// Set the working directory (builder pattern, command specs only)
    pub fn with_dir(mut self, path: impl Into<PathBuf>) -> Self {
        if let LaunchSpec::Command { dir, .. } = &mut self {
            *dir = Some(path.into());
        }
        self
    }

    /// Add an environment override (builder pattern, command specs only)
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let LaunchSpec::Command { env, .. } = &mut self {
            env.push((key.into(), value.into()));
        }
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no app named '{0}'")]
    NotFound(String),
    #[error("invalid app entry: {0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Looks up launch specs by app name
pub trait AppRegistry: Send + Sync {
    fn lookup(&self, name: &str) -> Result<LaunchSpec, RegistryError>;
}

/// Registry backed by a directory of app entries
pub struct DirRegistry {
    root: PathBuf,
    command: String,
}

impl DirRegistry {
    pub fn new(root: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            command: command.into(),
        }
    }
}

impl AppRegistry for DirRegistry {
    fn lookup(&self, name: &str) -> Result<LaunchSpec, RegistryError> {
        if !is_valid_name(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        let path = self.root.join(name);
        // Follows symlinks, which is how apps are usually linked in
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            let mut spec = LaunchSpec::command(&self.command)?.with_dir(&path);
            for (key, value) in load_env_files(&path)? {
                spec = spec.with_env(key, value);
            }
            debug!(name, dir = %path.display(), "Resolved directory app");
            return Ok(spec);
        }

        let content = std::fs::read_to_string(&path)?;
        let addr = parse_static_target(content.trim())
            .ok_or_else(|| RegistryError::Invalid(format!("{}: expected a port or host:port", path.display())))?;
        debug!(name, %addr, "Resolved static app");
        Ok(LaunchSpec::Static { addr })
    }
}

/// In-memory registry
#[derive(Default)]
pub struct StaticRegistry {
    apps: RwLock<HashMap<String, LaunchSpec>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, spec: LaunchSpec) {
        self.apps.write().insert(name.into(), spec);
    }

    pub fn remove(&self, name: &str) -> Option<LaunchSpec> {
        self.apps.write().remove(name)
    }
}

impl AppRegistry for StaticRegistry {
    fn lookup(&self, name: &str) -> Result<LaunchSpec, RegistryError> {
        self.apps
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
}

fn parse_static_target(content: &str) -> Option<String> {
    if let Ok(port) = content.parse::<u16>() {
        return (port > 0).then(|| format!("127.0.0.1:{}", port));
    }
    let (host, port) = content.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some(format!("{}:{}", host, port))
}

fn load_env_files(dir: &Path) -> Result<Vec<(String, String)>, RegistryError> {
    let mut vars: Vec<(String, String)> = Vec::new();
    for file in ENV_FILES {
        let path = dir.join(file);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for (key, value) in parse_env(&content) {
            vars.retain(|(k, _)| k != &key);
            vars.push((key, value));
        }
    }
    Ok(vars)
}

/// Parse `KEY=VALUE` lines, allowing `export ` prefixes, comments and quotes
fn parse_env(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
