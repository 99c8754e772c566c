use serde::Deserialize;
use std::env::VarError;
use std::path::{Path, PathBuf};

/// Path to the ComfyUI checkout (the folder holding `main.py`).
pub const ENV_DIR: &str = "NUKE_COMFYUI_DIR";
/// Interpreter used to run ComfyUI.
pub const ENV_PYTHON: &str = "NUKE_COMFYUI_PYTHON";
pub const ENV_IP: &str = "NUKE_COMFYUI_IP";
pub const ENV_PORT: &str = "NUKE_COMFYUI_PORT";
/// Extra flags, split with shell-word rules.
pub const ENV_FLAGS: &str = "NUKE_COMFYUI_FLAGS";

pub const DEFAULT_IP: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8188;
pub const DEFAULT_FLAGS: &str = "--log-stdout --disable-auto-launch";

#[cfg(windows)]
pub const DEFAULT_PYTHON: &str = "python";
#[cfg(not(windows))]
pub const DEFAULT_PYTHON: &str = "python3";

/// Everything needed to start one server, resolved once per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Default interpreter, used when no override is set.
    pub executable_path: String,
    pub working_directory: PathBuf,
    pub bind_ip: String,
    pub bind_port: u16,
    /// Passed through verbatim after `--port`.
    pub extra_flags: Vec<String>,
    pub python_override: Option<String>,
}

/// Errors raised while resolving configuration. All of them abort the
/// launch before anything is spawned.
#[derive(Debug)]
pub enum ConfigError {
    /// The working directory does not exist or is not a directory.
    MissingWorkingDirectory { path: PathBuf },
    /// None of the entry-point candidates exist in the working directory.
    MissingEntryPoint {
        dir: PathBuf,
        candidates: Vec<PathBuf>,
    },
    /// A port value could not be parsed as a u16.
    InvalidPort {
        origin: String,
        value: String,
        source: std::num::ParseIntError,
    },
    /// A flags string could not be split (e.g. unbalanced quotes).
    InvalidFlags {
        origin: String,
        value: String,
        source: shell_words::ParseError,
    },
    /// An environment variable is set but is not valid UTF-8.
    NotUnicode { var: String },
    /// The config file exists but could not be read or parsed.
    ConfigFile { path: PathBuf, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingWorkingDirectory { path } => write!(
                f,
                "ComfyUI directory not found: {}. Configure {ENV_DIR} correctly.",
                path.display()
            ),
            ConfigError::MissingEntryPoint { dir, candidates } => {
                let checked: Vec<String> = candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                write!(
                    f,
                    "ComfyUI entry script not found. Checked: {}. Configure {ENV_DIR} correctly. Current: {}",
                    checked.join(" and "),
                    dir.display()
                )
            }
            ConfigError::InvalidPort {
                origin,
                value,
                source,
            } => write!(f, "invalid port {value:?} from {origin}: {source}"),
            ConfigError::InvalidFlags {
                origin,
                value,
                source,
            } => write!(f, "invalid flags {value:?} from {origin}: {source}"),
            ConfigError::NotUnicode { var } => {
                write!(f, "{var} is set but is not valid UTF-8")
            }
            ConfigError::ConfigFile { path, message } => {
                write!(f, "failed to load {}: {message}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort { source, .. } => Some(source),
            ConfigError::InvalidFlags { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Optional on-disk configuration (`comfy-launch.toml`).
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerSection {
    pub dir: Option<PathBuf>,
    pub python: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub flags: Option<Vec<String>>,
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub dir: Option<PathBuf>,
    pub python: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub flags: Option<String>,
}

/// Load the config file at `path`. A missing file yields the defaults.
pub fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(FileConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::ConfigFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::ConfigFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Split a flags string the way a shell would. Empty input means no flags.
pub fn split_flags(value: &str, origin: &str) -> Result<Vec<String>, ConfigError> {
    shell_words::split(value).map_err(|e| ConfigError::InvalidFlags {
        origin: origin.to_string(),
        value: value.to_string(),
        source: e,
    })
}

fn parse_port(value: &str, origin: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|e| ConfigError::InvalidPort {
            origin: origin.to_string(),
            value: value.to_string(),
            source: e,
        })
}

impl LaunchConfig {
    /// Resolve the effective configuration.
    ///
    /// Precedence, lowest first: built-in defaults, the config file, the
    /// environment (read through `env`, shaped like `std::env::var`), then
    /// command-line overrides. Empty environment values count as unset,
    /// except for the flags variable where an empty string means "no extra
    /// flags". A variable that is set but not valid UTF-8 is an error, not
    /// a silent fallback.
    pub fn resolve<F>(
        file: &FileConfig,
        env: F,
        overrides: &Overrides,
        cwd: &Path,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let lookup = |key: &str| -> Result<Option<String>, ConfigError> {
            match env(key) {
                Ok(v) => Ok(Some(v)),
                Err(VarError::NotPresent) => Ok(None),
                Err(VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode {
                    var: key.to_string(),
                }),
            }
        };
        let non_empty = |key: &str| -> Result<Option<String>, ConfigError> {
            Ok(lookup(key)?.filter(|v| !v.trim().is_empty()))
        };
        let server = &file.server;

        let working_directory = match &overrides.dir {
            Some(dir) => dir.clone(),
            None => non_empty(ENV_DIR)?
                .map(PathBuf::from)
                .or_else(|| server.dir.clone())
                .unwrap_or_else(|| cwd.to_path_buf()),
        };
        let working_directory = if working_directory.is_relative() {
            cwd.join(working_directory)
        } else {
            working_directory
        };

        let python_override = match &overrides.python {
            Some(python) => Some(python.clone()),
            None => non_empty(ENV_PYTHON)?.or_else(|| server.python.clone()),
        };

        let bind_ip = match &overrides.ip {
            Some(ip) => ip.clone(),
            None => non_empty(ENV_IP)?
                .or_else(|| server.ip.clone())
                .unwrap_or_else(|| DEFAULT_IP.to_string()),
        };

        let bind_port = match overrides.port {
            Some(port) => port,
            None => match non_empty(ENV_PORT)? {
                Some(value) => parse_port(&value, ENV_PORT)?,
                None => server.port.unwrap_or(DEFAULT_PORT),
            },
        };

        let extra_flags = if let Some(flags) = &overrides.flags {
            split_flags(flags, "--flags")?
        } else if let Some(flags) = lookup(ENV_FLAGS)? {
            split_flags(&flags, ENV_FLAGS)?
        } else if let Some(flags) = &server.flags {
            flags.clone()
        } else {
            split_flags(DEFAULT_FLAGS, "defaults")?
        };

        Ok(Self {
            executable_path: DEFAULT_PYTHON.to_string(),
            working_directory,
            bind_ip,
            bind_port,
            extra_flags,
            python_override,
        })
    }

    /// The interpreter that will actually be run.
    pub fn interpreter(&self) -> &str {
        self.python_override
            .as_deref()
            .unwrap_or(&self.executable_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, VarError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned().ok_or(VarError::NotPresent)
    }

    fn resolve(pairs: &[(&str, &str)]) -> Result<LaunchConfig, ConfigError> {
        LaunchConfig::resolve(
            &FileConfig::default(),
            env_from(pairs),
            &Overrides::default(),
            Path::new("/work"),
        )
    }

    #[test]
    fn test_defaults() {
        let config = resolve(&[]).unwrap();
        assert_eq!(config.working_directory, PathBuf::from("/work"));
        assert_eq!(config.bind_ip, "127.0.0.1");
        assert_eq!(config.bind_port, 8188);
        assert_eq!(
            config.extra_flags,
            vec!["--log-stdout", "--disable-auto-launch"]
        );
        assert_eq!(config.python_override, None);
        assert_eq!(config.interpreter(), DEFAULT_PYTHON);
    }

    #[test]
    fn test_env_overrides() {
        let config = resolve(&[
            (ENV_DIR, "/opt/ComfyUI"),
            (ENV_PYTHON, "/opt/venv/bin/python"),
            (ENV_IP, "0.0.0.0"),
            (ENV_PORT, "9000"),
            (ENV_FLAGS, "--lowvram"),
        ])
        .unwrap();
        assert_eq!(config.working_directory, PathBuf::from("/opt/ComfyUI"));
        assert_eq!(config.interpreter(), "/opt/venv/bin/python");
        assert_eq!(config.bind_ip, "0.0.0.0");
        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.extra_flags, vec!["--lowvram"]);
    }

    #[test]
    fn test_empty_flags_env_means_no_flags() {
        let config = resolve(&[(ENV_FLAGS, "")]).unwrap();
        assert!(config.extra_flags.is_empty());
    }

    #[test]
    fn test_empty_values_count_as_unset() {
        let config = resolve(&[(ENV_PYTHON, ""), (ENV_PORT, " "), (ENV_IP, "")]).unwrap();
        assert_eq!(config.python_override, None);
        assert_eq!(config.bind_port, DEFAULT_PORT);
        assert_eq!(config.bind_ip, DEFAULT_IP);
    }

    #[test]
    fn test_flags_respect_quotes() {
        let config = resolve(&[(ENV_FLAGS, r#"--output-directory "/mnt/my renders" --cpu"#)])
            .unwrap();
        assert_eq!(
            config.extra_flags,
            vec!["--output-directory", "/mnt/my renders", "--cpu"]
        );
    }

    #[test]
    fn test_unbalanced_quote_is_error() {
        let err = resolve(&[(ENV_FLAGS, "--foo \"bar")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFlags { .. }));
        assert!(err.to_string().contains(ENV_FLAGS));
    }

    #[test]
    fn test_invalid_port_is_error() {
        let err = resolve(&[(ENV_PORT, "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { .. }));
        assert!(err.to_string().contains(ENV_PORT));

        let err = resolve(&[(ENV_PORT, "70000")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { .. }));
    }

    #[test]
    fn test_non_utf8_dir_is_error_not_fallback() {
        let env = |key: &str| {
            if key == ENV_DIR {
                Err(VarError::NotUnicode(std::ffi::OsString::from("ComfyUI")))
            } else {
                Err(VarError::NotPresent)
            }
        };
        let err = LaunchConfig::resolve(
            &FileConfig::default(),
            env,
            &Overrides::default(),
            Path::new("/work"),
        )
        .unwrap_err();
        assert!(matches!(&err, ConfigError::NotUnicode { var } if var == ENV_DIR));
        assert!(err.to_string().contains("not valid UTF-8"));

        // An explicit directory on the command line still wins.
        let overrides = Overrides {
            dir: Some(PathBuf::from("/opt/ComfyUI")),
            ..Default::default()
        };
        let config =
            LaunchConfig::resolve(&FileConfig::default(), env, &overrides, Path::new("/work"))
                .unwrap();
        assert_eq!(config.working_directory, PathBuf::from("/opt/ComfyUI"));
    }

    #[test]
    fn test_relative_dir_is_joined_to_cwd() {
        let config = resolve(&[(ENV_DIR, "ComfyUI")]).unwrap();
        assert_eq!(config.working_directory, PathBuf::from("/work/ComfyUI"));
    }

    #[test]
    fn test_precedence_file_env_cli() {
        let file: FileConfig = toml::from_str(
            r#"
[server]
dir = "/from/file"
ip = "10.0.0.1"
port = 7000
flags = ["--from-file"]
"#,
        )
        .unwrap();

        // File beats defaults.
        let config = LaunchConfig::resolve(
            &file,
            env_from(&[]),
            &Overrides::default(),
            Path::new("/work"),
        )
        .unwrap();
        assert_eq!(config.working_directory, PathBuf::from("/from/file"));
        assert_eq!(config.bind_ip, "10.0.0.1");
        assert_eq!(config.bind_port, 7000);
        assert_eq!(config.extra_flags, vec!["--from-file"]);

        // Environment beats file.
        let config = LaunchConfig::resolve(
            &file,
            env_from(&[(ENV_PORT, "7100"), (ENV_IP, "10.0.0.2")]),
            &Overrides::default(),
            Path::new("/work"),
        )
        .unwrap();
        assert_eq!(config.bind_port, 7100);
        assert_eq!(config.bind_ip, "10.0.0.2");
        assert_eq!(config.working_directory, PathBuf::from("/from/file"));

        // CLI beats environment.
        let overrides = Overrides {
            port: Some(7200),
            flags: Some("--cli-flag".to_string()),
            ..Default::default()
        };
        let config = LaunchConfig::resolve(
            &file,
            env_from(&[(ENV_PORT, "7100"), (ENV_FLAGS, "--env-flag")]),
            &overrides,
            Path::new("/work"),
        )
        .unwrap();
        assert_eq!(config.bind_port, 7200);
        assert_eq!(config.extra_flags, vec!["--cli-flag"]);
    }

    #[test]
    fn test_load_file_missing_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = load_file(&dir.path().join("absent.toml")).unwrap();
        assert!(file.server.dir.is_none());
        assert!(file.server.port.is_none());
    }

    #[test]
    fn test_load_file_parses_server_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comfy-launch.toml");
        std::fs::write(&path, "[server]\npython = \"/usr/bin/python3.11\"\nport = 8200\n").unwrap();
        let file = load_file(&path).unwrap();
        assert_eq!(file.server.python.as_deref(), Some("/usr/bin/python3.11"));
        assert_eq!(file.server.port, Some(8200));
    }

    #[test]
    fn test_load_file_invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comfy-launch.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        let err = load_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigFile { .. }));
    }
}
