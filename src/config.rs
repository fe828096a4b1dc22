use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::executor::ExecutorType;
use crate::identity::PolicyLists;

/// Data-directory setting that places builds under the validated user's home
pub const HOME_DATA_DIR: &str = "$HOME";

/// Runner configuration
///
/// Loaded from the `[runner]` table of a TOML file. Every field has a
/// default so an empty file yields a plain (non-SetUID) shell runner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Executor variant to run jobs with
    pub executor: ExecutorType,
    /// Run jobs as the validated submitter instead of the runner's own user
    pub setuid: bool,
    /// Where SetUID build/cache trees live: empty, `$HOME`, or a shared root
    pub setuid_data_dir: String,
    pub setuid_user_whitelist: Vec<String>,
    pub setuid_user_blacklist: Vec<String>,
    pub setuid_group_whitelist: Vec<String>,
    pub setuid_group_blacklist: Vec<String>,
    /// Build directory template (`$PWD` expands to the working directory)
    pub builds_dir: String,
    /// Cache directory template (`$PWD` expands to the working directory)
    pub cache_dir: String,
    /// Shell used to run generated scripts
    pub shell: String,
    /// Arguments passed to the shell before the script path
    pub shell_args: Vec<String>,
    /// Deliver the script as a temporary file instead of on stdin
    pub pass_file: bool,
    /// Extension of the temporary script file
    pub script_extension: String,
    /// Default tracing filter when RUST_LOG is unset
    pub log_filter: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorType::default(),
            setuid: false,
            setuid_data_dir: String::new(),
            setuid_user_whitelist: Vec::new(),
            setuid_user_blacklist: Vec::new(),
            setuid_group_whitelist: Vec::new(),
            setuid_group_blacklist: Vec::new(),
            builds_dir: default_builds_dir(),
            cache_dir: default_cache_dir(),
            shell: "bash".to_string(),
            shell_args: vec!["--login".to_string()],
            pass_file: true,
            script_extension: "sh".to_string(),
            log_filter: "setuid_runner=info".to_string(),
        }
    }
}

fn default_builds_dir() -> String {
    "$PWD/builds".to_string()
}

fn default_cache_dir() -> String {
    "$PWD/cache".to_string()
}

/// TOML file structure for runner configuration
#[derive(Debug, Default, Deserialize)]
struct RunnerConfigFile {
    #[serde(default)]
    runner: RunnerConfig,
}

impl RunnerConfig {
    /// Load runner configuration from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse runner configuration from a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: RunnerConfigFile = toml::from_str(contents)?;
        Ok(file.runner)
    }

    /// Whitelists and blacklists as one policy value
    pub fn policy(&self) -> PolicyLists {
        PolicyLists {
            user_whitelist: self.setuid_user_whitelist.clone(),
            user_blacklist: self.setuid_user_blacklist.clone(),
            group_whitelist: self.setuid_group_whitelist.clone(),
            group_blacklist: self.setuid_group_blacklist.clone(),
        }
    }

    /// The configured data-directory strategy
    pub fn data_dir(&self) -> DataDir {
        DataDir::from_setting(&self.setuid_data_dir)
    }
}

/// Errors loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Data-directory strategy for SetUID mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataDir {
    /// Expand the default build/cache templates and add per-user directories
    Default,
    /// `<home>/.gitlab-runner/{builds,cache}`
    Home,
    /// Externally provisioned shared root holding per-namespace trees
    SharedRoot(PathBuf),
}

impl DataDir {
    pub fn from_setting(setting: &str) -> Self {
        match setting {
            "" => DataDir::Default,
            HOME_DATA_DIR => DataDir::Home,
            root => DataDir::SharedRoot(PathBuf::from(root)),
        }
    }
}

/// Per-run options supplied by the host framework
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Identifier used in logs and trace output
    pub job_id: String,
    /// Login of the user who triggered the job (`GITLAB_USER_LOGIN`)
    pub login: String,
    /// Explicit shell user for plain mode
    pub user: Option<String>,
    /// Project namespace (`CI_PROJECT_NAMESPACE`)
    pub namespace: String,
    /// Project name (`CI_PROJECT_NAME`)
    pub project: String,
    /// Extra environment for the job
    pub env: BTreeMap<String, String>,
    /// Generated build script
    pub script: String,
}

/// Expand `$NAME` and `${NAME}` references in a path template
///
/// Unknown variables expand to the empty string. A `$` that does not start a
/// variable name is kept as-is.
pub fn expand_template(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                out.push_str(&lookup(&braced[..end]).unwrap_or_default());
                rest = &braced[end + 1..];
                continue;
            }
            out.push('$');
            rest = after;
            continue;
        }

        let name_len = after
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(after.len());
        if name_len == 0 {
            out.push('$');
            rest = after;
            continue;
        }
        out.push_str(&lookup(&after[..name_len]).unwrap_or_default());
        rest = &after[name_len..];
    }

    out.push_str(rest);
    out
}

/// Expand a template where only `PWD` is bound, to `working_dir`
pub fn expand_with_pwd(template: &str, working_dir: &Path) -> PathBuf {
    let pwd = working_dir.to_string_lossy().to_string();
    PathBuf::from(expand_template(template, |key| match key {
        "PWD" => Some(pwd.clone()),
        _ => None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.executor, ExecutorType::Shell);
        assert!(!config.setuid);
        assert_eq!(config.builds_dir, "$PWD/builds");
        assert_eq!(config.cache_dir, "$PWD/cache");
        assert!(config.pass_file);
        assert_eq!(config.data_dir(), DataDir::Default);
    }

    #[test]
    fn test_parse_setuid_config() {
        let config = RunnerConfig::from_toml_str(
            r#"
            [runner]
            executor = "hpc"
            setuid = true
            setuid_data_dir = "/data/ci/"
            setuid_user_blacklist = ["bob"]
            setuid_group_whitelist = ["eng", "ops"]
            "#,
        )
        .expect("valid config");

        assert_eq!(config.executor, ExecutorType::Hpc);
        assert!(config.setuid);
        assert_eq!(
            config.data_dir(),
            DataDir::SharedRoot(PathBuf::from("/data/ci/"))
        );
        let policy = config.policy();
        assert_eq!(policy.user_blacklist, vec!["bob".to_string()]);
        assert_eq!(policy.group_whitelist.len(), 2);
        assert!(policy.user_whitelist.is_empty());
        // untouched fields keep their defaults
        assert_eq!(config.shell, "bash");
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = RunnerConfig::from_toml_str("").expect("empty config");
        assert_eq!(config.script_extension, "sh");
    }

    #[test]
    fn test_unknown_executor_rejected() {
        let result = RunnerConfig::from_toml_str("[runner]\nexecutor = \"docker\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = RunnerConfig::from_toml_file(Path::new("/nonexistent/runner.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_data_dir_setting() {
        assert_eq!(DataDir::from_setting(""), DataDir::Default);
        assert_eq!(DataDir::from_setting("$HOME"), DataDir::Home);
        assert_eq!(
            DataDir::from_setting("/srv/ci"),
            DataDir::SharedRoot(PathBuf::from("/srv/ci"))
        );
    }

    #[test]
    fn test_expand_template() {
        let lookup = |key: &str| match key {
            "PWD" => Some("/srv/runner".to_string()),
            "USER" => Some("alice".to_string()),
            _ => None,
        };
        assert_eq!(expand_template("$PWD/builds", lookup), "/srv/runner/builds");
        assert_eq!(expand_template("${PWD}/cache", lookup), "/srv/runner/cache");
        assert_eq!(expand_template("/x/$USER-y", lookup), "/x/alice-y");
        assert_eq!(expand_template("/x/$UNSET/y", lookup), "/x//y");
        assert_eq!(expand_template("/plain/path", lookup), "/plain/path");
        assert_eq!(expand_template("cost$", lookup), "cost$");
        assert_eq!(expand_template("a${open", lookup), "a${open");
    }

    #[test]
    fn test_expand_with_pwd() {
        let expanded = expand_with_pwd("$PWD/builds", Path::new("/work"));
        assert_eq!(expanded, PathBuf::from("/work/builds"));
        let expanded = expand_with_pwd("$HOME/builds", Path::new("/work"));
        assert_eq!(expanded, PathBuf::from("/builds"));
    }
}
