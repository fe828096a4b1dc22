//! Registry of available executors
//!
//! Populated once at startup. Each entry carries the executor's capability
//! flags and directory defaults as plain data alongside a constructor.

use std::collections::HashMap;
use std::sync::Arc;

use super::batch::BatchExecutor;
use super::shell::ShellExecutor;
use super::slurm::SlurmScheduler;
use super::traits::Executor;

/// Capabilities an executor advertises to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutorFeatures {
    pub variables: bool,
    pub shared: bool,
    pub session: bool,
    pub terminal: bool,
}

/// Kind of shell scripts are generated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellType {
    Login,
    NonLogin,
}

/// Defaults the host applies when the configuration leaves them unset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorDefaults {
    pub default_setuid: bool,
    pub builds_dir: String,
    pub cache_dir: String,
    pub shared_builds_dir: bool,
    pub shell_type: ShellType,
    pub show_hostname: bool,
}

impl Default for ExecutorDefaults {
    fn default() -> Self {
        Self {
            default_setuid: false,
            builds_dir: "$PWD/builds".to_string(),
            cache_dir: "$PWD/cache".to_string(),
            shared_builds_dir: true,
            shell_type: ShellType::Login,
            show_hostname: false,
        }
    }
}

/// Registered executor variant
#[derive(Debug, Clone)]
pub struct ExecutorProvider {
    pub features: ExecutorFeatures,
    pub defaults: ExecutorDefaults,
    creator: fn() -> Arc<dyn Executor>,
}

impl ExecutorProvider {
    pub fn new(
        features: ExecutorFeatures,
        defaults: ExecutorDefaults,
        creator: fn() -> Arc<dyn Executor>,
    ) -> Self {
        Self {
            features,
            defaults,
            creator,
        }
    }

    /// Construct a fresh executor instance
    pub fn create(&self) -> Arc<dyn Executor> {
        (self.creator)()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("executor '{0}' is already registered")]
    Duplicate(String),

    #[error("unknown executor '{0}'")]
    Unknown(String),
}

/// Executors available to the runner, keyed by name
#[derive(Debug, Clone, Default)]
pub struct ExecutorRegistry {
    providers: HashMap<String, ExecutorProvider>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in "shell" and "hpc" executors
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let features = ExecutorFeatures {
            variables: true,
            shared: true,
            session: cfg!(unix),
            terminal: cfg!(unix),
        };

        let builtins: [(&str, fn() -> Arc<dyn Executor>); 2] =
            [("shell", create_shell), ("hpc", create_hpc)];
        for (name, creator) in builtins {
            let provider = ExecutorProvider::new(features, ExecutorDefaults::default(), creator);
            if let Err(e) = registry.register(name, provider) {
                tracing::warn!(error = %e, "skipping built-in executor");
            }
        }
        registry
    }

    pub fn register(&mut self, name: &str, provider: ExecutorProvider) -> Result<(), RegistryError> {
        if self.providers.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        tracing::debug!(executor = %name, "registering executor");
        let _ = self.providers.insert(name.to_string(), provider);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ExecutorProvider, RegistryError> {
        self.providers
            .get(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn create_shell() -> Arc<dyn Executor> {
    Arc::new(ShellExecutor::new())
}

fn create_hpc() -> Arc<dyn Executor> {
    Arc::new(BatchExecutor::new(Arc::new(SlurmScheduler::new())))
}
