//! Build and cache directory provisioning for SetUID jobs
//!
//! Builds a per-tenant directory tree with the right owner, group and mode at
//! every level. Layout depends on the configured data directory:
//!
//! ```text
//! $HOME strategy:        {home}/.gitlab-runner/{builds,cache}
//! shared root strategy:  {root}/{namespace}/{project}/{builds,cache}/users/{login}
//! default strategy:      {builds_dir,cache_dir}/users/{login}
//! ```
//!
//! Provisioning is a plan of `DirectorySpec`s applied parent-first. A path
//! that already exists is left untouched, so running it for every job does
//! not perturb operator-managed structure. Nothing is rolled back on failure.
//!
//! Every planned path is checked without following symlinks, and ownership
//! and mode are applied through a handle opened with `O_NOFOLLOW`. Parents
//! above the first planned directory (the data root, a home directory, a
//! configured builds dir) are operator-managed and trusted.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use std::fs::{DirBuilder, File, OpenOptions, Permissions};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use crate::config::{expand_with_pwd, DataDir};
use crate::identity::Identity;

/// Mode of directories owned by the validated user
pub const USER_DIR_MODE: u32 = 0o750;
/// Mode of root-owned shared directories under an explicit data root
pub const SHARED_DIR_MODE: u32 = 0o701;
/// Mode of the root-owned `users/` parents in the default layout
pub const USERS_PARENT_MODE: u32 = 0o751;

const ROOT_UID: u32 = 0;
const ROOT_GID: u32 = 0;
const HOME_DATA_ROOT: &str = ".gitlab-runner";

/// Errors that can occur while provisioning directories
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(
        "the data dir {} specified in config must exist with the correct ownership before builds can be run",
        .0.display()
    )]
    DataDirMissing(PathBuf),

    #[error("could not create directory {} with mode {mode:04o}: {source}", .path.display())]
    CreateFailed {
        path: PathBuf,
        mode: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("could not change ownership of {} to {uid}:{gid}: {source}", .path.display())]
    OwnershipFailed {
        path: PathBuf,
        uid: u32,
        gid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("could not inspect {}: {source}", .path.display())]
    InspectFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {kind} '{value}' for a directory name")]
    InvalidComponent { kind: &'static str, value: String },

    #[error("refusing to provision {}: path is a symbolic link", .0.display())]
    SymlinkRefused(PathBuf),

    #[error("{} exists but is not a directory", .0.display())]
    NotADirectory(PathBuf),
}

/// A directory to create with a given owner, group and mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySpec {
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl DirectorySpec {
    pub fn new(path: impl Into<PathBuf>, uid: u32, gid: u32, mode: u32) -> Self {
        Self {
            path: path.into(),
            uid,
            gid,
            mode,
        }
    }

    fn owned_by(path: impl Into<PathBuf>, identity: &Identity) -> Self {
        Self::new(path, identity.uid, identity.gid, USER_DIR_MODE)
    }
}

/// Leaf directories handed back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedDirs {
    pub builds_dir: PathBuf,
    pub cache_dir: PathBuf,
}

/// Ordered directory plan plus the leaves it produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionPlan {
    pub specs: Vec<DirectorySpec>,
    pub dirs: ProvisionedDirs,
}

/// Inputs for a provisioning run that come from the job and host
#[derive(Debug, Clone)]
pub struct ProvisionRequest<'a> {
    pub data_dir: &'a DataDir,
    /// Project namespace, used by the shared root strategy
    pub namespace: &'a str,
    /// Project name, used by the shared root strategy
    pub project: &'a str,
    /// Build directory template for the default strategy
    pub builds_template: &'a str,
    /// Cache directory template for the default strategy
    pub cache_template: &'a str,
    /// Value substituted for `$PWD`
    pub working_dir: &'a Path,
}

/// Ownership changes, split out so provisioning can run unprivileged in tests
pub trait Ownership: Send + Sync {
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()>;
}

/// `lchown(2)` on the real filesystem; a symlink is never followed
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOwnership;

impl Ownership for SystemOwnership {
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))
    }
}

impl<T: Ownership + ?Sized> Ownership for std::sync::Arc<T> {
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
        (**self).chown(path, uid, gid)
    }
}

/// Creates directory trees for validated identities
#[derive(Debug, Default)]
pub struct DirectoryProvisioner<O = SystemOwnership> {
    ownership: O,
}

impl DirectoryProvisioner<SystemOwnership> {
    pub fn new() -> Self {
        Self {
            ownership: SystemOwnership,
        }
    }
}

impl<O: Ownership> DirectoryProvisioner<O> {
    /// Use a custom ownership backend
    pub fn with_ownership(ownership: O) -> Self {
        Self { ownership }
    }

    /// Plan and create the directory tree for `identity`
    pub fn provision(
        &self,
        identity: &Identity,
        request: &ProvisionRequest<'_>,
    ) -> Result<ProvisionedDirs, ProvisionError> {
        let plan = plan(identity, request)?;
        self.apply(&plan.specs)?;
        tracing::info!(
            login = %identity.login,
            builds_dir = %plan.dirs.builds_dir.display(),
            cache_dir = %plan.dirs.cache_dir.display(),
            "provisioned setuid data directories"
        );
        Ok(plan.dirs)
    }

    /// Apply specs in order, stopping at the first failure
    pub fn apply(&self, specs: &[DirectorySpec]) -> Result<(), ProvisionError> {
        for spec in specs {
            let _ = self.ensure(spec)?;
        }
        Ok(())
    }

    /// Create a single directory if it does not exist
    ///
    /// Returns whether the directory was created. An existing directory is
    /// left untouched, including its ownership and mode. A symlink or any
    /// other non-directory at the path is an error.
    pub fn ensure(&self, spec: &DirectorySpec) -> Result<bool, ProvisionError> {
        match std::fs::symlink_metadata(&spec.path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ProvisionError::SymlinkRefused(spec.path.clone()));
            }
            Ok(meta) if !meta.is_dir() => {
                return Err(ProvisionError::NotADirectory(spec.path.clone()));
            }
            Ok(_) => {
                tracing::debug!(path = %spec.path.display(), "directory exists, leaving as-is");
                return Ok(false);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ProvisionError::InspectFailed {
                    path: spec.path.clone(),
                    source,
                })
            }
        }

        let create_failed = |source| ProvisionError::CreateFailed {
            path: spec.path.clone(),
            mode: spec.mode,
            source,
        };

        // Recursive so a concurrent run creating the same path is not an error
        DirBuilder::new()
            .recursive(true)
            .mode(spec.mode)
            .create(&spec.path)
            .map_err(create_failed)?;

        // Fails if the path was swapped for a symlink after mkdir
        let dir = open_directory(&spec.path).map_err(|source| open_failed(&spec.path, source))?;

        self.ownership
            .chown(&spec.path, spec.uid, spec.gid)
            .map_err(|source| ProvisionError::OwnershipFailed {
                path: spec.path.clone(),
                uid: spec.uid,
                gid: spec.gid,
                source,
            })?;

        // mkdir honours the umask; set the exact mode afterwards
        dir.set_permissions(Permissions::from_mode(spec.mode))
            .map_err(create_failed)?;

        tracing::debug!(
            path = %spec.path.display(),
            uid = spec.uid,
            gid = spec.gid,
            mode = %format!("{:04o}", spec.mode),
            "created directory"
        );
        Ok(true)
    }
}

/// Open a directory without following a final symlink
fn open_directory(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC).bits())
        .open(path)
}

fn open_failed(path: &Path, source: std::io::Error) -> ProvisionError {
    match source.raw_os_error().map(Errno::from_raw) {
        Some(Errno::ELOOP) => ProvisionError::SymlinkRefused(path.to_path_buf()),
        Some(Errno::ENOTDIR) => ProvisionError::NotADirectory(path.to_path_buf()),
        _ => ProvisionError::InspectFailed {
            path: path.to_path_buf(),
            source,
        },
    }
}

/// Compute the directory plan for `identity`
///
/// Reads the filesystem only where the strategy requires it: the shared
/// root must exist, and an existing namespace directory donates its group
/// and mode to everything created beneath it.
pub fn plan(
    identity: &Identity,
    request: &ProvisionRequest<'_>,
) -> Result<ProvisionPlan, ProvisionError> {
    let login = checked_component("login", &identity.login)?;

    match request.data_dir {
        DataDir::Home => {
            let root = identity.home.join(HOME_DATA_ROOT);
            let builds_dir = root.join("builds");
            let cache_dir = root.join("cache");
            Ok(ProvisionPlan {
                specs: vec![
                    DirectorySpec::owned_by(&root, identity),
                    DirectorySpec::owned_by(&builds_dir, identity),
                    DirectorySpec::owned_by(&cache_dir, identity),
                ],
                dirs: ProvisionedDirs {
                    builds_dir,
                    cache_dir,
                },
            })
        }
        DataDir::SharedRoot(root) => {
            if !root.exists() {
                return Err(ProvisionError::DataDirMissing(root.clone()));
            }
            let namespace = checked_relative("namespace", request.namespace)?;
            let project = checked_component("project", request.project)?;

            let namespace_dir = root.join(namespace);
            let (gid, mode) = shared_ownership(&namespace_dir)?;
            let shared = |path: &Path| DirectorySpec::new(path, ROOT_UID, gid, mode);

            // Every level of a nested namespace is planned so none is
            // created implicitly
            let mut specs = Vec::new();
            let mut level = root.clone();
            for component in Path::new(namespace).components() {
                level.push(component);
                specs.push(shared(&level));
            }

            let project_dir = namespace_dir.join(project);
            let builds = project_dir.join("builds");
            let cache = project_dir.join("cache");
            let users_builds = builds.join("users");
            let users_cache = cache.join("users");
            let builds_dir = users_builds.join(login);
            let cache_dir = users_cache.join(login);

            specs.extend([
                shared(&project_dir),
                shared(&builds),
                shared(&cache),
                shared(&users_builds),
                shared(&users_cache),
                DirectorySpec::owned_by(&builds_dir, identity),
                DirectorySpec::owned_by(&cache_dir, identity),
            ]);
            Ok(ProvisionPlan {
                specs,
                dirs: ProvisionedDirs {
                    builds_dir,
                    cache_dir,
                },
            })
        }
        DataDir::Default => {
            let users_builds =
                expand_with_pwd(request.builds_template, request.working_dir).join("users");
            let users_cache =
                expand_with_pwd(request.cache_template, request.working_dir).join("users");
            let builds_dir = users_builds.join(login);
            let cache_dir = users_cache.join(login);

            Ok(ProvisionPlan {
                specs: vec![
                    DirectorySpec::new(&users_builds, ROOT_UID, ROOT_GID, USERS_PARENT_MODE),
                    DirectorySpec::new(&users_cache, ROOT_UID, ROOT_GID, USERS_PARENT_MODE),
                    DirectorySpec::owned_by(&builds_dir, identity),
                    DirectorySpec::owned_by(&cache_dir, identity),
                ],
                dirs: ProvisionedDirs {
                    builds_dir,
                    cache_dir,
                },
            })
        }
    }
}

/// Group and mode for shared directories under a namespace directory
///
/// A fresh namespace gets root:root 0701. An existing one, possibly created
/// by an operator with a custom group, is copied from its on-disk state.
fn shared_ownership(namespace_dir: &Path) -> Result<(u32, u32), ProvisionError> {
    match std::fs::symlink_metadata(namespace_dir) {
        Ok(meta) if meta.file_type().is_symlink() => {
            Err(ProvisionError::SymlinkRefused(namespace_dir.to_path_buf()))
        }
        Ok(meta) => {
            let gid = meta.gid();
            let mode = meta.permissions().mode() & 0o7777;
            tracing::debug!(
                path = %namespace_dir.display(),
                gid,
                mode = %format!("{:04o}", mode),
                "inheriting ownership from existing namespace directory"
            );
            Ok((gid, mode))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((ROOT_GID, SHARED_DIR_MODE)),
        Err(source) => Err(ProvisionError::InspectFailed {
            path: namespace_dir.to_path_buf(),
            source,
        }),
    }
}

/// A single path component: non-empty, no separators, not `.` or `..`
fn checked_component<'a>(kind: &'static str, value: &'a str) -> Result<&'a str, ProvisionError> {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !value.contains('/') => Ok(value),
        _ => Err(ProvisionError::InvalidComponent {
            kind,
            value: value.to_string(),
        }),
    }
}

/// A relative path made only of normal components (nested namespaces)
fn checked_relative<'a>(kind: &'static str, value: &'a str) -> Result<&'a str, ProvisionError> {
    let path = Path::new(value);
    let valid = !value.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(value)
    } else {
        Err(ProvisionError::InvalidComponent {
            kind,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_ownership {
    use super::*;
    use std::sync::Mutex;

    /// Records chown calls instead of applying them
    #[derive(Debug, Default)]
    pub struct RecordingOwnership {
        pub calls: Mutex<Vec<(PathBuf, u32, u32)>>,
        pub fail_on: Option<PathBuf>,
    }

    impl RecordingOwnership {
        pub fn calls(&self) -> Vec<(PathBuf, u32, u32)> {
            self.calls.lock().expect("lock poisoned").clone()
        }
    }

    impl Ownership for RecordingOwnership {
        fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
            if self.fail_on.as_deref() == Some(path) {
                return Err(std::io::Error::from(nix::errno::Errno::EPERM));
            }
            self.calls
                .lock()
                .expect("lock poisoned")
                .push((path.to_path_buf(), uid, gid));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_ownership::RecordingOwnership;
    use super::*;
    use crate::identity::test_accounts::account;
    use tempfile::tempdir;

    fn mode_of(path: &Path) -> u32 {
        std::fs::metadata(path)
            .expect("path should exist")
            .permissions()
            .mode()
            & 0o7777
    }

    fn request<'a>(data_dir: &'a DataDir, working_dir: &'a Path) -> ProvisionRequest<'a> {
        ProvisionRequest {
            data_dir,
            namespace: "platform",
            project: "api",
            builds_template: "$PWD/builds",
            cache_template: "$PWD/cache",
            working_dir,
        }
    }

    fn alice_at(home: &Path) -> Identity {
        let mut identity = account("alice", 1001, &["eng"]);
        identity.home = home.to_path_buf();
        identity
    }

    #[test]
    fn test_home_strategy_layout() {
        let temp = tempdir().expect("Failed to create temp dir");
        let identity = alice_at(temp.path());
        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership::default());

        let dirs = provisioner
            .provision(&identity, &request(&DataDir::Home, temp.path()))
            .expect("provisioning failed");

        let root = temp.path().join(".gitlab-runner");
        assert_eq!(dirs.builds_dir, root.join("builds"));
        assert_eq!(dirs.cache_dir, root.join("cache"));
        for path in [&root, &dirs.builds_dir, &dirs.cache_dir] {
            assert!(path.is_dir());
            assert_eq!(mode_of(path), 0o750);
        }
        let calls = provisioner.ownership.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(_, uid, gid)| *uid == 1001 && *gid == 1001));
    }

    #[test]
    fn test_shared_root_must_exist() {
        let temp = tempdir().expect("Failed to create temp dir");
        let missing = temp.path().join("not-there");
        let data_dir = DataDir::SharedRoot(missing.clone());
        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership::default());

        let err = provisioner
            .provision(&alice_at(temp.path()), &request(&data_dir, temp.path()))
            .expect_err("missing data dir must fail");

        assert!(matches!(err, ProvisionError::DataDirMissing(ref p) if *p == missing));
        assert!(!missing.exists());
        assert!(provisioner.ownership.calls().is_empty());
    }

    #[test]
    fn test_shared_root_fresh_namespace() {
        let temp = tempdir().expect("Failed to create temp dir");
        let data_dir = DataDir::SharedRoot(temp.path().to_path_buf());
        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership::default());

        let dirs = provisioner
            .provision(&alice_at(temp.path()), &request(&data_dir, temp.path()))
            .expect("provisioning failed");

        let project = temp.path().join("platform").join("api");
        assert_eq!(dirs.builds_dir, project.join("builds/users/alice"));
        assert_eq!(dirs.cache_dir, project.join("cache/users/alice"));

        for shared in [
            temp.path().join("platform"),
            project.clone(),
            project.join("builds"),
            project.join("cache"),
            project.join("builds/users"),
            project.join("cache/users"),
        ] {
            assert_eq!(mode_of(&shared), 0o701, "mode of {}", shared.display());
        }
        assert_eq!(mode_of(&dirs.builds_dir), 0o750);
        assert_eq!(mode_of(&dirs.cache_dir), 0o750);

        let calls = provisioner.ownership.calls();
        assert_eq!(calls.len(), 8);
        assert_eq!(calls[0], (temp.path().join("platform"), 0, 0));
        assert_eq!(calls[6], (dirs.builds_dir.clone(), 1001, 1001));
        assert_eq!(calls[7], (dirs.cache_dir.clone(), 1001, 1001));
    }

    #[test]
    fn test_shared_root_inherits_namespace_group_and_mode() {
        let temp = tempdir().expect("Failed to create temp dir");
        let namespace_dir = temp.path().join("platform");
        std::fs::create_dir(&namespace_dir).expect("create namespace dir");
        std::fs::set_permissions(&namespace_dir, Permissions::from_mode(0o770))
            .expect("chmod namespace dir");
        let namespace_gid = std::fs::metadata(&namespace_dir).expect("stat").gid();

        let data_dir = DataDir::SharedRoot(temp.path().to_path_buf());
        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership::default());
        let dirs = provisioner
            .provision(&alice_at(temp.path()), &request(&data_dir, temp.path()))
            .expect("provisioning failed");

        let project = namespace_dir.join("api");
        assert_eq!(mode_of(&project), 0o770);
        assert_eq!(mode_of(&project.join("builds/users")), 0o770);
        assert_eq!(mode_of(&dirs.builds_dir), 0o750);

        let calls = provisioner.ownership.calls();
        // namespace dir already existed, so it is neither re-created nor chowned
        assert!(calls.iter().all(|(path, _, _)| *path != namespace_dir));
        assert_eq!(calls[0], (project.clone(), 0, namespace_gid));
        assert_eq!(mode_of(&namespace_dir), 0o770);
    }

    #[test]
    fn test_plan_uses_inherited_values() {
        let temp = tempdir().expect("Failed to create temp dir");
        let namespace_dir = temp.path().join("platform");
        std::fs::create_dir(&namespace_dir).expect("create namespace dir");
        std::fs::set_permissions(&namespace_dir, Permissions::from_mode(0o2770))
            .expect("chmod namespace dir");
        let data_dir = DataDir::SharedRoot(temp.path().to_path_buf());

        let plan = plan(&alice_at(temp.path()), &request(&data_dir, temp.path()))
            .expect("planning failed");

        assert_eq!(plan.specs.len(), 8);
        assert!(plan.specs[..6].iter().all(|s| s.mode == 0o2770 && s.uid == 0));
        assert!(plan.specs[6..].iter().all(|s| s.mode == 0o750 && s.uid == 1001));
    }

    #[test]
    fn test_default_strategy_layout() {
        let temp = tempdir().expect("Failed to create temp dir");
        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership::default());

        let dirs = provisioner
            .provision(
                &alice_at(temp.path()),
                &request(&DataDir::Default, temp.path()),
            )
            .expect("provisioning failed");

        assert_eq!(dirs.builds_dir, temp.path().join("builds/users/alice"));
        assert_eq!(dirs.cache_dir, temp.path().join("cache/users/alice"));
        assert_eq!(mode_of(&temp.path().join("builds/users")), 0o751);
        assert_eq!(mode_of(&temp.path().join("cache/users")), 0o751);
        assert_eq!(mode_of(&dirs.builds_dir), 0o750);

        let calls = provisioner.ownership.calls();
        assert_eq!(calls[0], (temp.path().join("builds/users"), 0, 0));
        assert_eq!(calls[2], (dirs.builds_dir.clone(), 1001, 1001));
    }

    #[test]
    fn test_provisioning_is_idempotent() {
        let temp = tempdir().expect("Failed to create temp dir");
        let data_dir = DataDir::SharedRoot(temp.path().to_path_buf());
        let identity = alice_at(temp.path());

        let first = DirectoryProvisioner::with_ownership(RecordingOwnership::default());
        let dirs = first
            .provision(&identity, &request(&data_dir, temp.path()))
            .expect("first run failed");
        let modes_before: Vec<u32> = [&dirs.builds_dir, &dirs.cache_dir]
            .iter()
            .map(|p| mode_of(p))
            .collect();

        let second = DirectoryProvisioner::with_ownership(RecordingOwnership::default());
        let again = second
            .provision(&identity, &request(&data_dir, temp.path()))
            .expect("second run failed");

        assert_eq!(dirs, again);
        assert!(second.ownership.calls().is_empty());
        let modes_after: Vec<u32> = [&again.builds_dir, &again.cache_dir]
            .iter()
            .map(|p| mode_of(p))
            .collect();
        assert_eq!(modes_before, modes_after);
    }

    #[test]
    fn test_ensure_leaves_existing_mode_alone() {
        let temp = tempdir().expect("Failed to create temp dir");
        let path = temp.path().join("existing");
        std::fs::create_dir(&path).expect("create dir");
        std::fs::set_permissions(&path, Permissions::from_mode(0o755)).expect("chmod");

        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership::default());
        let created = provisioner
            .ensure(&DirectorySpec::new(&path, 0, 0, 0o700))
            .expect("ensure failed");

        assert!(!created);
        assert_eq!(mode_of(&path), 0o755);
    }

    #[test]
    #[allow(clippy::panic)]
    fn test_ownership_failure_names_path_and_aborts() {
        let temp = tempdir().expect("Failed to create temp dir");
        let identity = alice_at(temp.path());
        let root = temp.path().join(".gitlab-runner");
        let builds = root.join("builds");
        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership {
            fail_on: Some(builds.clone()),
            ..Default::default()
        });

        let err = provisioner
            .provision(&identity, &request(&DataDir::Home, temp.path()))
            .expect_err("chown failure must abort");

        match &err {
            ProvisionError::OwnershipFailed { path, uid, .. } => {
                assert_eq!(*path, builds);
                assert_eq!(*uid, 1001);
            }
            other => panic!("expected OwnershipFailed, got {:?}", other),
        }
        assert!(err.to_string().contains(".gitlab-runner/builds"));
        // no rollback, and nothing after the failure was attempted
        assert!(root.is_dir());
        assert!(!root.join("cache").exists());
    }

    #[test]
    fn test_unreadable_parent_names_path() {
        let temp = tempdir().expect("Failed to create temp dir");
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, b"not a dir").expect("write file");

        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership::default());
        let err = provisioner
            .ensure(&DirectorySpec::new(blocker.join("child"), 0, 0, 0o750))
            .expect_err("cannot create under a file");

        assert!(matches!(err, ProvisionError::InspectFailed { ref path, .. } if path.ends_with("file/child")));
        assert!(err.to_string().contains("file/child"));
    }

    #[test]
    fn test_rejects_traversal_in_names() {
        let temp = tempdir().expect("Failed to create temp dir");
        let data_dir = DataDir::SharedRoot(temp.path().to_path_buf());

        let mut req = request(&data_dir, temp.path());
        req.namespace = "../etc";
        let err = plan(&alice_at(temp.path()), &req).expect_err("traversal");
        assert!(matches!(err, ProvisionError::InvalidComponent { kind: "namespace", .. }));

        let mut req = request(&data_dir, temp.path());
        req.project = "a/b";
        let err = plan(&alice_at(temp.path()), &req).expect_err("nested project");
        assert!(matches!(err, ProvisionError::InvalidComponent { kind: "project", .. }));

        let mut identity = alice_at(temp.path());
        identity.login = "..".to_string();
        let err = plan(&identity, &request(&DataDir::Home, temp.path())).expect_err("bad login");
        assert!(matches!(err, ProvisionError::InvalidComponent { kind: "login", .. }));
    }

    #[test]
    fn test_nested_namespace_is_allowed() {
        let temp = tempdir().expect("Failed to create temp dir");
        let data_dir = DataDir::SharedRoot(temp.path().to_path_buf());
        let mut req = request(&data_dir, temp.path());
        req.namespace = "group/subgroup";

        let plan = plan(&alice_at(temp.path()), &req).expect("planning failed");
        assert_eq!(
            plan.dirs.builds_dir,
            temp.path().join("group/subgroup/api/builds/users/alice")
        );
        assert_eq!(
            plan.specs[0],
            DirectorySpec::new(temp.path().join("group"), 0, 0, 0o701)
        );
        assert_eq!(
            plan.specs[1],
            DirectorySpec::new(temp.path().join("group/subgroup"), 0, 0, 0o701)
        );
    }

    #[test]
    fn test_home_data_root_symlink_is_refused() {
        let temp = tempdir().expect("Failed to create temp dir");
        let victim = tempdir().expect("Failed to create temp dir");
        let link = temp.path().join(".gitlab-runner");
        std::os::unix::fs::symlink(victim.path(), &link).expect("create symlink");

        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership::default());
        let err = provisioner
            .provision(&alice_at(temp.path()), &request(&DataDir::Home, temp.path()))
            .expect_err("symlinked data root must be refused");

        assert!(matches!(err, ProvisionError::SymlinkRefused(ref p) if *p == link));
        assert!(!victim.path().join("builds").exists());
        assert!(!victim.path().join("cache").exists());
        assert!(provisioner.ownership.calls().is_empty());
    }

    #[test]
    fn test_symlinked_leaf_is_refused() {
        let temp = tempdir().expect("Failed to create temp dir");
        let victim = tempdir().expect("Failed to create temp dir");
        let root = temp.path().join(".gitlab-runner");
        std::fs::create_dir(&root).expect("create data root");
        std::os::unix::fs::symlink(victim.path(), root.join("builds")).expect("create symlink");

        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership::default());
        let err = provisioner
            .provision(&alice_at(temp.path()), &request(&DataDir::Home, temp.path()))
            .expect_err("symlinked builds dir must be refused");

        assert!(matches!(err, ProvisionError::SymlinkRefused(ref p) if p.ends_with("builds")));
        assert!(provisioner.ownership.calls().is_empty());
        assert_eq!(mode_of(victim.path()), 0o700);
    }

    #[test]
    fn test_symlinked_namespace_is_refused() {
        let temp = tempdir().expect("Failed to create temp dir");
        let elsewhere = tempdir().expect("Failed to create temp dir");
        std::os::unix::fs::symlink(elsewhere.path(), temp.path().join("platform"))
            .expect("create symlink");

        let data_dir = DataDir::SharedRoot(temp.path().to_path_buf());
        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership::default());
        let err = provisioner
            .provision(&alice_at(temp.path()), &request(&data_dir, temp.path()))
            .expect_err("symlinked namespace must be refused");

        assert!(matches!(err, ProvisionError::SymlinkRefused(ref p) if p.ends_with("platform")));
        assert!(!elsewhere.path().join("api").exists());
    }

    #[test]
    fn test_existing_file_is_not_a_directory() {
        let temp = tempdir().expect("Failed to create temp dir");
        let file = temp.path().join("builds");
        std::fs::write(&file, b"not a dir").expect("write file");

        let provisioner = DirectoryProvisioner::with_ownership(RecordingOwnership::default());
        let err = provisioner
            .ensure(&DirectorySpec::new(&file, 0, 0, 0o750))
            .expect_err("a file is not a directory");

        assert!(matches!(err, ProvisionError::NotADirectory(ref p) if *p == file));
        assert!(err.to_string().contains("not a directory"));
    }
}
