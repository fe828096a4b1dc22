//! SetUID identity validation
//!
//! Resolves the login requested by a job to an OS account and decides, from
//! the configured user/group whitelists and blacklists, whether that account
//! may run jobs on this host. Rules are evaluated in a fixed order and the
//! first match wins:
//!
//! 1. user whitelisted: allow
//! 2. user blacklisted: deny
//! 3. any group blacklisted: deny, naming every blacklisted group
//! 4. any group whitelisted: allow
//! 5. no group whitelist configured: allow
//! 6. otherwise: deny

use serde::Deserialize;
use std::ffi::CString;
use std::path::PathBuf;

/// An OS account that passed policy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Login name as requested by the job
    pub login: String,
    pub uid: u32,
    /// Primary group
    pub gid: u32,
    /// Names of every group the account belongs to
    pub groups: Vec<String>,
    /// Numeric ids matching `groups`, used as supplementary groups for the job
    pub group_ids: Vec<u32>,
    pub home: PathBuf,
}

/// Whitelists and blacklists for SetUID mode
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PolicyLists {
    pub user_whitelist: Vec<String>,
    pub user_blacklist: Vec<String>,
    pub group_whitelist: Vec<String>,
    pub group_blacklist: Vec<String>,
}

/// Which rule allowed an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    UserWhitelist,
    GroupWhitelist,
    NoGroupPolicy,
}

/// Errors from identity lookup and policy evaluation
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("unable to look up the logged in user {login}: {reason}")]
    LookupFailed { login: String, reason: String },

    #[error("the logged in user, {login}, is not in the user whitelist and is in the user blacklist")]
    UserDenied { login: String },

    #[error(
        "the logged in user, {login}, is not on the user whitelist and is a member of the following \
         groups that are on the groups blacklist, and is not allowed to run CI jobs: {}",
        .groups.join(", ")
    )]
    GroupDenied { login: String, groups: Vec<String> },

    #[error(
        "a group whitelist exists, but the user {login} is not a member of any groups that are on \
         that whitelist, and is not allowed to run CI jobs"
    )]
    NotInGroupWhitelist { login: String },

    #[error(
        "could not validate that user {login} is allowed to run CI jobs; check that the whitelists \
         and blacklists are well formed"
    )]
    PolicyEvaluation { login: String },
}

/// Source of OS account information
pub trait UserDirectory: Send + Sync {
    /// Resolve a login to uid, gid, group memberships and home directory
    fn lookup(&self, login: &str) -> Result<Identity, IdentityError>;
}

/// Account lookups through the system passwd/group databases
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUserDirectory;

impl UserDirectory for SystemUserDirectory {
    fn lookup(&self, login: &str) -> Result<Identity, IdentityError> {
        use nix::unistd::{Group, User};

        let lookup_failed = |reason: String| IdentityError::LookupFailed {
            login: login.to_string(),
            reason,
        };

        let user = User::from_name(login)
            .map_err(|e| lookup_failed(e.to_string()))?
            .ok_or_else(|| lookup_failed("no such user".to_string()))?;

        let c_login = CString::new(login).map_err(|e| lookup_failed(e.to_string()))?;
        let gids = member_gids(&c_login, user.gid)
            .map_err(|e| lookup_failed(format!("could not list group memberships: {}", e)))?;

        let mut groups = Vec::with_capacity(gids.len());
        let mut group_ids = Vec::with_capacity(gids.len());
        for gid in gids {
            if group_ids.contains(&gid.as_raw()) {
                continue;
            }
            match Group::from_gid(gid) {
                Ok(Some(group)) => {
                    groups.push(group.name);
                    group_ids.push(gid.as_raw());
                }
                Ok(None) => {
                    tracing::debug!(login = %login, gid = gid.as_raw(), "group has no name entry, skipping");
                }
                Err(e) => {
                    return Err(lookup_failed(format!(
                        "could not resolve group {}: {}",
                        gid, e
                    )))
                }
            }
        }

        Ok(Identity {
            login: login.to_string(),
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            groups,
            group_ids,
            home: user.dir,
        })
    }
}

#[cfg(not(target_os = "macos"))]
fn member_gids(
    login: &CString,
    primary: nix::unistd::Gid,
) -> nix::Result<Vec<nix::unistd::Gid>> {
    nix::unistd::getgrouplist(login, primary)
}

#[cfg(target_os = "macos")]
fn member_gids(
    _login: &CString,
    primary: nix::unistd::Gid,
) -> nix::Result<Vec<nix::unistd::Gid>> {
    Ok(vec![primary])
}

/// Groups of `user_groups` that appear in `blacklist`, in membership order
pub fn blacklisted_groups(blacklist: &[String], user_groups: &[String]) -> Vec<String> {
    let mut shared: Vec<String> = Vec::new();
    for group in user_groups {
        if blacklist.contains(group) && !shared.contains(group) {
            shared.push(group.clone());
        }
    }
    shared
}

/// Whether any of `user_groups` appears in `whitelist`
pub fn in_group_whitelist(whitelist: &[String], user_groups: &[String]) -> bool {
    user_groups.iter().any(|group| whitelist.contains(group))
}

/// Evaluate the policy lists for a login and its group memberships
pub fn evaluate(
    login: &str,
    groups: &[String],
    policy: &PolicyLists,
) -> Result<Admission, IdentityError> {
    let login_owned = || login.to_string();
    let denied_groups = blacklisted_groups(&policy.group_blacklist, groups);
    let group_whitelisted = in_group_whitelist(&policy.group_whitelist, groups);

    if policy.user_whitelist.iter().any(|u| u == login) {
        Ok(Admission::UserWhitelist)
    } else if policy.user_blacklist.iter().any(|u| u == login) {
        Err(IdentityError::UserDenied {
            login: login_owned(),
        })
    } else if !denied_groups.is_empty() {
        Err(IdentityError::GroupDenied {
            login: login_owned(),
            groups: denied_groups,
        })
    } else if group_whitelisted {
        Ok(Admission::GroupWhitelist)
    } else if policy.group_whitelist.is_empty() {
        Ok(Admission::NoGroupPolicy)
    } else if !group_whitelisted {
        Err(IdentityError::NotInGroupWhitelist {
            login: login_owned(),
        })
    } else {
        Err(IdentityError::PolicyEvaluation {
            login: login_owned(),
        })
    }
}

/// Look up `login` and check it against the policy lists
///
/// Lookup failures are reported as `LookupFailed`, never as a denial.
pub fn validate(
    directory: &dyn UserDirectory,
    login: &str,
    policy: &PolicyLists,
) -> Result<Identity, IdentityError> {
    if login.is_empty() {
        return Err(IdentityError::LookupFailed {
            login: String::new(),
            reason: "no login was supplied by the job".to_string(),
        });
    }

    let identity = directory.lookup(login)?;
    match evaluate(login, &identity.groups, policy) {
        Ok(admission) => {
            tracing::info!(
                login = %identity.login,
                uid = identity.uid,
                gid = identity.gid,
                admission = ?admission,
                "validated setuid identity"
            );
            Ok(identity)
        }
        Err(e) => {
            tracing::warn!(login = %login, error = %e, "setuid identity rejected");
            Err(e)
        }
    }
}

/// Fixed set of accounts, for embedders without a passwd database and for tests
#[derive(Debug, Default, Clone)]
pub struct StaticUserDirectory {
    accounts: Vec<Identity>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account
    pub fn with(mut self, identity: Identity) -> Self {
        self.accounts.push(identity);
        self
    }
}

impl UserDirectory for StaticUserDirectory {
    fn lookup(&self, login: &str) -> Result<Identity, IdentityError> {
        self.accounts
            .iter()
            .find(|identity| identity.login == login)
            .cloned()
            .ok_or_else(|| IdentityError::LookupFailed {
                login: login.to_string(),
                reason: "no such user".to_string(),
            })
    }
}
