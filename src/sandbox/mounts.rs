//! Mount validation: computes the filesystem view of one execution.
//!
//! Candidates are built in a fixed order, then each one is resolved
//! and checked against the allowed roots:
//!
//!   1. groups/{folder}          → /workspace/group    (rw, if present)
//!   2. groups/global            → /workspace/global   (ro, if present)
//!   3. data/sessions/{folder}   → /home/agent/.session (rw, created)
//!   4. data/ipc/{folder}        → /workspace/ipc      (rw, created)
//!   5. project root             → /workspace/project  (ro, primary only)
//!   6. operator extra mounts    → as declared
//!
//! Paths containing a sensitive component (`.ssh`, `.aws`, ...) are
//! always mounted read-only.
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::{MountBinding, MountMode};
use crate::config::Config;
use crate::model::ExecutionConfig;

pub const CONTAINER_GROUP_PATH: &str = "/workspace/group";
pub const CONTAINER_GLOBAL_PATH: &str = "/workspace/global";
pub const CONTAINER_SESSION_PATH: &str = "/home/agent/.session";
pub const CONTAINER_IPC_PATH: &str = "/workspace/ipc";
pub const CONTAINER_PROJECT_PATH: &str = "/workspace/project";

/// Folder under the groups root shared read-only with every group.
pub const GLOBAL_FOLDER: &str = "global";

/// Path components that force a read-only mount.
const SENSITIVE_COMPONENTS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    "credentials",
    "secrets",
    ".env",
    ".env.local",
    "keys",
    "certificates",
];

#[derive(Debug, Error)]
pub enum MountSecurityError {
    #[error("mount path {} is not in allowlist", path.display())]
    NotInAllowlist { path: PathBuf },

    #[error(
        "mount path {} is a symlink resolving to {}, outside every allowed root",
        path.display(),
        target.display()
    )]
    SymlinkEscape { path: PathBuf, target: PathBuf },

    #[error(
        "mount path {} is outside the groups root {} (non-primary group)",
        path.display(),
        root.display()
    )]
    OutsideGroupsRoot { path: PathBuf, root: PathBuf },

    #[error("invalid group folder {folder:?}")]
    InvalidFolder { folder: String },

    #[error("invalid sandbox path {path:?} for {}", host.display())]
    InvalidContainerPath { host: PathBuf, path: String },

    #[error("cannot resolve mount path {}: {source}", path.display())]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Which construction step produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateKind {
    Group,
    Global,
    Session,
    Ipc,
    Project,
    Extra,
}

impl CandidateKind {
    /// Session and IPC directories cannot work read-only.
    fn requires_write(self) -> bool {
        matches!(self, CandidateKind::Session | CandidateKind::Ipc)
    }
}

#[derive(Debug)]
struct Candidate {
    kind: CandidateKind,
    host_path: PathBuf,
    container_path: String,
    mode: MountMode,
}

/// Canonical roots, recomputed per call since directories may appear
/// after startup.
struct Roots {
    project: PathBuf,
    groups: PathBuf,
    data: PathBuf,
    store: PathBuf,
    allowlist: Vec<PathBuf>,
}

pub struct MountValidator {
    project_root: PathBuf,
    groups_root: PathBuf,
    data_root: PathBuf,
    store_root: PathBuf,
    allowlist: Vec<PathBuf>,
    confine_non_primary: bool,
}

impl MountValidator {
    pub fn new(
        project_root: PathBuf,
        groups_root: PathBuf,
        data_root: PathBuf,
        store_root: PathBuf,
    ) -> Self {
        Self {
            project_root,
            groups_root,
            data_root,
            store_root,
            allowlist: Vec::new(),
            confine_non_primary: true,
        }
    }

    pub fn with_allowlist(mut self, allowlist: Vec<PathBuf>) -> Self {
        self.allowlist = allowlist;
        self
    }

    pub fn with_non_primary_confinement(mut self, confine: bool) -> Self {
        self.confine_non_primary = confine;
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.paths.project_root.clone(),
            config.paths.groups_root(),
            config.paths.data_root(),
            config.paths.store_root(),
        )
        .with_allowlist(config.mounts.allowlist.clone())
        .with_non_primary_confinement(config.mounts.confine_non_primary)
    }

    pub fn groups_root(&self) -> &Path {
        &self.groups_root
    }

    pub fn confines_non_primary(&self) -> bool {
        self.confine_non_primary
    }

    /// Per-group agent session state.
    pub fn session_dir(&self, folder: &str) -> PathBuf {
        self.data_root.join("sessions").join(folder)
    }

    /// Per-group message-exchange directory.
    pub fn ipc_dir(&self, folder: &str) -> PathBuf {
        self.data_root.join("ipc").join(folder)
    }

    /// Builds and validates the bindings for one execution.
    ///
    /// Missing host paths are dropped silently; any unsafe candidate
    /// fails the whole call.
    pub fn resolve_mounts(
        &self,
        folder: &str,
        execution: Option<&ExecutionConfig>,
        is_primary: bool,
    ) -> Result<Vec<MountBinding>, MountSecurityError> {
        if !is_plain_folder(folder) {
            return Err(MountSecurityError::InvalidFolder {
                folder: folder.to_string(),
            });
        }
        let candidates = self.candidates(folder, execution, is_primary)?;
        let roots = self.roots();

        let mut bindings = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(binding) = self.validate(&roots, candidate, is_primary)? {
                bindings.push(binding);
            }
        }
        debug!(folder, count = bindings.len(), "Mounts resolved");
        Ok(bindings)
    }

    fn candidates(
        &self,
        folder: &str,
        execution: Option<&ExecutionConfig>,
        is_primary: bool,
    ) -> Result<Vec<Candidate>, MountSecurityError> {
        let mut out = Vec::new();

        let group_dir = self.groups_root.join(folder);
        if group_dir.exists() {
            out.push(Candidate {
                kind: CandidateKind::Group,
                host_path: group_dir,
                container_path: CONTAINER_GROUP_PATH.to_string(),
                mode: MountMode::ReadWrite,
            });
        }

        let global_dir = self.groups_root.join(GLOBAL_FOLDER);
        if global_dir.exists() {
            out.push(Candidate {
                kind: CandidateKind::Global,
                host_path: global_dir,
                container_path: CONTAINER_GLOBAL_PATH.to_string(),
                mode: MountMode::ReadOnly,
            });
        }

        let session_dir = self.session_dir(folder);
        create_dir(&session_dir)?;
        out.push(Candidate {
            kind: CandidateKind::Session,
            host_path: session_dir,
            container_path: CONTAINER_SESSION_PATH.to_string(),
            mode: MountMode::ReadWrite,
        });

        let ipc_dir = self.ipc_dir(folder);
        create_dir(&ipc_dir)?;
        out.push(Candidate {
            kind: CandidateKind::Ipc,
            host_path: ipc_dir,
            container_path: CONTAINER_IPC_PATH.to_string(),
            mode: MountMode::ReadWrite,
        });

        if is_primary {
            out.push(Candidate {
                kind: CandidateKind::Project,
                host_path: self.project_root.clone(),
                container_path: CONTAINER_PROJECT_PATH.to_string(),
                mode: MountMode::ReadOnly,
            });
        }

        if let Some(execution) = execution {
            for extra in &execution.additional_mounts {
                out.push(Candidate {
                    kind: CandidateKind::Extra,
                    host_path: extra.host_path.clone(),
                    container_path: extra.container_path.clone(),
                    mode: if extra.readonly {
                        MountMode::ReadOnly
                    } else {
                        MountMode::ReadWrite
                    },
                });
            }
        }

        Ok(out)
    }

    fn validate(
        &self,
        roots: &Roots,
        candidate: Candidate,
        is_primary: bool,
    ) -> Result<Option<MountBinding>, MountSecurityError> {
        let host = if candidate.host_path.is_absolute() {
            candidate.host_path.clone()
        } else {
            self.project_root.join(&candidate.host_path)
        };

        if !host.exists() {
            debug!(path = %host.display(), "Mount source missing, skipped");
            return Ok(None);
        }

        if !is_valid_container_path(&candidate.container_path) {
            return Err(MountSecurityError::InvalidContainerPath {
                host,
                path: candidate.container_path,
            });
        }

        let resolved = host
            .canonicalize()
            .map_err(|source| MountSecurityError::Resolve {
                path: host.clone(),
                source,
            })?;

        if through_symlink(&host) {
            let trusted = [&roots.project, &roots.data, &roots.groups, &roots.store];
            if !trusted.iter().any(|root| resolved.starts_with(root)) {
                return Err(MountSecurityError::SymlinkEscape {
                    path: host,
                    target: resolved,
                });
            }
        }

        let allowed = resolved.starts_with(&roots.project)
            || roots.allowlist.iter().any(|root| resolved.starts_with(root));
        if !allowed {
            return Err(MountSecurityError::NotInAllowlist { path: resolved });
        }

        if !is_primary && self.confine_non_primary && !resolved.starts_with(&roots.groups) {
            return Err(MountSecurityError::OutsideGroupsRoot {
                path: resolved,
                root: roots.groups.clone(),
            });
        }

        let mut mode = candidate.mode;
        if !is_primary && !candidate.kind.requires_write() {
            mode = MountMode::ReadOnly;
        }
        if has_sensitive_component(&host) || has_sensitive_component(&resolved) {
            if mode == MountMode::ReadWrite {
                warn!(path = %resolved.display(), "Sensitive path forced read-only");
            }
            mode = MountMode::ReadOnly;
        }

        Ok(Some(MountBinding {
            host_path: resolved,
            container_path: candidate.container_path,
            mode,
        }))
    }

    fn roots(&self) -> Roots {
        Roots {
            project: canonical_or_raw(&self.project_root),
            groups: canonical_or_raw(&self.groups_root),
            data: canonical_or_raw(&self.data_root),
            store: canonical_or_raw(&self.store_root),
            allowlist: self.allowlist.iter().map(|p| canonical_or_raw(p)).collect(),
        }
    }
}

fn create_dir(path: &Path) -> Result<(), MountSecurityError> {
    std::fs::create_dir_all(path).map_err(|source| MountSecurityError::Resolve {
        path: path.to_path_buf(),
        source,
    })
}

fn canonical_or_raw(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// True if the path itself or any of its ancestors is a symlink.
fn through_symlink(path: &Path) -> bool {
    path.ancestors().any(|p| {
        std::fs::symlink_metadata(p)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    })
}

fn has_sensitive_component(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(name) => name
            .to_str()
            .map(|n| SENSITIVE_COMPONENTS.contains(&n))
            .unwrap_or(false),
        _ => false,
    })
}

/// Absolute, no `..`, and free of the `:` separator used by `-v`.
fn is_valid_container_path(path: &str) -> bool {
    path.starts_with('/')
        && !path.contains(':')
        && !Path::new(path)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
}

/// A folder name must be one plain path component.
fn is_plain_folder(folder: &str) -> bool {
    let mut components = Path::new(folder).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
