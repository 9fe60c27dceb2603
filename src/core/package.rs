//! Purpose: Describe one installable unit and how it gets installed on a node.
//! Exports: `Package`, `InstallTarget`, `InstallMethod`, `LOCAL_SYSTEM`.
//! Role: Leaf value type of the environment manager.
//! Invariants: Folder packages must resolve to an existing directory at install time.
//! Invariants: Rebasing returns a new descriptor; the source descriptor is never touched.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::environment::{Environment, InstallContext};
use crate::core::error::{Error, ErrorKind};
use crate::core::paths::resolve_under_root;
use crate::core::shell::{quote, tail_line};
use crate::core::target::ExecutionTarget;

/// System tag of a folder that lives on the client's filesystem.
pub const LOCAL_SYSTEM: &str = "local";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    Local,
    Reqs,
    Remote,
    Deserialize,
}

impl InstallMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallMethod::Local => "local",
            InstallMethod::Reqs => "reqs",
            InstallMethod::Remote => "pip",
            InstallMethod::Deserialize => "deserialize",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallTarget {
    /// A registry package name, optionally version-pinned.
    Spec { spec: String },
    /// A directory on `system` (`local` for the client, otherwise a target name).
    Folder { path: PathBuf, system: String },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub install_target: InstallTarget,
    pub install_method: InstallMethod,
    /// Where the folder lived on the client before any rebase. Client-side only.
    #[serde(skip)]
    pub local_path: Option<PathBuf>,
}

impl Package {
    pub fn remote(spec: impl Into<String>) -> Self {
        Self {
            install_target: InstallTarget::Spec { spec: spec.into() },
            install_method: InstallMethod::Remote,
            local_path: None,
        }
    }

    pub fn folder(path: impl Into<PathBuf>, method: InstallMethod) -> Self {
        let path = path.into();
        Self {
            install_target: InstallTarget::Folder {
                path: path.clone(),
                system: LOCAL_SYSTEM.to_string(),
            },
            install_method: method,
            local_path: Some(path),
        }
    }

    /// Parse a shorthand such as `numpy==1.26`, `pip:torch`, `local:./pkg`, `reqs:.`.
    /// Relative folder paths resolve against `root`.
    pub fn from_string(spec: &str, root: &Path) -> Self {
        let spec = spec.trim();
        if let Some((prefix, rest)) = spec.split_once(':') {
            let method = match prefix {
                "local" => Some(InstallMethod::Local),
                "reqs" => Some(InstallMethod::Reqs),
                "deserialize" => Some(InstallMethod::Deserialize),
                "pip" | "remote" => return Self::remote(rest),
                _ => None,
            };
            if let Some(method) = method {
                return Self::folder(resolve_under_root(Path::new(rest), root), method);
            }
        }

        let candidate = resolve_under_root(Path::new(spec), root);
        if candidate.is_dir() {
            let method = if candidate.join("requirements.txt").is_file() {
                InstallMethod::Reqs
            } else {
                InstallMethod::Local
            };
            return Self::folder(candidate, method);
        }
        Self::remote(spec)
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.install_target, InstallTarget::Folder { .. })
    }

    /// Folder packages still sitting on the client's filesystem.
    pub fn needs_relocation(&self) -> bool {
        matches!(&self.install_target, InstallTarget::Folder { system, .. } if system == LOCAL_SYSTEM)
    }

    pub fn folder_name(&self) -> Option<String> {
        match &self.install_target {
            InstallTarget::Folder { path, .. } => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            InstallTarget::Spec { .. } => None,
        }
    }

    /// The folder path, resolved against `root` and checked to exist.
    pub fn resolved_path(&self, root: &Path) -> Result<PathBuf, Error> {
        let InstallTarget::Folder { path, .. } = &self.install_target else {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("package {self} is not a folder")));
        };
        let resolved = resolve_under_root(path, root);
        if !resolved.exists() {
            return Err(Error::new(ErrorKind::Config)
                .with_message(format!("package path for {self} does not exist"))
                .with_path(&resolved)
                .with_hint("Relative paths resolve against the project working directory."));
        }
        Ok(resolved)
    }

    /// Copy of this package with its folder placed on `target`.
    pub fn to(
        &self,
        target: &dyn ExecutionTarget,
        root: &Path,
        dest: Option<&str>,
        mount: bool,
    ) -> Result<Package, Error> {
        if !self.needs_relocation() {
            return Ok(self.clone());
        }
        let source = self.resolved_path(root)?;
        let name = self.folder_name().unwrap_or_default();
        let dest = match dest {
            Some(base) if !base.is_empty() => format!("{}/{name}", base.trim_end_matches('/')),
            _ => name,
        };
        let placed = target.sync_folder(&source, Some(&dest), mount)?;
        debug!(package = %self, placed = %placed.display(), "package rebased");
        Ok(Package {
            install_target: InstallTarget::Folder {
                path: placed,
                system: target.name().to_string(),
            },
            install_method: self.install_method,
            local_path: self.local_path.clone(),
        })
    }

    /// The shell command that installs this package, if one is needed.
    pub fn install_command(&self, installer: &str, root: &Path) -> Result<Option<String>, Error> {
        match (&self.install_target, self.install_method) {
            (InstallTarget::Spec { spec }, _) => Ok(Some(format!("{installer} {}", quote(spec)))),
            (InstallTarget::Folder { .. }, InstallMethod::Reqs) => {
                let dir = self.resolved_path(root)?;
                let reqs_file = dir.join("requirements.txt");
                if reqs_file.is_file() {
                    Ok(Some(format!(
                        "{installer} -r {}",
                        quote(&reqs_file.to_string_lossy())
                    )))
                } else {
                    Ok(None)
                }
            }
            (InstallTarget::Folder { .. }, InstallMethod::Local) => {
                let dir = self.resolved_path(root)?;
                if dir.join("pyproject.toml").is_file() || dir.join("setup.py").is_file() {
                    Ok(Some(format!("{installer} -e {}", quote(&dir.to_string_lossy()))))
                } else {
                    Ok(None)
                }
            }
            (InstallTarget::Folder { .. }, _) => {
                self.resolved_path(root)?;
                Ok(None)
            }
        }
    }

    /// Install into `env` on the node described by `ctx`. Errors name the package and
    /// the command that failed.
    pub fn install(&self, env: &Environment, ctx: &InstallContext) -> Result<(), Error> {
        let Some(cmd) = self.install_command(&ctx.installer, &ctx.root)? else {
            debug!(package = %self, "package placed; nothing to install");
            return Ok(());
        };
        let output = env.run_command_in(&cmd, ctx)?;
        if !output.success() {
            let detail = tail_line(&output.stderr);
            return Err(Error::new(ErrorKind::Install)
                .with_message(format!(
                    "failed to install package {self} (exit {}): {detail}",
                    output.code
                ))
                .with_hint(format!("command: {cmd}")));
        }
        Ok(())
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.install_target {
            InstallTarget::Spec { spec } => write!(f, "{spec}"),
            InstallTarget::Folder { path, .. } => {
                write!(f, "{}:{}", self.install_method.as_str(), path.display())
            }
        }
    }
}
