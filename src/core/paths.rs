//! Purpose: Shared working-directory and node-workdir path resolution helpers.
//! Exports: `default_workdir`, `locate_working_dir`, `resolve_under_root`, `safe_relative`, `copy_dir`.
//! Role: Keep client-side package resolution and node-side file placement aligned.
//! Invariants: Default node workdir remains `~/.tether/workdir`.
//! Invariants: Paths received from the wire never escape the node workdir.

use std::path::{Component, Path, PathBuf};

use crate::core::error::{Error, ErrorKind, map_io_error_kind};

const ROOT_MARKERS: [&str; 5] = [
    ".git",
    "pyproject.toml",
    "setup.py",
    "requirements.txt",
    "Cargo.toml",
];

pub fn default_workdir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".tether").join("workdir")
}

/// Walk up from `start` to the first directory that looks like a project root.
/// Falls back to `start` itself.
pub fn locate_working_dir(start: &Path) -> PathBuf {
    let mut current = Some(start);
    while let Some(dir) = current {
        if ROOT_MARKERS.iter().any(|marker| dir.join(marker).exists()) {
            return dir.to_path_buf();
        }
        current = dir.parent();
    }
    start.to_path_buf()
}

pub fn current_working_root() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    locate_working_dir(&cwd)
}

pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(rest)
}

/// Resolve `path` against `root` unless it is already absolute.
pub fn resolve_under_root(path: &Path, root: &Path) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    }
}

/// Validate a wire-supplied relative path: no root, no `..`, not empty.
pub fn safe_relative(raw: &str) -> Result<PathBuf, Error> {
    let path = Path::new(raw.trim_start_matches('/'));
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::new(ErrorKind::Config)
                    .with_message("path must stay inside the node workdir")
                    .with_path(raw));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(Error::new(ErrorKind::Config).with_message("path must not be empty"));
    }
    Ok(out)
}

/// Every regular file under `dir`, as paths relative to `dir`, in sorted order.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut out = Vec::new();
    collect_files(dir, Path::new(""), &mut out)?;
    out.sort();
    Ok(out)
}

fn collect_files(base: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> Result<(), Error> {
    let dir = base.join(rel);
    let entries = std::fs::read_dir(&dir).map_err(|err| {
        Error::new(map_io_error_kind(&err))
            .with_message("failed to read directory")
            .with_path(&dir)
            .with_source(err)
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read directory entry")
                .with_path(&dir)
                .with_source(err)
        })?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let child = rel.join(&name);
        let file_type = entry.file_type().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_path(entry.path())
                .with_source(err)
        })?;
        if file_type.is_dir() {
            collect_files(base, &child, out)?;
        } else if file_type.is_file() {
            out.push(child);
        }
    }
    Ok(())
}

pub fn copy_dir(source: &Path, dest: &Path) -> Result<(), Error> {
    for rel in list_files(source)? {
        let to = dest.join(&rel);
        if let Some(parent) = to.parent() {
            ensure_dir(parent)?;
        }
        std::fs::copy(source.join(&rel), &to).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to copy file")
                .with_path(&to)
                .with_source(err)
        })?;
    }
    Ok(())
}

pub fn ensure_dir(dir: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(dir).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to create directory")
            .with_path(dir)
            .with_source(err)
    })
}
