//! Purpose: Access levels, the operation capability table, and function pointers.
//! Exports: `Access`, `Operation`, `FnPointer`, `check_access`, `INLINE_DIR`.
//! Role: Protocol-boundary checks shared by every callable invocation path.
//! Invariants: Proxy access permits `call` only, and only through the HTTP endpoint.
//! Invariants: A pointer is either resolved or inline, chosen once at construction.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::envelope::{CallEnvelope, CallKind};
use crate::core::error::{Error, ErrorKind};
use crate::core::hex::hex_encode;
use crate::core::package::{InstallTarget, Package};

/// Node directory that synthetic modules are synced into.
pub const INLINE_DIR: &str = "_tether_inline";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Write,
    Read,
    Proxy,
}

impl Access {
    pub fn as_str(self) -> &'static str {
        match self {
            Access::Write => "write",
            Access::Read => "read",
            Access::Proxy => "proxy",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Operation {
    Call,
    Repeat,
    Map,
    Starmap,
    Enqueue,
    Remote,
    Get,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Call => "call",
            Operation::Repeat => "repeat",
            Operation::Map => "map",
            Operation::Starmap => "starmap",
            Operation::Enqueue => "enqueue",
            Operation::Remote => "remote",
            Operation::Get => "get",
        }
    }

    pub fn call_kind(self) -> CallKind {
        match self {
            Operation::Call => CallKind::Call,
            Operation::Repeat => CallKind::Repeat,
            Operation::Map => CallKind::Map,
            Operation::Starmap => CallKind::Starmap,
            Operation::Enqueue => CallKind::Queue,
            Operation::Remote => CallKind::Remote,
            Operation::Get => CallKind::Get,
        }
    }
}

const RPC_ONLY: &[Access] = &[Access::Write, Access::Read];
const ANY_ACCESS: &[Access] = &[Access::Write, Access::Read, Access::Proxy];

const CAPABILITIES: [(Operation, &[Access]); 7] = [
    (Operation::Call, ANY_ACCESS),
    (Operation::Repeat, RPC_ONLY),
    (Operation::Map, RPC_ONLY),
    (Operation::Starmap, RPC_ONLY),
    (Operation::Enqueue, RPC_ONLY),
    (Operation::Remote, RPC_ONLY),
    (Operation::Get, RPC_ONLY),
];

pub fn permitted(operation: Operation) -> &'static [Access] {
    CAPABILITIES
        .iter()
        .find(|(op, _)| *op == operation)
        .map(|(_, levels)| *levels)
        .unwrap_or(&[])
}

pub fn permits(access: Access, operation: Operation) -> bool {
    permitted(operation).contains(&access)
}

pub fn check_access(access: Access, operation: Operation) -> Result<(), Error> {
    if permits(access, operation) {
        return Ok(());
    }
    let required = permitted(operation)
        .iter()
        .map(|level| level.as_str())
        .collect::<Vec<_>>()
        .join(" or ");
    Err(Error::new(ErrorKind::Capability)
        .with_message(format!(
            "{} requires {required} access; callable has {} access",
            operation.as_str(),
            access.as_str()
        ))
        .with_hint("Bind the callable with write or read access to use the RPC channel."))
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FnPointer {
    /// A module the node can already find: a registered handler or a shipped file.
    ResolvedPath {
        relative_path: Option<String>,
        module: String,
        function: String,
    },
    /// Source with no file on any node; materialized into a synthetic module.
    InlineSource {
        module: String,
        function: String,
        source: String,
    },
}

impl FnPointer {
    pub fn handler(module: impl Into<String>, function: impl Into<String>) -> Self {
        FnPointer::ResolvedPath {
            relative_path: None,
            module: module.into(),
            function: function.into(),
        }
    }

    /// Pointer to `function` in the shell module `source`, named by its content so
    /// identical sources share one synthetic module.
    pub fn inline(function: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        let digest = Sha256::digest(source.as_bytes());
        let module = format!("inline_{}", hex_encode(&digest[..6]));
        FnPointer::InlineSource {
            module,
            function: function.into(),
            source,
        }
    }

    /// Resolve a module file against the folder requirements that will be shipped.
    /// The relative path is the owning folder's name plus the file's directory inside it.
    pub fn from_module_file(
        module_file: &Path,
        function: impl Into<String>,
        reqs: &[&Package],
    ) -> Result<Self, Error> {
        let module = module_file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::new(ErrorKind::Config)
                    .with_message("module file has no name")
                    .with_path(module_file)
            })?;

        let mut relative_path = None;
        for package in reqs {
            let folder = match (&package.local_path, &package.install_target) {
                (Some(local), _) => local.as_path(),
                (None, InstallTarget::Folder { path, .. }) => path.as_path(),
                _ => continue,
            };
            let Ok(inner) = module_file.strip_prefix(folder) else {
                continue;
            };
            let Some(name) = folder.file_name() else {
                continue;
            };
            let mut rel = name.to_string_lossy().into_owned();
            if let Some(dir) = inner.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                rel.push('/');
                rel.push_str(&dir.to_string_lossy());
            }
            relative_path = Some(rel);
            break;
        }

        Ok(FnPointer::ResolvedPath {
            relative_path,
            module,
            function: function.into(),
        })
    }

    pub fn module(&self) -> &str {
        match self {
            FnPointer::ResolvedPath { module, .. } | FnPointer::InlineSource { module, .. } => {
                module
            }
        }
    }

    pub fn function(&self) -> &str {
        match self {
            FnPointer::ResolvedPath { function, .. }
            | FnPointer::InlineSource { function, .. } => function,
        }
    }

    /// Directory under the node workdir holding the module, if any. Inline pointers
    /// have none until they are materialized.
    pub fn relative_path(&self) -> Option<&str> {
        match self {
            FnPointer::ResolvedPath { relative_path, .. } => relative_path.as_deref(),
            FnPointer::InlineSource { .. } => None,
        }
    }

    /// Where an inline module lands once synced: `INLINE_DIR/<module>/<module>.sh`.
    pub fn materialized(&self) -> FnPointer {
        match self {
            FnPointer::InlineSource {
                module, function, ..
            } => FnPointer::ResolvedPath {
                relative_path: Some(format!("{INLINE_DIR}/{module}")),
                module: module.clone(),
                function: function.clone(),
            },
            resolved => resolved.clone(),
        }
    }

    pub fn envelope(&self, kind: CallKind) -> Result<CallEnvelope, Error> {
        if self.module().is_empty() || self.function().is_empty() {
            return Err(Error::new(ErrorKind::Config)
                .with_message("callable has no module or function to call"));
        }
        let mut envelope = CallEnvelope::new(self.module(), self.function(), kind);
        envelope.relative_path = self.relative_path().map(str::to_string);
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::{Access, FnPointer, INLINE_DIR, Operation, check_access, permits};
    use crate::core::envelope::CallKind;
    use crate::core::error::ErrorKind;
    use crate::core::package::{InstallMethod, Package};
    use std::path::Path;

    #[test]
    fn proxy_may_only_call() {
        assert!(permits(Access::Proxy, Operation::Call));
        for op in [
            Operation::Repeat,
            Operation::Map,
            Operation::Starmap,
            Operation::Enqueue,
            Operation::Remote,
            Operation::Get,
        ] {
            assert!(!permits(Access::Proxy, op));
            assert!(permits(Access::Read, op));
            assert!(permits(Access::Write, op));
            let err = check_access(Access::Proxy, op).expect_err("capability");
            assert_eq!(err.kind(), ErrorKind::Capability);
            assert!(err.message().unwrap_or("").contains("write or read"));
        }
    }

    #[test]
    fn module_file_resolves_inside_folder_req() {
        let pkg = Package::folder("/home/me/project", InstallMethod::Local);
        let pointer = FnPointer::from_module_file(
            Path::new("/home/me/project/jobs/math.sh"),
            "add",
            &[&pkg],
        )
        .expect("resolve");
        assert_eq!(pointer.relative_path(), Some("project/jobs"));
        assert_eq!(pointer.module(), "math");
        assert_eq!(pointer.function(), "add");
    }

    #[test]
    fn module_outside_reqs_has_no_relative_path() {
        let pointer =
            FnPointer::from_module_file(Path::new("/tmp/tool.sh"), "run", &[]).expect("resolve");
        assert_eq!(pointer.relative_path(), None);
    }

    #[test]
    fn inline_modules_are_content_named() {
        let a = FnPointer::inline("greet", "greet() { echo hi; }");
        let b = FnPointer::inline("greet", "greet() { echo hi; }");
        assert_eq!(a.module(), b.module());
        assert!(a.module().starts_with("inline_"));
        assert_eq!(a.relative_path(), None);
        let envelope = a.materialized().envelope(CallKind::Call).expect("envelope");
        assert_eq!(
            envelope.relative_path,
            Some(format!("{INLINE_DIR}/{}", a.module()))
        );
    }

    #[test]
    fn empty_pointer_is_config_error() {
        let err = FnPointer::handler("", "f")
            .envelope(CallKind::Call)
            .expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
