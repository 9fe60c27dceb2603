//! Purpose: Wire shapes of the remote invocation protocol.
//! Exports: `CallKind`, `CallEnvelope`, `ResponseEnvelope`.
//! Role: Shared by the client dispatcher, the HTTP server, and the in-process node.
//! Invariants: A response populates exactly one of `result` or `exception`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use crate::core::error::{Error, Exception};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Call,
    Repeat,
    Map,
    Starmap,
    Queue,
    Remote,
    Get,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Call => "call",
            CallKind::Repeat => "repeat",
            CallKind::Map => "map",
            CallKind::Starmap => "starmap",
            CallKind::Queue => "queue",
            CallKind::Remote => "remote",
            CallKind::Get => "get",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub relative_path: Option<String>,
    pub module: String,
    pub function: String,
    pub kind: CallKind,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Partition the call runs in; the node's default environment when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    /// Object key of the calling resource, used for active-call tracking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CallEnvelope {
    pub fn new(module: impl Into<String>, function: impl Into<String>, kind: CallKind) -> Self {
        Self {
            relative_path: None,
            module: module.into(),
            function: function.into(),
            kind,
            args: Vec::new(),
            kwargs: Map::new(),
            env: None,
            name: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        self.args = args;
        self.kwargs = kwargs;
        self
    }

    /// `module.function`, for log lines and tracebacks.
    pub fn qualified_name(&self) -> String {
        match &self.relative_path {
            Some(path) if !path.is_empty() => format!("{path}/{}.{}", self.module, self.function),
            _ => format!("{}.{}", self.module, self.function),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub result: Option<Value>,
    pub exception: Option<Exception>,
    pub traceback: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            exception: None,
            traceback: None,
        }
    }

    pub fn raised(exception: Exception, traceback: impl Into<String>) -> Self {
        Self {
            result: None,
            exception: Some(exception),
            traceback: Some(traceback.into()),
        }
    }

    /// Unwrap the envelope the way a local call would have returned. Remote exceptions
    /// are logged with their traceback and re-raised with the original identity.
    pub fn into_result(self) -> Result<Value, Error> {
        match self.exception {
            Some(exception) => {
                let traceback = self.traceback.unwrap_or_default();
                error!(
                    exception = %exception,
                    traceback = %traceback,
                    "remote call raised"
                );
                let err = Error::raised(exception);
                if traceback.is_empty() {
                    Err(err)
                } else {
                    Err(err.with_traceback(traceback))
                }
            }
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CallEnvelope, CallKind, ResponseEnvelope};
    use crate::core::error::{ErrorKind, Exception};
    use serde_json::json;

    #[test]
    fn envelope_wire_shape_uses_snake_case_kinds() {
        let mut envelope = CallEnvelope::new("math", "add", CallKind::Starmap);
        envelope.relative_path = Some("project".to_string());
        envelope.args = vec![json!([1, 2])];
        let value = serde_json::to_value(&envelope).expect("encode");
        assert_eq!(value["kind"], "starmap");
        assert_eq!(value["relative_path"], "project");
        assert!(value.get("env").is_none());
        assert_eq!(envelope.qualified_name(), "project/math.add");
    }

    #[test]
    fn missing_args_default_to_empty() {
        let envelope: CallEnvelope = serde_json::from_value(json!({
            "relative_path": null,
            "module": "m",
            "function": "f",
            "kind": "call"
        }))
        .expect("decode");
        assert!(envelope.args.is_empty());
        assert!(envelope.kwargs.is_empty());
        assert_eq!(envelope.qualified_name(), "m.f");
    }

    #[test]
    fn raised_response_reraises_original_exception() {
        let response = ResponseEnvelope::raised(
            Exception::new("ZeroDivisionError", "division by zero"),
            "node-a: math.div",
        );
        let err = response.into_result().expect_err("raised");
        assert_eq!(err.kind(), ErrorKind::Raised);
        assert_eq!(
            err.exception().map(|exc| exc.type_name.as_str()),
            Some("ZeroDivisionError")
        );
        assert_eq!(err.traceback(), Some("node-a: math.div"));
    }

    #[test]
    fn empty_result_is_null() {
        let value = ResponseEnvelope::default().into_result().expect("ok");
        assert!(value.is_null());
    }
}
