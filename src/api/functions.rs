//! Purpose: Resolve and run callables on a node.
//! Exports: `FunctionTable`, `Handler`, `CallContext`, `Lookup`, `run_script`.
//! Role: The node's answer to "import module, get attribute, call it".
//! Invariants: Failures surface as `Exception` values, never as transport errors.
//! Notes: Shell modules get positional args plus `TETHER_ARGS`/`TETHER_KWARGS` JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::core::error::Exception;
use crate::core::registry::Registry;
use crate::core::shell::{quote, run_with_logs, tail_line};

/// What a handler sees about the node and the environment it runs in.
pub struct CallContext<'a> {
    pub env: &'a str,
    pub env_vars: &'a BTreeMap<String, String>,
    pub node_name: &'a str,
    pub workdir: &'a Path,
    pub registry: &'a Registry,
}

pub type Handler = Arc<
    dyn Fn(&CallContext<'_>, &[Value], &Map<String, Value>) -> Result<Value, Exception>
        + Send
        + Sync,
>;

pub enum Lookup {
    Found(Handler),
    MissingFunction,
    MissingModule,
}

#[derive(Clone, Default)]
pub struct FunctionTable {
    handlers: BTreeMap<(String, String), Handler>,
    modules: BTreeSet<String>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, module: &str, function: &str, handler: F) -> &mut Self
    where
        F: Fn(&CallContext<'_>, &[Value], &Map<String, Value>) -> Result<Value, Exception>
            + Send
            + Sync
            + 'static,
    {
        self.modules.insert(module.to_string());
        self.handlers.insert(
            (module.to_string(), function.to_string()),
            Arc::new(handler),
        );
        self
    }

    pub fn with<F>(mut self, module: &str, function: &str, handler: F) -> Self
    where
        F: Fn(&CallContext<'_>, &[Value], &Map<String, Value>) -> Result<Value, Exception>
            + Send
            + Sync
            + 'static,
    {
        self.register(module, function, handler);
        self
    }

    pub fn lookup(&self, module: &str, function: &str) -> Lookup {
        if let Some(handler) = self
            .handlers
            .get(&(module.to_string(), function.to_string()))
        {
            return Lookup::Found(Arc::clone(handler));
        }
        if self.modules.contains(module) {
            Lookup::MissingFunction
        } else {
            Lookup::MissingModule
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers
            .keys()
            .map(|(module, function)| format!("{module}.{function}"))
            .collect()
    }
}

/// Handlers every served node carries under the `tether` module.
pub fn builtins() -> FunctionTable {
    FunctionTable::new()
        .with("tether", "echo", |_, args, kwargs| {
            if kwargs.is_empty() && args.len() == 1 {
                return Ok(args[0].clone());
            }
            Ok(json!({ "args": args, "kwargs": kwargs }))
        })
        .with("tether", "getenv", |ctx, args, _| {
            let name = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| Exception::type_error("getenv expects a variable name"))?;
            Ok(ctx
                .env_vars
                .get(name)
                .map(|value| json!(value))
                .unwrap_or(Value::Null))
        })
        .with("tether", "whoami", |ctx, _, _| {
            Ok(json!({ "node": ctx.node_name, "env": ctx.env }))
        })
        .with("tether", "raise", |_, args, _| {
            let type_name = args.first().and_then(Value::as_str).unwrap_or("RuntimeError");
            let message = args.get(1).and_then(Value::as_str).unwrap_or("");
            Err(Exception::new(type_name, message))
        })
        .with("tether", "sleep", |_, args, _| {
            let secs = args.first().and_then(Value::as_f64).unwrap_or(0.0).max(0.0);
            std::thread::sleep(std::time::Duration::from_secs_f64(secs.min(3600.0)));
            Ok(json!(secs))
        })
}

pub fn module_not_found(module: &str) -> Exception {
    Exception::new("ModuleNotFoundError", format!("No module named '{module}'"))
}

pub fn attribute_error(module: &str, function: &str) -> Exception {
    Exception::new(
        "AttributeError",
        format!("module '{module}' has no attribute '{function}'"),
    )
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(ch) if ch.is_ascii_alphabetic() || ch == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn defines_function(source: &str, function: &str) -> bool {
    source.lines().map(str::trim_start).any(|line| {
        if let Some(rest) = line.strip_prefix("function ") {
            return rest.trim_start().strip_prefix(function).is_some_and(|after| {
                after.is_empty() || after.starts_with([' ', '\t', '{', '('])
            });
        }
        line.strip_prefix(function)
            .is_some_and(|after| after.trim_start().starts_with("()"))
    })
}

fn positional(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Source `script` and call the shell function `function` with `args`.
/// The last non-empty stdout line is the result: JSON when it parses, else a string.
pub fn run_script(
    script: &Path,
    function: &str,
    args: &[Value],
    kwargs: &Map<String, Value>,
    env_vars: &BTreeMap<String, String>,
    cwd: &Path,
) -> Result<Value, Exception> {
    let module = script
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let source = std::fs::read_to_string(script).map_err(|_| module_not_found(&module))?;
    if !is_identifier(function) || !defines_function(&source, function) {
        return Err(attribute_error(&module, function));
    }

    let mut cmd = format!(". {} && {function}", quote(&script.to_string_lossy()));
    for arg in args {
        cmd.push(' ');
        cmd.push_str(&quote(&positional(arg)));
    }
    let mut vars = env_vars.clone();
    vars.insert("TETHER_ARGS".to_string(), Value::Array(args.to_vec()).to_string());
    vars.insert(
        "TETHER_KWARGS".to_string(),
        Value::Object(kwargs.clone()).to_string(),
    );

    let cwd = cwd.is_dir().then_some(cwd);
    let output = run_with_logs(&cmd, &vars, cwd, false)
        .map_err(|err| Exception::new("OSError", err.to_string()))?;
    if !output.success() {
        return Err(Exception::new(
            "CalledProcessError",
            format!(
                "Command '{function}' returned non-zero exit status {}. {}",
                output.code,
                tail_line(&output.stderr)
            )
            .trim_end()
            .to_string(),
        ));
    }
    let last = tail_line(&output.stdout);
    if last.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(last).unwrap_or_else(|_| Value::String(last.to_string())))
}

#[cfg(test)]
mod tests {
    use super::{FunctionTable, Lookup, builtins, defines_function, run_script};
    use crate::core::error::Exception;
    use serde_json::{Map, Value, json};
    use std::collections::BTreeMap;

    #[test]
    fn lookup_distinguishes_missing_module_from_missing_function() {
        let table = FunctionTable::new().with("math", "add", |_, args, _| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        });
        assert!(matches!(table.lookup("math", "add"), Lookup::Found(_)));
        assert!(matches!(table.lookup("math", "mul"), Lookup::MissingFunction));
        assert!(matches!(table.lookup("stats", "add"), Lookup::MissingModule));
        assert_eq!(table.names(), vec!["math.add".to_string()]);
    }

    #[test]
    fn builtins_echo_and_raise() {
        let table = builtins();
        assert!(matches!(table.lookup("tether", "echo"), Lookup::Found(_)));
        assert!(matches!(table.lookup("tether", "raise"), Lookup::Found(_)));
        assert!(matches!(table.lookup("tether", "nope"), Lookup::MissingFunction));
    }

    #[test]
    fn detects_shell_function_definitions() {
        assert!(defines_function("greet() {\n  echo hi\n}\n", "greet"));
        assert!(defines_function("function greet {\n echo hi\n}\n", "greet"));
        assert!(defines_function("  greet () { echo hi; }", "greet"));
        assert!(!defines_function("greeting() { :; }", "greet"));
    }

    #[test]
    fn script_result_is_last_stdout_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("jobs.sh");
        std::fs::write(
            &script,
            "summarize() {\n  echo working\n  echo \"{\\\"first\\\": \\\"$1\\\", \\\"count\\\": $2}\"\n}\n",
        )
        .expect("write");
        let value = run_script(
            &script,
            "summarize",
            &[json!("a b"), json!(3)],
            &Map::new(),
            &BTreeMap::new(),
            temp.path(),
        )
        .expect("run");
        assert_eq!(value, json!({"first": "a b", "count": 3}));
    }

    #[test]
    fn script_sees_kwargs_and_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("env.sh");
        std::fs::write(&script, "show() {\n  echo \"$GREETING $TETHER_KWARGS\"\n}\n")
            .expect("write");
        let mut kwargs = Map::new();
        kwargs.insert("x".to_string(), json!(1));
        let mut vars = BTreeMap::new();
        vars.insert("GREETING".to_string(), "hello".to_string());
        let value = run_script(&script, "show", &[], &kwargs, &vars, temp.path()).expect("run");
        assert_eq!(value, json!("hello {\"x\":1}"));
    }

    #[test]
    fn nonzero_exit_raises_called_process_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("bad.sh");
        std::fs::write(&script, "fail() {\n  echo nope >&2\n  return 4\n}\n").expect("write");
        let exc: Exception = run_script(
            &script,
            "fail",
            &[],
            &Map::new(),
            &BTreeMap::new(),
            temp.path(),
        )
        .expect_err("raises");
        assert_eq!(exc.type_name, "CalledProcessError");
        assert!(exc.message.contains("exit status 4"));
        assert!(exc.message.contains("nope"));
    }

    #[test]
    fn missing_script_function_is_attribute_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("mod.sh");
        std::fs::write(&script, "present() { :; }\n").expect("write");
        let exc = run_script(
            &script,
            "absent",
            &[],
            &Map::new(),
            &BTreeMap::new(),
            temp.path(),
        )
        .expect_err("raises");
        assert_eq!(exc.type_name, "AttributeError");
    }
}
