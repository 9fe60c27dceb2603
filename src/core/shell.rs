// Shell command execution with optional line streaming into the log.
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Prefix `cmd` with an activation command when one is set.
pub fn prefixed(activation: Option<&str>, cmd: &str) -> String {
    match activation {
        Some(prefix) if !prefix.trim().is_empty() => format!("{} {cmd}", prefix.trim()),
        _ => cmd.to_string(),
    }
}

pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '_' | '-' | '.' | ':' | '='))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

/// Last non-empty line of a captured stream, for error messages.
pub fn tail_line(stream: &str) -> &str {
    stream
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim()
}

/// Run `cmd` through `sh -c`, capturing output. With `stream_logs`, stdout lines are
/// also emitted as they arrive.
pub fn run_with_logs(
    cmd: &str,
    env_vars: &BTreeMap<String, String>,
    cwd: Option<&Path>,
    stream_logs: bool,
) -> Result<CommandOutput, Error> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .envs(env_vars)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to start command: {cmd}"))
            .with_source(err)
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("stdout missing"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("stderr missing"))?;

    let stdout_handle = thread::spawn(move || read_lines(stdout, stream_logs));
    let stderr_handle = thread::spawn(move || {
        let mut bytes = Vec::new();
        BufReader::new(stderr)
            .read_to_end(&mut bytes)
            .map(|_| String::from_utf8_lossy(&bytes).into_owned())
    });

    let status = child.wait().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to wait for command: {cmd}"))
            .with_source(err)
    })?;
    let stdout = join_reader(stdout_handle, "stdout")?;
    let stderr = join_reader(stderr_handle, "stderr")?;

    Ok(CommandOutput {
        code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

// Output is not required to be UTF-8; invalid bytes decode lossily.
fn read_lines(stream: impl Read, stream_logs: bool) -> std::io::Result<String> {
    let mut reader = BufReader::new(stream);
    let mut out = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let raw = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        if stream_logs {
            info!(target: "tether::shell", "{line}");
        }
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

fn join_reader(
    handle: thread::JoinHandle<std::io::Result<String>>,
    stream: &str,
) -> Result<String, Error> {
    handle
        .join()
        .map_err(|_| {
            Error::new(ErrorKind::Internal).with_message(format!("{stream} reader panicked"))
        })?
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to read {stream}"))
                .with_source(err)
        })
}

#[cfg(test)]
mod tests {
    use super::{prefixed, quote, run_with_logs, tail_line};
    use std::collections::BTreeMap;

    #[test]
    fn captures_output_and_exit_code() {
        let output = run_with_logs("echo hi; echo oops >&2; exit 3", &BTreeMap::new(), None, true)
            .expect("run");
        assert_eq!(output.code, 3);
        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.stderr, "oops\n");
    }

    #[test]
    fn non_utf8_output_decodes_lossily() {
        let output = run_with_logs(
            "printf 'caf\\351\\n'; printf 'bad\\377' >&2; exit 0",
            &BTreeMap::new(),
            None,
            true,
        )
        .expect("run");
        assert!(output.success());
        assert_eq!(output.stdout, "caf\u{fffd}\n");
        assert_eq!(output.stderr, "bad\u{fffd}");
    }

    #[test]
    fn env_vars_reach_the_child() {
        let mut vars = BTreeMap::new();
        vars.insert("TETHER_TEST_VALUE".to_string(), "42".to_string());
        let output =
            run_with_logs("echo $TETHER_TEST_VALUE", &vars, None, false).expect("run");
        assert_eq!(output.stdout.trim(), "42");
    }

    #[test]
    fn activation_prefix_is_optional() {
        assert_eq!(prefixed(None, "ls"), "ls");
        assert_eq!(prefixed(Some("  "), "ls"), "ls");
        assert_eq!(prefixed(Some("conda run -n x"), "ls"), "conda run -n x ls");
    }

    #[test]
    fn quoting_only_wraps_when_needed() {
        assert_eq!(quote("/srv/pkg-1"), "/srv/pkg-1");
        assert_eq!(quote("it's here"), "'it'\"'\"'s here'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn tail_line_skips_trailing_blanks() {
        assert_eq!(tail_line("first\nlast\n\n"), "last");
        assert_eq!(tail_line(""), "");
    }
}
