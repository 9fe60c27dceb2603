//! Purpose: Hold top-level CLI command dispatch for `tether`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Helpers in `main.rs` remain the source of command business logic.

use super::*;

pub(super) fn dispatch_command(
    command: Command,
    connection: Connection,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "tether", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Serve(args) => {
            let config = serve_config_from_args(args, connection.token_file)?;
            run_serve(config)?;
            Ok(RunOutcome::ok())
        }
        Command::Status => {
            let snapshot = connection.target()?.status()?;
            let value = serde_json::to_value(&snapshot).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode status")
                    .with_source(err)
            })?;
            emit_json(value);
            Ok(RunOutcome::ok())
        }
        Command::Keys { env } => {
            let keys = connection.target()?.keys(env.as_deref())?;
            emit_json(json!({ "keys": keys }));
            Ok(RunOutcome::ok())
        }
        Command::Get { key, env } => {
            let object = connection.target()?.get(&key, env.as_deref())?.ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message(format!("no object stored under `{key}`"))
                    .with_hint("Use `tether keys` to list stored keys.")
            })?;
            emit_json(json!({
                "key": key,
                "value": object.value,
                "resource_type": object.resource_type,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Put {
            key,
            value,
            env,
            resource_type,
        } => {
            connection.target()?.put(
                &key,
                parse_json_arg(&value),
                resource_type.as_deref(),
                env.as_deref(),
            )?;
            emit_json(json!({ "key": key, "stored": true }));
            Ok(RunOutcome::ok())
        }
        Command::Delete { key } => {
            connection.target()?.delete(&key)?;
            emit_json(json!({ "key": key, "deleted": true }));
            Ok(RunOutcome::ok())
        }
        Command::Call(args) => {
            let envelope = call_envelope(args);
            let response = connection.target()?.dispatch(&envelope)?;
            let result = response.into_result()?;
            emit_json(result);
            Ok(RunOutcome::ok())
        }
        Command::Run { commands, env_vars } => {
            run_commands(&connection.target()?, &commands, env_vars)
        }
    }
}
