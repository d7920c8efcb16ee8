//! Login shell command building.
//!
//! Agent binaries are started through the user's login shell so they pick up
//! PATH and version-manager setup from profile files. Non-POSIX shells (fish,
//! nushell) fall back to bash or sh.
//!
//! The command string handed to `-c` only ever contains the binary and the
//! fixed argument vector, each quoted with `shlex`. Free-form user text (an
//! initial prompt) is never spliced into that string: it travels as a
//! positional shell parameter in argv and the command refers to it as `"$1"`.
//!
//! ```text
//! argv: ["/bin/zsh", "-l", "-c", "exec claude --model opus \"$1\"", "agent", "<prompt>"]
//! ```

use std::process::Command;

use crate::error::ProviderError;

/// Name bound to `$0` inside the `-c` script.
const SCRIPT_NAME: &str = "agent";

/// Exit status emitted when an agent process terminates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AgentExit {
    pub code: i32,
    pub signal: Option<i32>,
}

/// PATH with the binary's parent directory prepended, so node/etc. next to
/// the binary are found. `None` for bare binary names.
pub fn path_with_binary_dir(binary_path: &str) -> Option<String> {
    if !binary_path.contains('/') {
        return None;
    }
    let dir = std::path::Path::new(binary_path).parent()?.to_str()?;
    let existing = std::env::var("PATH").unwrap_or_default();
    Some(if existing.is_empty() {
        dir.to_string()
    } else {
        format!("{}:{}", dir, existing)
    })
}

/// Program and arguments that run `binary_path args... [positional]` in a
/// login shell.
///
/// When `positional` is set it is appended to argv as `$1`, and the command
/// string passes `"$1"` as the binary's last argument.
#[cfg(unix)]
pub fn login_shell_argv(
    binary_path: &str,
    args: &[String],
    positional: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Vec<String>, ProviderError> {
    let prefix = get_shell_prefix(shell_prefix);
    let mut argv: Vec<String> = prefix.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(ProviderError::Config("Empty shell prefix".to_string()));
    }

    let mut command_parts = Vec::with_capacity(args.len() + 3);
    command_parts.push("exec".to_string());
    command_parts.push(quote(binary_path, binary_path)?);
    for arg in args {
        command_parts.push(quote(arg, binary_path)?);
    }
    if positional.is_some() {
        command_parts.push("\"$1\"".to_string());
    }
    argv.push(command_parts.join(" "));

    if let Some(value) = positional {
        argv.push(SCRIPT_NAME.to_string());
        argv.push(value.to_string());
    }

    Ok(argv)
}

/// Windows version: runs the binary directly (no login shell concept).
#[cfg(windows)]
pub fn login_shell_argv(
    binary_path: &str,
    args: &[String],
    positional: Option<&str>,
    _shell_prefix: Option<&str>,
) -> Result<Vec<String>, ProviderError> {
    let mut argv = vec![binary_path.to_string()];
    argv.extend(args.iter().cloned());
    if let Some(value) = positional {
        argv.push(value.to_string());
    }
    Ok(argv)
}

#[cfg(unix)]
fn quote(arg: &str, binary_path: &str) -> Result<String, ProviderError> {
    shlex::try_quote(arg)
        .map(|q| q.into_owned())
        .map_err(|_| {
            ProviderError::spawn_failure(binary_path, None, format!("Invalid argument: {arg:?}"))
        })
}

/// Build a std `Command` that runs the binary with args in a login shell.
///
/// # Arguments
/// * `binary_path` - Path to the executable
/// * `args` - Arguments to pass to the executable
/// * `working_dir` - Optional working directory
/// * `shell_prefix` - Optional shell prefix override (e.g., "/bin/zsh -l -c")
pub fn build_login_shell_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command, ProviderError> {
    let argv = login_shell_argv(binary_path, args, None, shell_prefix)?;
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    if let Some(path) = path_with_binary_dir(binary_path) {
        cmd.env("PATH", path);
    }

    Ok(cmd)
}

/// Get the shell prefix to use for command execution.
///
/// A non-empty custom prefix is used as-is. Otherwise `$SHELL -l -c`, with
/// non-POSIX shells replaced by /bin/bash or /bin/sh.
#[cfg(unix)]
fn get_shell_prefix(custom_prefix: Option<&str>) -> String {
    if let Some(prefix) = custom_prefix {
        if !prefix.trim().is_empty() {
            return prefix.to_string();
        }
    }

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let shell_name = std::path::Path::new(&shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    let non_posix = ["fish", "nu", "nushell", "elvish", "xonsh", "ion"];

    let effective_shell = if shell.is_empty() || non_posix.iter().any(|&s| shell_name == s) {
        if std::path::Path::new("/bin/bash").exists() {
            "/bin/bash"
        } else {
            "/bin/sh"
        }
    } else {
        &shell
    };

    format!("{} -l -c", effective_shell)
}

// ============================================================================
// TESTS
// ============================================================================
