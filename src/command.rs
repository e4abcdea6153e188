//! External command execution: preprocessor pipes and post-save side effects (C2).

use std::io::Write as _;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("argv is empty")]
    EmptyArgv,
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },
    #[error("'{program}' exited with status {status}: {stderr}")]
    NonZeroExit {
        program: String,
        status: i32,
        stderr: String,
    },
}

/// Result of running an external command: captured stdout (if requested) and stderr.
#[derive(Debug, Default, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Spawns `argv[0]` with `argv[1..]`, feeds `stdin`, always captures stderr and
/// captures stdout iff `capture_stdout`. Waits for exit; a non-zero exit status
/// is an error carrying the captured stderr.
pub fn run_command(
    capture_stdout: bool,
    stdin: &[u8],
    argv: &[String],
) -> Result<CommandOutput, CommandError> {
    let (program, args) = argv.split_first().ok_or(CommandError::EmptyArgv)?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CommandError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;

    // Feed stdin from a separate thread: if the child's combined stdout/stderr
    // exceeds the pipe buffer before it has consumed all of stdin, writing
    // stdin to completion here (before draining output) would deadlock.
    let stdin_pipe = child.stdin.take();
    let input = stdin.to_vec();
    let writer = std::thread::spawn(move || {
        if let Some(mut pipe) = stdin_pipe {
            let _ = pipe.write_all(&input);
        }
    });

    let output = child.wait_with_output().map_err(|e| CommandError::Spawn {
        program: program.clone(),
        reason: e.to_string(),
    })?;
    let _ = writer.join();

    if !output.status.success() {
        return Err(CommandError::NonZeroExit {
            program: program.clone(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(CommandOutput {
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Thin wrapper requiring non-empty argv and piping `input` through stdin.
pub fn ext_preprocess(argv: &[String], input: &[u8]) -> Result<CommandOutput, CommandError> {
    if argv.is_empty() {
        return Err(CommandError::EmptyArgv);
    }
    run_command(true, input, argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_argv() {
        let err = run_command(true, &[], &[]).unwrap_err();
        assert!(matches!(err, CommandError::EmptyArgv));
    }

    #[test]
    fn captures_stdout_and_echoes_stdin() {
        let argv = vec!["cat".to_string()];
        let out = run_command(true, b"hello", &argv).unwrap();
        assert_eq!(out.stdout, b"hello");
    }

    #[test]
    fn non_zero_exit_carries_stderr() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo oops >&2; exit 3".to_string()];
        let err = run_command(false, &[], &argv).unwrap_err();
        match err {
            CommandError::NonZeroExit { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert!(stderr.contains("oops"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn ext_preprocess_requires_argv() {
        assert!(matches!(
            ext_preprocess(&[], b"x").unwrap_err(),
            CommandError::EmptyArgv
        ));
    }
}
