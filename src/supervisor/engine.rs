use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::error::SupervisorError;
use crate::supervisor::block::Mode;
use crate::supervisor::id_mapper::SessionId;

/// Everything the Engine Process wrapper needs to spawn one `claude` CLI
/// subprocess for a given SessionId (spec §4.2).
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub session_id: SessionId,
    pub mode: Mode,
    pub working_dir: PathBuf,
    /// Whether the engine's on-disk catalog already knows this SessionId
    /// (`--resume`) or this is a fresh spawn (`--session-id`).
    pub resume: bool,
    /// Tool allowlist for Normal/Geek mode. Ignored (and permission prompts
    /// bypassed outright) in Evolution mode.
    pub allowed_tools: Vec<String>,
    pub engine_binary: String,
}

impl Mode {
    /// Evolution mode additionally enables permission bypass (spec §4.2).
    pub fn bypasses_permissions(self) -> bool {
        matches!(self, Mode::Evolution)
    }
}

/// One spawned engine subprocess plus its byte pipes, before a Frame Codec
/// attaches to stdout/stderr. Owns the child; dropping it does not kill the
/// process — there is no `Drop` impl anywhere in this crate that does. A
/// session must be terminated explicitly, either via `SessionUnit::
/// terminate`/`Registry::terminate` during normal operation, or via
/// `Registry::terminate_all`, which `main.rs::serve`'s graceful-shutdown
/// hook runs on Ctrl-C so subprocesses don't outlive this process.
pub struct EngineProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Builds the argv for the engine CLI exactly as spec §4.2 ADD prescribes:
/// `--print --verbose --output-format stream-json --input-format
/// stream-json --session-id <uuid>` (or `--resume <uuid>`), plus
/// `--dangerously-skip-permissions` for Evolution or `--allowedTools
/// <list>` otherwise.
fn build_args(config: &SpawnConfig) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--verbose".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--input-format".to_string(),
        "stream-json".to_string(),
    ];

    if config.resume {
        args.push("--resume".to_string());
        args.push(config.session_id.to_string());
    } else {
        args.push("--session-id".to_string());
        args.push(config.session_id.to_string());
    }

    if config.mode.bypasses_permissions() {
        args.push("--dangerously-skip-permissions".to_string());
    } else if !config.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(config.allowed_tools.join(","));
    }

    args
}

/// Spawns the engine binary per `config`. `env_remove`/`env` for
/// `CLAUDECODE` is carried over unchanged from the teacher (spec §4.2 ADD)
/// — it stops the spawned engine from detecting it is itself running
/// inside a Claude Code session.
pub fn spawn(config: &SpawnConfig) -> Result<EngineProcess, SupervisorError> {
    let args = build_args(config);

    let mut child = Command::new(&config.engine_binary)
        .args(&args)
        .current_dir(&config.working_dir)
        .env_remove("CLAUDECODE")
        .env("CLAUDECODE", "")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;

    let stdin = child
        .stdin
        .take()
        .expect("stdin piped at spawn");
    let stdout = child
        .stdout
        .take()
        .expect("stdout piped at spawn");
    let stderr = child
        .stderr
        .take()
        .expect("stderr piped at spawn");

    Ok(EngineProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn config(mode: Mode, resume: bool) -> SpawnConfig {
        SpawnConfig {
            session_id: Uuid::nil(),
            mode,
            working_dir: PathBuf::from("."),
            resume,
            allowed_tools: vec!["Bash".into(), "Edit".into()],
            engine_binary: "claude".into(),
        }
    }

    #[test]
    fn fresh_session_uses_session_id_flag() {
        let args = build_args(&config(Mode::Normal, false));
        assert!(args.contains(&"--session-id".to_string()));
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[test]
    fn resumed_session_uses_resume_flag() {
        let args = build_args(&config(Mode::Normal, true));
        assert!(args.contains(&"--resume".to_string()));
        assert!(!args.contains(&"--session-id".to_string()));
    }

    #[test]
    fn evolution_mode_bypasses_permissions() {
        let args = build_args(&config(Mode::Evolution, false));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[test]
    fn normal_mode_passes_allowed_tools() {
        let args = build_args(&config(Mode::Normal, false));
        let idx = args.iter().position(|a| a == "--allowedTools").unwrap();
        assert_eq!(args[idx + 1], "Bash,Edit");
    }

    #[test]
    fn spawn_failure_surfaces_spawn_failed() {
        let mut bad = config(Mode::Normal, false);
        bad.engine_binary = "definitely-not-a-real-binary-xyz".into();
        let result = spawn(&bad);
        assert!(matches!(result, Err(SupervisorError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn spawn_succeeds_against_a_real_binary() {
        let mut config = config(Mode::Normal, false);
        config.engine_binary = "cat".into();
        let mut process = spawn(&config).expect("cat should spawn");
        drop(process.stdin);
        let _ = process.child.kill().await;
    }
}
