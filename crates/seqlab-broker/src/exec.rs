//! Process spawning and output capture.
//!
//! Runs after the privilege drop, so the child starts with the
//! authenticated user's identity and the confined working directory
//! already in place. The child gets exactly the environment the
//! request carried; the broker's own environment never leaks in.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use seqlab_protocol::Deadline;

use crate::error::{BrokerError, BrokerResult};

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Everything a finished child left behind.
#[derive(Debug)]
pub struct CaptureResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
}

/// Split a request command line into argv. Whitespace-separated, no
/// quoting; argv[0] names the program.
pub fn split_cmdline(cmdline: &str) -> BrokerResult<Vec<String>> {
    let argv: Vec<String> = cmdline.split_whitespace().map(str::to_owned).collect();
    if argv.is_empty() {
        return Err(BrokerError::Spawn("empty command line".to_string()));
    }
    Ok(argv)
}

/// Parse the request's environment block: newline-separated
/// `KEY=VALUE` lines, blank lines ignored.
pub fn parse_env_block(block: &str) -> BrokerResult<Vec<(String, String)>> {
    let mut env = Vec::new();
    for line in block.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(BrokerError::Protocol(format!(
                "environment line without '=': '{line}'"
            )));
        };
        if key.is_empty() {
            return Err(BrokerError::Protocol("empty environment key".to_string()));
        }
        env.push((key.to_string(), value.to_string()));
    }
    Ok(env)
}

/// Resolve the program against the request environment's PATH.
///
/// A name containing a slash is taken as-is. The broker's own PATH is
/// never consulted.
pub fn resolve_program(name: &str, env: &[(String, String)]) -> BrokerResult<PathBuf> {
    if name.contains('/') {
        let p = PathBuf::from(name);
        if is_executable(&p) {
            return Ok(p);
        }
        return Err(BrokerError::Spawn(format!("'{name}' is not executable")));
    }
    let path_var = env
        .iter()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.as_str())
        .unwrap_or(FALLBACK_PATH);
    for dir in path_var.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(BrokerError::Spawn(format!(
        "'{name}' not found on request PATH"
    )))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Spawn `argv` with exactly `env` and capture both output streams to
/// completion.
///
/// The select loop keeps draining whichever pipe has bytes while also
/// watching for child exit; it only finishes once both pipes hit EOF
/// and the exit status is in, so a child that exits while output is
/// still buffered in the pipes loses nothing. The whole capture is
/// bounded by `deadline`; on expiry the child is killed and reaped.
pub async fn spawn_and_capture(
    argv: &[String],
    env: &[(String, String)],
    deadline: &Deadline,
) -> BrokerResult<CaptureResult> {
    let program = resolve_program(&argv[0], env)?;
    debug!("spawning {} ({} args)", program.display(), argv.len() - 1);

    let mut child = Command::new(&program)
        .args(&argv[1..])
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BrokerError::Spawn(format!("spawning {}: {e}", program.display())))?;

    let outcome = deadline.bound(capture(&mut child)).await;
    match outcome {
        Ok(result) => result,
        Err(expired) => {
            warn!("child exceeded {:?}, killing", expired.budget);
            if let Err(e) = child.start_kill() {
                warn!("kill failed: {e}");
            }
            let _ = child.wait().await;
            Err(BrokerError::Timeout(format!(
                "child produced no result within {:?}",
                expired.budget
            )))
        }
    }
}

async fn capture(child: &mut Child) -> BrokerResult<CaptureResult> {
    let mut out_pipe = child
        .stdout
        .take()
        .ok_or_else(|| BrokerError::Spawn("child stdout pipe missing".to_string()))?;
    let mut err_pipe = child
        .stderr
        .take()
        .ok_or_else(|| BrokerError::Spawn("child stderr pipe missing".to_string()))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut out_open = true;
    let mut err_open = true;
    let mut status: Option<ExitStatus> = None;

    while out_open || err_open || status.is_none() {
        tokio::select! {
            n = out_pipe.read(&mut out_buf), if out_open => {
                let n = n.map_err(|e| BrokerError::Spawn(format!("reading child stdout: {e}")))?;
                if n == 0 {
                    out_open = false;
                } else {
                    stdout.extend_from_slice(&out_buf[..n]);
                }
            }
            n = err_pipe.read(&mut err_buf), if err_open => {
                let n = n.map_err(|e| BrokerError::Spawn(format!("reading child stderr: {e}")))?;
                if n == 0 {
                    err_open = false;
                } else {
                    stderr.extend_from_slice(&err_buf[..n]);
                }
            }
            s = child.wait(), if status.is_none() => {
                let s = s.map_err(|e| BrokerError::Spawn(format!("waiting for child: {e}")))?;
                status = Some(s);
            }
        }
    }

    let status = status.expect("loop exits only with a status");
    debug!(
        "child exited {status}, captured {} stdout / {} stderr bytes",
        stdout.len(),
        stderr.len()
    );
    Ok(CaptureResult {
        stdout,
        stderr,
        status,
    })
}

/// Drop the completion sentinel into the confined working directory.
/// The single line is the local completion time.
pub fn write_sentinel(name: &str) -> BrokerResult<()> {
    let stamp = chrono::Local::now().to_rfc3339();
    std::fs::write(name, format!("{stamp}\n"))
        .map_err(|e| BrokerError::Fs(format!("writing sentinel '{name}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh_env() -> Vec<(String, String)> {
        vec![("PATH".to_string(), "/usr/bin:/bin".to_string())]
    }

    #[test]
    fn cmdline_splits_on_whitespace() {
        let argv = split_cmdline("blastp  -query in.fasta\t-out out.txt").unwrap();
        assert_eq!(argv, ["blastp", "-query", "in.fasta", "-out", "out.txt"]);
        assert!(split_cmdline("   ").is_err());
    }

    #[test]
    fn env_block_parses_and_rejects() {
        let env = parse_env_block("PATH=/bin\nHOME=/home/alice\n\nEMPTY=").unwrap();
        assert_eq!(env.len(), 3);
        assert_eq!(env[1], ("HOME".to_string(), "/home/alice".to_string()));
        assert_eq!(env[2].1, "");
        assert!(parse_env_block("NOEQUALS").is_err());
        assert!(parse_env_block("=value").is_err());
    }

    #[test]
    fn value_may_contain_equals() {
        let env = parse_env_block("OPTS=-a=1 -b=2").unwrap();
        assert_eq!(env[0].1, "-a=1 -b=2");
    }

    #[test]
    fn resolves_against_request_path_only() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("mytool");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let env = vec![("PATH".to_string(), dir.path().display().to_string())];
        assert_eq!(resolve_program("mytool", &env).unwrap(), bin);
        // Without PATH in the request env, the fallback does not know
        // the temp dir.
        assert!(resolve_program("mytool", &[]).is_err());
    }

    #[test]
    fn non_executable_file_is_not_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("data.txt");
        std::fs::write(&plain, "x").unwrap();
        let env = vec![("PATH".to_string(), dir.path().display().to_string())];
        assert!(resolve_program("data.txt", &env).is_err());
    }

    #[tokio::test]
    async fn captures_both_streams_and_status() {
        let argv = split_cmdline("sh -c").unwrap();
        let mut argv = argv;
        argv.push("echo out; echo err >&2; exit 3".to_string());
        let deadline = Deadline::after(Duration::from_secs(10));

        let r = spawn_and_capture(&argv, &sh_env(), &deadline).await.unwrap();
        assert_eq!(r.stdout, b"out\n");
        assert_eq!(r.stderr, b"err\n");
        assert_eq!(r.status.code(), Some(3));
    }

    #[tokio::test]
    async fn large_output_is_fully_drained() {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "dd if=/dev/zero bs=1024 count=300 2>/dev/null".to_string(),
        ];
        let deadline = Deadline::after(Duration::from_secs(10));
        let r = spawn_and_capture(&argv, &sh_env(), &deadline).await.unwrap();
        assert_eq!(r.stdout.len(), 300 * 1024);
        assert!(r.status.success());
    }

    #[tokio::test]
    async fn overrunning_child_is_killed() {
        let argv = vec!["sleep".to_string(), "30".to_string()];
        let deadline = Deadline::after(Duration::from_millis(200));
        let err = spawn_and_capture(&argv, &sh_env(), &deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
    }

    #[tokio::test]
    async fn unknown_program_is_a_spawn_error() {
        let argv = vec!["definitely-not-a-real-tool".to_string()];
        let deadline = Deadline::after(Duration::from_secs(1));
        let err = spawn_and_capture(&argv, &sh_env(), &deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Spawn(_)));
    }

    #[test]
    fn sentinel_holds_one_timestamp_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".finished");
        write_sentinel(path.to_str().unwrap()).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        let stamp = lines.next().unwrap();
        assert!(lines.next().is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }
}
