use std::process::{ExitStatus, Stdio};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Spawns tasks that echo the child's stdout/stderr line by line, prefixed
/// with `[tag][stdout] ` / `[tag][stderr] `.
pub fn forward_output(child: &mut Child, tag: &str) -> Vec<JoinHandle<()>> {
    let mut pumps = Vec::new();

    if let Some(stdout) = child.stdout.take() {
        let tag_out = format!("[{tag}][stdout] ");
        pumps.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                println!("{tag_out}{line}");
            }
        }));
    }

    if let Some(stderr) = child.stderr.take() {
        let tag_err = format!("[{tag}][stderr] ");
        pumps.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                eprintln!("{tag_err}{line}");
            }
        }));
    }

    pumps
}

/// Runs `cmd` to completion with its output forwarded under `tag`.
pub async fn run_tagged(mut cmd: Command, tag: &str) -> Result<ExitStatus> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning {tag}"))?;

    let pumps = forward_output(&mut child, tag);
    let status = child.wait().await?;
    for p in pumps {
        let _ = p.await;
    }
    Ok(status)
}

/// Like [`run_tagged`], but a non-zero exit is an error.
pub async fn run_checked(cmd: Command, tag: &str) -> Result<()> {
    let status = run_tagged(cmd, tag).await?;
    if !status.success() {
        bail!("{tag} exited with {status}");
    }
    Ok(())
}

/// Quotes `s` for a POSIX shell when it contains anything beyond a safe set.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '+' | ',' | '@'));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("torch==2.8.0+cu128"), "torch==2.8.0+cu128");
        assert_eq!(shell_quote("/kohya_ss"), "/kohya_ss");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_checked_reports_failure() {
        let mut ok = Command::new("sh");
        ok.args(["-c", "echo hello"]);
        tokio_test::assert_ok!(run_checked(ok, "ok").await);

        let mut bad = Command::new("sh");
        bad.args(["-c", "echo oops >&2; exit 7"]);
        let err = run_checked(bad, "bad").await.unwrap_err();
        assert!(err.to_string().contains("bad exited"));
    }
}
