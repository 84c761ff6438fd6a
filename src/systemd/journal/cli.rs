use super::{FOLLOW_BUFFER, JournalError, JournalProvider, LiveStream, LogQuery};
use crate::systemd::logs::{FIELD_UNIT, JournalRecord, LogEntry, normalize, parse_json_lines};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Reads the journal by running `journalctl -o json`
pub struct CliProvider {
    program: PathBuf,
    directory: Option<PathBuf>,
}

impl CliProvider {
    pub fn new(program: impl Into<PathBuf>, directory: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            directory,
        }
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    fn command(&self, unit: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-o", "json", "--no-pager"]);
        if let Some(dir) = &self.directory {
            cmd.arg("--directory").arg(dir);
        }
        // Exact field match like the native reader, not `-u`
        if let Some(u) = unit {
            cmd.arg(format!("{}={}", FIELD_UNIT, u));
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl JournalProvider for CliProvider {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn fetch_recent(&self, query: &LogQuery) -> Result<Vec<LogEntry>, JournalError> {
        let mut cmd = self.command(query.unit.as_deref());
        cmd.args(["-n", &query.limit.to_string()]);

        let output = cmd.output().await.map_err(|source| JournalError::Spawn {
            program: self.program_name(),
            source,
        })?;
        if !output.status.success() {
            return Err(JournalError::Exit {
                program: self.program_name(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_json_lines(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn open_live_stream(&self, unit: Option<&str>) -> Result<LiveStream, JournalError> {
        let mut cmd = self.command(unit);
        cmd.args(["-f", "-n", "0"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|source| JournalError::Spawn {
            program: self.program_name(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or(JournalError::ReaderGone)?;

        let (tx, rx) = mpsc::channel(FOLLOW_BUFFER);
        tokio::spawn(pump(child, stdout, tx, unit.map(str::to_string)));
        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Forward parsed lines until the client or the child goes away, then reap the child
async fn pump(
    mut child: Child,
    stdout: ChildStdout,
    tx: mpsc::Sender<LogEntry>,
    unit: Option<String>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut skipped = 0usize;

    loop {
        tokio::select! {
            _ = tx.closed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match JournalRecord::from_json_line(&line).and_then(|r| normalize(&r)) {
                        Ok(entry) => {
                            if tx.send(entry).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            skipped += 1;
                            tracing::debug!(reason = %e.reason, "skipping journal line");
                        }
                    }
                }
                Ok(None) => {
                    tracing::warn!(unit = unit.as_deref().unwrap_or("*"), "journalctl follow ended");
                    break;
                }
                Err(e) => {
                    tracing::warn!("reading journalctl output failed: {}", e);
                    break;
                }
            },
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!("journalctl already gone: {}", e);
    }
    match child.wait().await {
        Ok(status) => tracing::debug!(
            unit = unit.as_deref().unwrap_or("*"),
            skipped,
            %status,
            "journalctl follow reaped"
        ),
        Err(e) => tracing::warn!("failed to reap journalctl: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systemd::journal::Journal;
    use crate::systemd::journal::testing::FailingProvider;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Write an executable shell script standing in for journalctl
    fn fake_journalctl(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("journalctl");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const HISTORY: &str = r#"cat <<'EOF'
{"__REALTIME_TIMESTAMP":"1700000000000001","PRIORITY":"6","_SYSTEMD_UNIT":"cron.service","_PID":"10","MESSAGE":"first"}
garbage that is not json
{"__REALTIME_TIMESTAMP":"1700000000000002","PRIORITY":"4","_SYSTEMD_UNIT":"cron.service","_PID":"10","MESSAGE":"second"}
{"__REALTIME_TIMESTAMP":"1700000000000003","PRIORITY":"3","_SYSTEMD_UNIT":"cron.service","_PID":"11","MESSAGE":"third"}
EOF"#;

    fn query(limit: usize) -> LogQuery {
        LogQuery {
            unit: Some("cron.service".to_string()),
            limit,
        }
    }

    #[tokio::test]
    async fn fetch_parses_output_and_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CliProvider::new(fake_journalctl(dir.path(), HISTORY), None);

        let entries = provider.fetch_recent(&query(10)).await.unwrap();
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["first", "second", "third"]);
        assert_eq!(entries[2].pid, Some(11));
    }

    #[tokio::test]
    async fn passes_unit_limit_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args");
        let script = format!("echo \"$@\" > {}", args_file.display());
        let provider = CliProvider::new(
            fake_journalctl(dir.path(), &script),
            Some(PathBuf::from("/var/log/journal")),
        );

        provider.fetch_recent(&query(25)).await.unwrap();
        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(
            args.trim(),
            "-o json --no-pager --directory /var/log/journal _SYSTEMD_UNIT=cron.service -n 25"
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CliProvider::new(
            fake_journalctl(dir.path(), "echo 'No journal files were found.' >&2; exit 1"),
            None,
        );

        let err = provider.fetch_recent(&query(10)).await.unwrap_err();
        assert!(matches!(err, JournalError::Exit { .. }));
        assert!(err.to_string().contains("No journal files"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let provider = CliProvider::new("/nonexistent/journalctl", None);
        let err = provider.fetch_recent(&query(10)).await.unwrap_err();
        assert!(matches!(err, JournalError::Spawn { .. }));
    }

    #[tokio::test]
    async fn fallback_serves_same_entries_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(
            vec![
                Arc::new(FailingProvider),
                Arc::new(CliProvider::new(fake_journalctl(dir.path(), HISTORY), None)),
            ],
            Duration::from_secs(5),
            CancellationToken::new(),
        );

        let entries = journal.fetch_recent(&query(2)).await.unwrap();
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["second", "third"]);
    }

    #[tokio::test]
    async fn slow_journalctl_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(
            vec![Arc::new(CliProvider::new(
                fake_journalctl(dir.path(), "exec sleep 30"),
                None,
            ))],
            Duration::from_millis(200),
            CancellationToken::new(),
        );

        let err = journal.fetch_recent(&query(1)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    fn process_alive(pid: &str) -> bool {
        Path::new("/proc").join(pid.trim()).exists()
    }

    /// One follow cycle: read a live line, drop the stream, wait for the child to exit
    async fn follow_once(journal: &Journal, pid_file: &Path) {
        let _ = std::fs::remove_file(pid_file);
        let mut stream = journal.open_live_stream(Some("cron.service")).await.unwrap();
        let entry = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.message, "live");

        let pid = std::fs::read_to_string(pid_file).unwrap();
        assert!(process_alive(&pid));

        drop(stream);
        let mut released = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !process_alive(&pid) {
                released = true;
                break;
            }
        }
        assert!(released, "journalctl child outlived its stream");
    }

    fn follow_journal(dir: &Path, pid_file: &Path) -> Journal {
        let script = format!(
            r#"echo $$ > {pid}
echo '{{"__REALTIME_TIMESTAMP":"1","MESSAGE":"from history"}}'
echo 'not json'
echo "{{\"__REALTIME_TIMESTAMP\":\"$(($(date +%s) + 5))000000\",\"MESSAGE\":\"live\"}}"
exec sleep 30"#,
            pid = pid_file.display()
        );
        Journal::new(
            vec![Arc::new(CliProvider::new(fake_journalctl(dir, &script), None))],
            Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn follow_streams_new_lines_and_kills_child_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let journal = follow_journal(dir.path(), &pid_file);

        follow_once(&journal, &pid_file).await;
    }

    #[tokio::test]
    async fn repeated_follows_leave_no_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let journal = follow_journal(dir.path(), &pid_file);

        for _ in 0..5 {
            follow_once(&journal, &pid_file).await;
        }
    }
}
