use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// First `max_chars` characters of `text`, without an ellipsis.
pub fn prefix_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Combined stdout+stderr exceeded the byte limit and the child was killed.
    pub output_overflow: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.output_overflow && self.status.map(|s| s.success()).unwrap_or(false)
    }
}

pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    run_command_with_limits(command, timeout, None)
}

/// Grace period for pipe readers after the child has exited. Grandchildren
/// that inherited the pipes can keep them open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Run `command` to completion, killing it when `timeout` elapses or when the
/// combined output grows past `max_output_bytes`. Output captured up to that
/// point is always returned.
pub fn run_command_with_limits(
    command: &mut Command,
    timeout: Duration,
    max_output_bytes: Option<usize>,
) -> Result<CommandRunResult, String> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let seen = Arc::new(AtomicUsize::new(0));
    let overflow = Arc::new(AtomicBool::new(false));
    let stdout_reader = PipeReader::spawn(stdout, &seen, &overflow, max_output_bytes);
    let stderr_reader = PipeReader::spawn(stderr, &seen, &overflow, max_output_bytes);

    let start = Instant::now();
    let mut timed_out = false;
    let mut output_overflow = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                let over_limit = overflow.load(Ordering::SeqCst);
                if over_limit || start.elapsed() >= timeout {
                    if over_limit {
                        output_overflow = true;
                    } else {
                        timed_out = true;
                    }
                    kill_tree(&mut child);
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(format!("Failed to wait for command: {}", e)),
        }
    };

    let deadline = Instant::now() + READER_GRACE;
    let stdout_bytes = stdout_reader.finish(deadline);
    let stderr_bytes = stderr_reader.finish(deadline);
    // The child may exit on its own right after a reader hit the cap.
    output_overflow |= overflow.load(Ordering::SeqCst);

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
        output_overflow,
    })
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    // The child leads its own process group; take the whole group down so
    // test runners spawned by `npm` do not outlive the timeout.
    let group = format!("-{}", child.id());
    let killed = Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !killed {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(
        mut source: R,
        seen: &Arc<AtomicUsize>,
        overflow: &Arc<AtomicBool>,
        limit: Option<usize>,
    ) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let seen = Arc::clone(seen);
        let overflow = Arc::clone(overflow);
        let handle = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                let n = match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let before = seen.fetch_add(n, Ordering::SeqCst);
                let keep = match limit {
                    Some(limit) if before + n > limit => limit.saturating_sub(before).min(n),
                    _ => n,
                };
                if let Ok(mut buf) = sink.lock() {
                    buf.extend_from_slice(&chunk[..keep]);
                }
                if keep < n {
                    overflow.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });
        Self { buf, handle }
    }

    /// Collect what was read, waiting for EOF until `deadline` at most.
    fn finish(self, deadline: Instant) -> Vec<u8> {
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.handle.is_finished() {
            let _ = self.handle.join();
        }
        self.buf.lock().map(|buf| buf.clone()).unwrap_or_default()
    }
}

/// Replace `content` of `path` via a sibling temp file and rename, so readers
/// never observe a half-written file.
pub fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp_path = path.with_file_name(format!(".{}.ripple-tmp", file_name));

    let mut file = fs::File::create(&tmp_path)?;
    if let Err(err) = file.write_all(content.as_bytes()).and_then(|_| file.sync_all()) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    drop(file);

    if let Ok(meta) = fs::metadata(path) {
        let _ = fs::set_permissions(&tmp_path, meta.permissions());
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_prefix_chars() {
        assert_eq!(prefix_chars("abcdef", 3), "abc");
        assert_eq!(prefix_chars("ab", 3), "ab");
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "old").unwrap();
        write_atomic(&path, "new").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_success_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err 1>&2"]);
        let result = run_command_with_timeout(&mut cmd, Duration::from_secs(10)).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_timeout_is_reported_not_raised() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo started; sleep 5"]);
        let result = run_command_with_timeout(&mut cmd, Duration::from_millis(300)).unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_output_limit_kills_child() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "while true; do echo flood; done"]);
        let result =
            run_command_with_limits(&mut cmd, Duration::from_secs(10), Some(1024)).unwrap();
        assert!(result.output_overflow);
        assert!(!result.timed_out);
        assert!(!result.success());
        assert!(result.stdout.len() <= 1024);
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let mut cmd = Command::new("ripple-definitely-not-a-program");
        assert!(run_command_with_timeout(&mut cmd, Duration::from_secs(1)).is_err());
    }
}
