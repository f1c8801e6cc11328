use std::{
    os::fd::OwnedFd,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::unix::pipe,
    process::{Child, Command},
    time::Instant,
};
use uuid::Uuid;

use crate::executor::{
    BufferPool, CodeExecutor, ExecError, ExecResult, OutputSink, TRUNCATION_MARKER,
};

const READ_CHUNK_BYTES: usize = 1024;
const UNLINK_ATTEMPTS: u32 = 3;
const UNLINK_BACKOFF: Duration = Duration::from_millis(100);

// Environment the Go toolchain needs; everything else is withheld from the
// child.
const RUNNER_ENV_KEYS: [&str; 6] = [
    "HOME",
    "PATH",
    "GOCACHE",
    "XDG_CACHE_HOME",
    "GOPATH",
    "GOROOT",
];

/// Runs submitted source through `go run`, streaming the combined
/// stdout+stderr to the sink, bounded by `max_output` bytes. One temp file,
/// one child and one read loop per call; safe to share across handlers.
pub struct GoExecutor {
    go_path: PathBuf,
    temp_dir: PathBuf,
    max_output: usize,
    buffers: BufferPool,
}

impl GoExecutor {
    pub fn new(go_path: PathBuf, temp_dir: PathBuf, max_output: usize) -> Self {
        Self {
            go_path,
            temp_dir,
            max_output,
            buffers: BufferPool::new(READ_CHUNK_BYTES),
        }
    }

    async fn write_source(&self, source: &str) -> ExecResult<PathBuf> {
        let path = self
            .temp_dir
            .join(format!("code-{}.go", Uuid::new_v4().as_simple()));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(ExecError::TempFile)?;

        if let Err(err) = file.write_all(source.as_bytes()).await {
            drop(file);
            remove_with_retry(&path).await;
            return Err(ExecError::WriteSource(err));
        }
        Ok(path)
    }

    // Both child streams share one pipe write end, so the kernel serializes
    // the child's writes and a single read loop sees them in production
    // order, stderr merged into stdout.
    fn spawn_child(&self, source_path: &Path) -> ExecResult<(Child, pipe::Receiver)> {
        let (reader, writer) = std::io::pipe().map_err(ExecError::Pipe)?;
        let stderr_writer = writer.try_clone().map_err(ExecError::Pipe)?;

        let mut cmd = Command::new(&self.go_path);
        cmd.arg("run")
            .arg(source_path)
            .env_clear()
            .envs(runner_env())
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr_writer))
            .process_group(0)
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(ExecError::Spawn)?;
        let output = pipe::Receiver::from_owned_fd(OwnedFd::from(reader)).map_err(ExecError::Pipe)?;

        // Dropping `cmd` closes the parent's write ends; EOF then arrives
        // once the child's copies close.
        Ok((child, output))
    }

    async fn run(
        &self,
        source_path: &Path,
        deadline: Instant,
        sink: &mut dyn OutputSink,
    ) -> ExecResult<()> {
        let (mut child, mut output) = self.spawn_child(source_path)?;

        match self.stream_output(&mut output, deadline, sink).await {
            Ok(false) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        kill_group(&child);
                        let _ = child.wait().await;
                        Err(ExecError::Timeout)
                    }
                    status = child.wait() => match status {
                        Ok(status) if status.success() => Ok(()),
                        Ok(status) => Err(ExecError::Exit(status)),
                        Err(err) => Err(ExecError::Wait(err)),
                    },
                }
            }
            Ok(true) => {
                // Truncated: stop the child instead of draining it.
                kill_group(&child);
                let _ = child.wait().await;
                Ok(())
            }
            Err(err) => {
                kill_group(&child);
                let _ = child.wait().await;
                Err(err)
            }
        }
    }

    /// Forwards chunks from the merged pipe until EOF, the byte budget, or
    /// the deadline. Returns whether output was truncated.
    async fn stream_output(
        &self,
        output: &mut pipe::Receiver,
        deadline: Instant,
        sink: &mut dyn OutputSink,
    ) -> ExecResult<bool> {
        let mut buf = self.buffers.get();

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        let mut total = 0usize;

        let outcome = loop {
            let n = tokio::select! {
                _ = &mut sleep => break Err(ExecError::Timeout),
                read = output.read(&mut buf) => match read {
                    Ok(0) => break Ok(false),
                    Ok(n) => n,
                    Err(err) => break Err(ExecError::Read(err)),
                },
            };

            let chunk = &buf[..n];

            if total + n > self.max_output {
                let allowed = self.max_output - total;
                if allowed > 0 {
                    if let Err(err) = sink.write_chunk(&chunk[..allowed]).await {
                        break Err(err);
                    }
                }
                if let Err(err) = sink.write_chunk(TRUNCATION_MARKER.as_bytes()).await {
                    break Err(err);
                }
                break Ok(true);
            }

            if let Err(err) = sink.write_chunk(chunk).await {
                break Err(err);
            }
            total += n;
        };

        self.buffers.put(buf);
        outcome
    }
}

#[async_trait]
impl CodeExecutor for GoExecutor {
    async fn execute(
        &self,
        source: &str,
        deadline: Instant,
        sink: &mut dyn OutputSink,
    ) -> ExecResult<()> {
        let source_path = self.write_source(source).await?;
        let result = self.run(&source_path, deadline, sink).await;
        remove_with_retry(&source_path).await;
        result
    }
}

fn runner_env() -> Vec<(String, String)> {
    RUNNER_ENV_KEYS
        .iter()
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|value| !value.is_empty())
                .map(|value| (key.to_string(), value))
        })
        .collect()
}

// The child runs in its own process group so descendants go down with it.
fn kill_group(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    }
}

async fn remove_with_retry(path: &Path) {
    for attempt in 1..=UNLINK_ATTEMPTS {
        match tokio::fs::remove_file(path).await {
            Ok(()) => return,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                if attempt == UNLINK_ATTEMPTS {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to remove source file"
                    );
                } else {
                    tokio::time::sleep(UNLINK_BACKOFF).await;
                }
            }
        }
    }
}
