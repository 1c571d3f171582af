//! Command execution: unary (`/exec`) and streaming (`/exec/stream`),
//! spec.md §4.2.

use std::process::Stdio;
use std::time::Duration;

use sandbox_proto::StreamEvent;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

const DEFAULT_WORKDIR: &str = "/workspace";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const STREAM_CHUNK_BYTES: usize = 4096;

fn spawn(command: &str, workdir: Option<&str>) -> std::io::Result<tokio::process::Child> {
    Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .current_dir(workdir.unwrap_or(DEFAULT_WORKDIR))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Run `command` to completion (or until `timeout` elapses), returning the
/// collected stdout/stderr. Never returns `Err` to the caller: spawn
/// failures and timeouts are both encoded in the returned `ExecResult`,
/// per spec.md §4.2 ("`/exec` never raises to the transport").
pub async fn run_exec(
    command: &str,
    workdir: Option<&str>,
    timeout: Option<u64>,
) -> sandbox_proto::ExecResult {
    let timeout = Duration::from_secs(timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));

    let mut child = match spawn(command, workdir) {
        Ok(child) => child,
        Err(e) => return sandbox_proto::ExecResult::failure(e.to_string()),
    };

    let wait = async {
        let output = child.wait_with_output().await?;
        Ok::<_, std::io::Error>(output)
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(output)) => sandbox_proto::ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
        },
        Ok(Err(e)) => sandbox_proto::ExecResult::failure(e.to_string()),
        Err(_) => sandbox_proto::ExecResult::timeout(),
    }
}

/// Run `command`, emitting a [`StreamEvent`] per chunk read from stdout or
/// stderr (≤4KiB each), followed by a final `Exit` event. Events from the
/// two streams interleave in whatever order chunks actually arrive; there
/// is no guaranteed ordering across stdout and stderr (spec.md §4.2).
pub fn run_exec_stream(
    command: String,
    workdir: Option<String>,
) -> tokio_stream::wrappers::ReceiverStream<StreamEvent> {
    let (tx, rx) = tokio::sync::mpsc::channel(64);

    tokio::spawn(async move {
        let mut child = match spawn(&command, workdir.as_deref()) {
            Ok(child) => child,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                return;
            }
        };

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let (stdout_tx, stderr_tx) = (tx.clone(), tx.clone());

        let stdout_task = tokio::spawn(async move {
            if let Some(stream) = stdout.as_mut() {
                pump_chunks(stream, &stdout_tx, |data| StreamEvent::Stdout { data }).await;
            }
        });
        let stderr_task = tokio::spawn(async move {
            if let Some(stream) = stderr.as_mut() {
                pump_chunks(stream, &stderr_tx, |data| StreamEvent::Stderr { data }).await;
            }
        });

        let _ = tokio::join!(stdout_task, stderr_task);

        match child.wait().await {
            Ok(status) => {
                let _ = tx
                    .send(StreamEvent::Exit {
                        exit_code: status.code().unwrap_or(-1),
                    })
                    .await;
            }
            Err(e) => {
                let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
            }
        }
    });

    tokio_stream::wrappers::ReceiverStream::new(rx)
}

async fn pump_chunks<R, F>(stream: &mut R, tx: &tokio::sync::mpsc::Sender<StreamEvent>, make_event: F)
where
    R: tokio::io::AsyncRead + Unpin,
    F: Fn(String) -> StreamEvent,
{
    let mut buf = vec![0u8; STREAM_CHUNK_BYTES];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                if tx.send(make_event(data)).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_collects_stdout() {
        let result = run_exec("echo hello", None, Some(5)).await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn exec_reports_nonzero_exit() {
        let result = run_exec("exit 7", None, Some(5)).await;
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn exec_times_out() {
        let result = run_exec("sleep 5", None, Some(1)).await;
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn exec_stream_emits_exit_event() {
        use tokio_stream::StreamExt;
        let mut stream = run_exec_stream("echo hi".to_string(), None);
        let mut saw_exit = false;
        while let Some(event) = stream.next().await {
            if let StreamEvent::Exit { exit_code } = event {
                assert_eq!(exit_code, 0);
                saw_exit = true;
            }
        }
        assert!(saw_exit);
    }
}
