use super::{ENV_LOCK_PATH, ENV_LOG_LEVEL, ENV_WORKER_ID};
use crate::controller::Ctl;
use crate::pool::PoolShared;
use crate::protocol::{read_frame_async, write_frame_async, MainFrame, WorkerFrame};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::*;

/// The controller's handle on one worker process: a frame writer feeding its stdin and a kill
/// switch for stop timeouts. The child itself lives in its exit-watcher task.
#[derive(Debug)]
pub(crate) struct WorkerLink {
    pub worker_id: usize,
    pub pid: Option<u32>,
    pub writer: mpsc::UnboundedSender<MainFrame>,
    pub kill: mpsc::UnboundedSender<()>,
}

/// Spawns one worker process and the three tasks that service it: the stdin writer, the stdout
/// reader (frames go to the controller), and the exit watcher.
pub(crate) fn spawn_worker(
    shared: &Arc<PoolShared>,
    worker_id: usize,
) -> std::io::Result<WorkerLink> {
    let config = shared.config();
    let ctl = shared.ctl().clone();

    let mut command = Command::new(config.worker_program());
    command
        .envs(config.worker_env())
        .env(ENV_WORKER_ID, worker_id.to_string())
        .env(ENV_LOCK_PATH, shared.lock().path())
        .env(ENV_LOG_LEVEL, config.worker_log_level().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let pid = child.id();

    let stdin = child.stdin.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "worker stdin was not piped")
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "worker stdout was not piped")
    })?;

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<MainFrame>();
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(frame) = writer_rx.recv().await {
            if let Err(err) = write_frame_async(&mut stdin, &frame).await {
                debug!(worker_id, "stopped writing to worker: {err}");
                break;
            }
        }
    });

    let reader_ctl = ctl.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        loop {
            match read_frame_async::<_, WorkerFrame>(&mut reader).await {
                Ok(Some(frame)) => {
                    if reader_ctl
                        .send(Ctl::FromWorker { worker_id, frame })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = reader_ctl.send(Ctl::WorkerGone { worker_id });
                    break;
                }
                Err(err) => {
                    warn!(worker_id, "failed to read a frame from worker: {err}");
                    let _ = reader_ctl.send(Ctl::WorkerGone { worker_id });
                    break;
                }
            }
        }
    });

    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                status = child.wait() => {
                    let clean = status.map(|s| s.success()).unwrap_or(false);
                    let _ = ctl.send(Ctl::WorkerExited { worker_id, clean });
                    break;
                }
                msg = kill_rx.recv() => match msg {
                    Some(()) => {
                        let _ = child.start_kill();
                    }
                    None => {
                        // nobody can ask for a kill anymore; just report the exit
                        let status = child.wait().await;
                        let clean = status.map(|s| s.success()).unwrap_or(false);
                        let _ = ctl.send(Ctl::WorkerExited { worker_id, clean });
                        break;
                    }
                },
            }
        }
    });

    Ok(WorkerLink {
        worker_id,
        pid,
        writer: writer_tx,
        kill: kill_tx,
    })
}
