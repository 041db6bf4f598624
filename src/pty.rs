//! Pseudo-terminal target for the WebSocket front door.
//!
//! Allocates a PTY, spawns an `ssh` client attached to the slave side, and
//! pumps the master side onto plain byte channels for the bridge. PTY reads
//! and writes are blocking system calls, so both pumps run on the blocking
//! pool and never stall the event loop.

use portable_pty::{ChildKiller, CommandBuilder, ExitStatus, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clusters::{AuthMaterial, ConnectionParams};
use crate::error::{GatewayError, GatewayResult};

const READ_BUF_SIZE: usize = 4096;

/// Byte channels onto the PTY master side.
pub struct PtyIo {
    pub from_target: mpsc::Receiver<Vec<u8>>,
    pub to_target: mpsc::Sender<Vec<u8>>,
    pub resize_tx: mpsc::Sender<(u16, u16)>,
}

/// Owns the spawned ssh child for teardown.
pub struct PtyProcess {
    session_id: String,
    killer: Box<dyn ChildKiller + Send + Sync>,
    waiter: JoinHandle<Option<ExitStatus>>,
}

impl PtyProcess {
    /// Kill the child if still running and reap it. Safe to call after the
    /// child already exited; the kill is then a no-op and the wait returns
    /// the recorded status.
    pub async fn terminate(mut self) -> Option<ExitStatus> {
        let _ = self.killer.kill();
        let status = self.waiter.await.ok().flatten();
        debug!(
            "Session {}: ssh child reaped (status {:?})",
            self.session_id, status
        );
        status
    }
}

/// Allocate a PTY and spawn `ssh` against the resolved target.
pub fn spawn_ssh(
    session_id: &str,
    params: &ConnectionParams,
    cols: u16,
    rows: u16,
) -> GatewayResult<(PtyProcess, PtyIo)> {
    let identity_file = match &params.auth {
        AuthMaterial::KeyFile(path) => path.clone(),
        AuthMaterial::Password(_) => {
            // The ssh binary cannot take a password non-interactively.
            return Err(GatewayError::Invalid(
                "password-backed clusters are only reachable through the SSH front door"
                    .to_string(),
            ));
        }
    };

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| GatewayError::Upstream(format!("pty allocation failed: {e}")))?;

    let mut cmd = CommandBuilder::new("ssh");
    cmd.arg("-p");
    cmd.arg(params.port.to_string());
    cmd.arg("-i");
    cmd.arg(&identity_file);
    cmd.arg("-o");
    cmd.arg("BatchMode=yes");
    cmd.arg("-o");
    cmd.arg("StrictHostKeyChecking=accept-new");
    cmd.arg("-o");
    cmd.arg("LogLevel=ERROR");
    cmd.arg(format!("{}@{}", params.user, params.host));
    cmd.env("TERM", "xterm-256color");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| GatewayError::Upstream(format!("failed to spawn ssh: {e}")))?;

    // The parent must drop its slave handle or the master never sees EOF.
    drop(pair.slave);

    let killer = child.clone_killer();
    let sid = session_id.to_string();
    let waiter = tokio::task::spawn_blocking(move || child.wait().ok());

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| GatewayError::Upstream(format!("pty reader unavailable: {e}")))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| GatewayError::Upstream(format!("pty writer unavailable: {e}")))?;

    let (from_target_tx, from_target_rx) = mpsc::channel::<Vec<u8>>(256);
    let (to_target_tx, mut to_target_rx) = mpsc::channel::<Vec<u8>>(64);
    let (resize_tx, mut resize_rx) = mpsc::channel::<(u16, u16)>(8);

    let reader_sid = session_id.to_string();
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match std::io::Read::read(&mut reader, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if from_target_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Session {}: pty read ended: {}", reader_sid, e);
                    break;
                }
            }
        }
    });

    let writer_sid = session_id.to_string();
    tokio::task::spawn_blocking(move || {
        while let Some(bytes) = to_target_rx.blocking_recv() {
            if let Err(e) = std::io::Write::write_all(&mut writer, &bytes)
                .and_then(|_| std::io::Write::flush(&mut writer))
            {
                debug!("Session {}: pty write ended: {}", writer_sid, e);
                break;
            }
        }
    });

    // The master handle lives in the resize task; when the last resize
    // sender drops, the task ends and the PTY file descriptors close.
    let master = pair.master;
    let resize_sid = session_id.to_string();
    tokio::spawn(async move {
        while let Some((cols, rows)) = resize_rx.recv().await {
            if let Err(e) = master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }) {
                warn!("Session {}: pty resize failed: {}", resize_sid, e);
            }
        }
    });

    Ok((
        PtyProcess {
            session_id: sid,
            killer,
            waiter,
        },
        PtyIo {
            from_target: from_target_rx,
            to_target: to_target_tx,
            resize_tx,
        },
    ))
}
