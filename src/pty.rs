use std::io::{Read, Write};
use std::path::PathBuf;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Output chunks are published to subscribers through a bounded broadcast
/// channel; a subscriber that lags this far behind starts dropping chunks
/// instead of blocking the PTY reader.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;
/// Inbound writes queue here before the blocking writer thread drains them.
pub const INPUT_CHANNEL_CAPACITY: usize = 64;

const READ_BUF_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn shell: {0}")]
    SpawnShell(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("pty broker is closed")]
    Closed,
}

/// Exclusive owner of the child shell and its pseudo-terminal.
///
/// One blocking reader thread publishes every output chunk to a broadcast
/// channel; one blocking writer thread drains the input channel into the PTY.
/// The `closed` token is cancelled when the shell exits on its own or when
/// [`PtyBroker::close`] runs, and is the sole end-of-stream signal observers
/// get.
pub struct PtyBroker {
    pair: Mutex<Option<PtyPair>>,
    child_pid: Option<u32>,
    input_tx: mpsc::Sender<Bytes>,
    output_tx: broadcast::Sender<Bytes>,
    /// Receiver created before the reader thread starts, so the first
    /// subscriber (the recording pump) sees output from the very first byte.
    first_rx: Mutex<Option<broadcast::Receiver<Bytes>>>,
    closed: CancellationToken,
    candidate_home: PathBuf,
}

impl PtyBroker {
    /// Allocate a PTY and spawn `shell` on it.
    ///
    /// The child gets a minimal environment (`TERM=xterm-256color`,
    /// `COLORTERM=truecolor`, `HOME`, `USER`, `PATH`) and its working
    /// directory set to the candidate home. When the engine runs as root the
    /// shell is started under `shell_uid` so the shell user cannot touch the
    /// root-owned recordings; otherwise isolation is skipped with a log note.
    pub fn spawn(shell: &str, shell_uid: u32) -> Result<Self, PtyError> {
        let candidate_home = prepare_candidate_home(shell_uid);

        let uid = shell_uid.to_string();
        let mut cmd = match (is_root(), find_setpriv()) {
            (true, Some(setpriv)) => {
                // portable-pty has no credential hook, so drop privileges by
                // exec'ing through setpriv(1).
                let mut cmd = CommandBuilder::new(setpriv);
                cmd.args([
                    "--reuid",
                    &uid,
                    "--regid",
                    &uid,
                    "--clear-groups",
                    "--",
                    shell,
                ]);
                tracing::info!(uid = shell_uid, home = %candidate_home.display(), "starting shell under isolated uid");
                cmd
            }
            (true, None) => {
                tracing::warn!("setpriv not found, uid isolation skipped; relying on container boundaries");
                CommandBuilder::new(shell)
            }
            (false, _) => {
                tracing::info!("starting shell as current user (not privileged, uid isolation skipped)");
                CommandBuilder::new(shell)
            }
        };

        cmd.env_clear();
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        cmd.env("HOME", &candidate_home);
        cmd.env("USER", format!("candidate-{shell_uid}"));
        cmd.env("PATH", "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin");
        cmd.cwd(&candidate_home);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::OpenPty)?;

        let mut child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnShell)?;
        let child_pid = child.process_id();

        let reader = pair.master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        let (output_tx, first_rx) = broadcast::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        let closed = CancellationToken::new();

        spawn_reader(reader, output_tx.clone(), closed.clone());
        spawn_writer(writer, input_rx);

        // Detached reaper: waits on the child so teardown never has to.
        // Doubles as exit detection when the shell terminates on its own.
        let exit_token = closed.clone();
        tokio::task::spawn_blocking(move || {
            match child.wait() {
                Ok(status) => tracing::debug!(?status, "shell exited"),
                Err(e) => tracing::error!(?e, "error waiting for shell"),
            }
            exit_token.cancel();
        });

        tracing::debug!(pid = ?child_pid, shell, "pty broker started");

        Ok(Self {
            pair: Mutex::new(Some(pair)),
            child_pid,
            input_tx,
            output_tx,
            first_rx: Mutex::new(Some(first_rx)),
            closed,
            candidate_home,
        })
    }

    /// Queue a chunk for the shell. Fails with [`PtyError::Closed`] once the
    /// writer side has shut down.
    pub async fn write(&self, data: Bytes) -> Result<(), PtyError> {
        self.input_tx.send(data).await.map_err(|_| PtyError::Closed)
    }

    /// Subscribe to shell output. The first caller receives chunks from the
    /// moment the shell started; later subscribers see output from the moment
    /// they subscribe. All are subject to the lag bound.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.first_rx
            .lock()
            .take()
            .unwrap_or_else(|| self.output_tx.subscribe())
    }

    /// Token cancelled when the shell has exited or the broker was closed.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Home directory prepared for the candidate shell.
    pub fn candidate_home(&self) -> &std::path::Path {
        &self.candidate_home
    }

    /// PID of the child shell, when the platform reports one.
    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Resize the PTY. Errors once closed.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let guard = self.pair.lock();
        let pair = guard.as_ref().ok_or(PtyError::Closed)?;
        pair.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }

    /// Tear down the broker: mark closed, SIGKILL the child, and release the
    /// PTY. Idempotent; never waits for the child (the detached reaper does).
    pub fn close(&self) {
        let pair = match self.pair.lock().take() {
            Some(p) => p,
            None => return,
        };

        tracing::info!("closing pty broker");
        self.closed.cancel();

        if let Some(pid) = self.child_pid {
            kill_process(pid);
        }

        // Dropping the pair closes the master fd; the reader thread sees
        // EOF/EIO once the child is gone.
        drop(pair);
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    output_tx: broadcast::Sender<Bytes>,
    closed: CancellationToken,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("pty reader: eof");
                    break;
                }
                Ok(n) => {
                    // Ignore send errors: no subscribers yet is normal.
                    let _ = output_tx.send(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    tracing::debug!(?e, "pty reader: error");
                    break;
                }
            }
        }
        closed.cancel();
    });
}

fn spawn_writer(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Bytes>) {
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data) {
                tracing::debug!(?e, "pty writer: error");
                break;
            }
            let _ = writer.flush();
        }
    });
}

/// Create (or fall back for) the candidate home directory.
///
/// Root: `/home/candidate-<uid>` with a `solutions/` subdirectory, owned by
/// the shell UID. Anything else: `/tmp`, since `/home` is not writable.
fn prepare_candidate_home(shell_uid: u32) -> PathBuf {
    let home = PathBuf::from(format!("/home/candidate-{shell_uid}"));
    match std::fs::create_dir_all(home.join("solutions")) {
        Ok(()) => {
            chown_path(&home, shell_uid);
            chown_path(&home.join("solutions"), shell_uid);
            home
        }
        Err(e) => {
            tracing::warn!(error = %e, "could not create candidate home, falling back to /tmp");
            PathBuf::from("/tmp")
        }
    }
}

#[cfg(unix)]
fn chown_path(path: &std::path::Path, uid: u32) {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    let rc = unsafe { libc::chown(cpath.as_ptr(), uid, uid) };
    if rc != 0 {
        tracing::debug!(path = %path.display(), "chown failed");
    }
}

#[cfg(not(unix))]
fn chown_path(_path: &std::path::Path, _uid: u32) {}

/// Locate setpriv(1) for the privilege-dropping exec.
fn find_setpriv() -> Option<&'static str> {
    ["/usr/bin/setpriv", "/bin/setpriv", "/usr/sbin/setpriv", "/sbin/setpriv"]
        .into_iter()
        .find(|p| std::path::Path::new(p).exists())
}

#[cfg(unix)]
fn is_root() -> bool {
    unsafe { libc::getuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

#[cfg(unix)]
fn kill_process(pid: u32) {
    if pid > i32::MAX as u32 {
        tracing::warn!(pid, "pid exceeds i32::MAX, cannot send signal");
        return;
    }
    tracing::debug!(pid, "sending SIGKILL to shell");
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process(_pid: u32) {}
