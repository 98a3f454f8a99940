//! Host-directory sandbox runtime
//!
//! Runs processes with `tokio::process` inside a work directory on the host.
//! There is no isolation beyond the path checks on filesystem calls; it exists
//! so recorded generations can be replayed against a real toolchain.
//!
//! A dev server counts as reachable once its output mentions a local URL such
//! as `http://localhost:5173`.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    check_relative_path, BootOptions, BootedSandbox, ProcessEvent, ProcessHandle, RemoveOptions,
    SandboxEnvironment, SandboxError, SandboxRuntime, ServerReady, SpawnOptions, SpawnedProcess,
};
use crate::terminal::TerminalSize;

const READ_CHUNK: usize = 4096;
const PROCESS_CHANNEL_CAPACITY: usize = 256;

static LOCAL_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1\]):(\d{2,5})")
        .expect("valid local URL pattern")
});

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ANSI pattern"));

/// Sandbox runtime rooted in a host directory
pub struct LocalSandboxRuntime {
    root: PathBuf,
}

impl LocalSandboxRuntime {
    /// Environments are created under `root/<workdir name>`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SandboxRuntime for LocalSandboxRuntime {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn boot(&self, options: &BootOptions) -> Result<BootedSandbox, SandboxError> {
        check_relative_path(&options.workdir_name)?;
        let workdir = self.root.join(&options.workdir_name);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| SandboxError::Boot(format!("{}: {}", workdir.display(), e)))?;

        log::info!("[sandbox] Local environment ready at {}", workdir.display());

        let (server_tx, server_ready) = mpsc::unbounded_channel();
        Ok(BootedSandbox {
            environment: Arc::new(LocalEnvironment {
                workdir,
                live: AtomicBool::new(true),
                announcer: Mutex::new(Some(ServerAnnouncer::new(server_tx))),
            }),
            server_ready,
        })
    }
}

struct LocalEnvironment {
    workdir: PathBuf,
    live: AtomicBool,
    announcer: Mutex<Option<ServerAnnouncer>>,
}

impl LocalEnvironment {
    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        if !self.live.load(Ordering::SeqCst) {
            return Err(SandboxError::TornDown);
        }
        check_relative_path(path)?;
        Ok(self.workdir.join(path))
    }
}

#[async_trait]
impl SandboxEnvironment for LocalEnvironment {
    async fn spawn(
        &self,
        program: &str,
        args: &[&str],
        options: SpawnOptions,
    ) -> Result<SpawnedProcess, SandboxError> {
        if !self.live.load(Ordering::SeqCst) {
            return Err(SandboxError::TornDown);
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.workdir)
            .env("COLUMNS", options.terminal.cols.to_string())
            .env("LINES", options.terminal.rows.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Each process leads its own group so a kill reaches everything it started
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Spawn {
                command: program.to_string(),
                message: e.to_string(),
            })?;

        let pid = child.id().unwrap_or(0);
        log::debug!("[sandbox] Spawned {} {:?} (pid {})", program, args, pid);

        let (tx, rx) = mpsc::channel(PROCESS_CHANNEL_CAPACITY);
        let announcer = self.announcer.lock().clone();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone(), announcer.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx.clone(), announcer));
        }
        let mut stdin = child.stdin.take();

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut control_open = true;
            let status = loop {
                let message = tokio::select! {
                    status = child.wait() => break status,
                    message = control_rx.recv(), if control_open => message,
                };
                match message {
                    Some(Control::Input(data)) => {
                        if let Some(stdin) = stdin.as_mut() {
                            if let Err(e) = stdin.write_all(&data).await {
                                let _ = tx.send(ProcessEvent::Error(e.to_string())).await;
                            }
                        }
                    }
                    Some(Control::Kill) => {
                        if let Err(e) = child.start_kill() {
                            log::debug!("[sandbox] Failed to kill pid {}: {}", pid, e);
                        }
                    }
                    None => control_open = false,
                }
            };

            // Deliver all output before the exit event
            for reader in readers {
                let _ = reader.await;
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    let _ = tx.send(ProcessEvent::Error(e.to_string())).await;
                    None
                }
            };
            log::debug!("[sandbox] pid {} exited with {:?}", pid, code);
            let _ = tx.send(ProcessEvent::Exited(code)).await;
        });

        Ok((rx, Box::new(LocalProcessHandle { pid, control: control_tx })))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let target = self.resolve(path)?;
        let result = if recursive {
            tokio::fs::create_dir_all(&target).await
        } else {
            tokio::fs::create_dir(&target).await
        };
        result.map_err(|e| fs_error(path, e))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let target = self.resolve(path)?;
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| fs_error(path, e))
    }

    async fn remove(&self, path: &str, options: RemoveOptions) -> Result<(), SandboxError> {
        let target = self.resolve(path)?;
        let metadata = match tokio::fs::symlink_metadata(&target).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound && options.force => return Ok(()),
            Err(e) => return Err(fs_error(path, e)),
        };

        let result = if metadata.is_dir() {
            remove_dir(&target, options.recursive).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        result.map_err(|e| fs_error(path, e))
    }

    async fn shutdown(&self) -> Result<(), SandboxError> {
        if !self.live.swap(false, Ordering::SeqCst) {
            return Err(SandboxError::TornDown);
        }
        self.announcer.lock().take();
        log::info!("[sandbox] Local environment at {} released", self.workdir.display());
        Ok(())
    }
}

async fn remove_dir(target: &Path, recursive: bool) -> std::io::Result<()> {
    if recursive {
        tokio::fs::remove_dir_all(target).await
    } else {
        tokio::fs::remove_dir(target).await
    }
}

fn fs_error(path: &str, error: std::io::Error) -> SandboxError {
    SandboxError::Filesystem {
        path: path.to_string(),
        message: error.to_string(),
    }
}

enum Control {
    Input(Vec<u8>),
    Kill,
}

struct LocalProcessHandle {
    pid: u32,
    control: mpsc::UnboundedSender<Control>,
}

impl ProcessHandle for LocalProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn write_input(&self, data: &[u8]) -> Result<(), String> {
        self.control
            .send(Control::Input(data.to_vec()))
            .map_err(|_| format!("Process {} has exited", self.pid))
    }

    fn resize(&self, size: TerminalSize) -> Result<(), String> {
        // Pipes carry no window size
        log::debug!(
            "[sandbox] Ignoring resize of pid {} to {}x{}",
            self.pid,
            size.cols,
            size.rows
        );
        Ok(())
    }

    fn kill(&self) -> Result<(), String> {
        kill_process_group(self.pid)?;
        // A closed channel means the process already exited
        let _ = self.control.send(Control::Kill);
        Ok(())
    }
}

/// Signal every process in the group led by `pid`
#[cfg(unix)]
fn kill_process_group(pid: u32) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid).map_err(|_| format!("Invalid process group {}", pid))?;
    if pgid <= 0 {
        return Ok(());
    }
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(format!("Failed to kill process group {}: {}", pgid, e)),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> Result<(), String> {
    Ok(())
}

/// Reports each local port at most once per environment
#[derive(Clone)]
struct ServerAnnouncer {
    tx: mpsc::UnboundedSender<ServerReady>,
    seen: Arc<Mutex<HashSet<u16>>>,
}

impl ServerAnnouncer {
    fn new(tx: mpsc::UnboundedSender<ServerReady>) -> Self {
        Self {
            tx,
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn scan(&self, chunk: &[u8]) {
        for ready in find_local_urls(&String::from_utf8_lossy(chunk)) {
            if self.seen.lock().insert(ready.port) {
                log::info!("[sandbox] Server ready at {}", ready.url);
                let _ = self.tx.send(ready);
            }
        }
    }
}

/// Local server URLs mentioned in a chunk of process output
fn find_local_urls(text: &str) -> Vec<ServerReady> {
    let plain = ANSI_ESCAPE.replace_all(text, "");
    LOCAL_URL
        .captures_iter(&plain)
        .filter_map(|caps| {
            let port = caps.get(1)?.as_str().parse().ok()?;
            Some(ServerReady {
                port,
                url: caps.get(0)?.as_str().to_string(),
            })
        })
        .collect()
}

fn spawn_reader<R>(
    mut reader: R,
    tx: mpsc::Sender<ProcessEvent>,
    announcer: Option<ServerAnnouncer>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    if let Some(announcer) = &announcer {
                        announcer.scan(&chunk);
                    }
                    if tx.send(ProcessEvent::Output(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ProcessEvent::Error(e.to_string())).await;
                    break;
                }
            }
        }
    })
}
