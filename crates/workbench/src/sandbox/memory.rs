//! In-memory sandbox runtime
//!
//! A virtual filesystem plus scripted processes. Every capability call is
//! recorded in a journal so callers can assert on ordering (for example that
//! a file write was issued before a command spawned).

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    check_relative_path, BootOptions, BootedSandbox, ProcessEvent, ProcessHandle, RemoveOptions,
    SandboxEnvironment, SandboxError, SandboxRuntime, ServerReady, SpawnOptions, SpawnedProcess,
};
use crate::terminal::TerminalSize;

const PROCESS_CHANNEL_CAPACITY: usize = 64;
const FIRST_PID: u32 = 1000;

/// One recorded capability call
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    Booted { boot: u64 },
    Shutdown { boot: u64 },
    Spawned { pid: u32, command: String, terminal: TerminalSize },
    Exited { pid: u32, code: i32 },
    Killed { pid: u32 },
    Mkdir { path: String },
    WriteFile { path: String },
    Remove { path: String },
    Input { pid: u32, data: String },
    Resized { pid: u32, size: TerminalSize },
}

/// Scripted behaviour for processes whose command line contains `matcher`
#[derive(Debug, Clone)]
pub struct ProcessScript {
    matcher: String,
    output: Vec<String>,
    exit_code: Option<i32>,
    announce_port: Option<u16>,
    spawn_error: Option<String>,
}

impl ProcessScript {
    /// Matches any command line containing `matcher`. Exits with code 0 by default.
    pub fn new(matcher: impl Into<String>) -> Self {
        Self {
            matcher: matcher.into(),
            output: Vec::new(),
            exit_code: Some(0),
            announce_port: None,
            spawn_error: None,
        }
    }

    /// Emit `chunk` as one output event
    pub fn output(mut self, chunk: impl Into<String>) -> Self {
        self.output.push(chunk.into());
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Keep running after the output has been emitted, until killed
    pub fn stays_alive(mut self) -> Self {
        self.exit_code = None;
        self
    }

    /// Announce a reachable server on `port` after the output
    pub fn announces_server(mut self, port: u16) -> Self {
        self.announce_port = Some(port);
        self
    }

    pub fn fails_to_spawn(mut self, message: impl Into<String>) -> Self {
        self.spawn_error = Some(message.into());
        self
    }
}

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    scripts: Vec<ProcessScript>,
    journal: Vec<JournalEntry>,
    boot_failures: VecDeque<String>,
    boots: u64,
    live_boot: Option<u64>,
    next_pid: u32,
    server_tx: Option<mpsc::UnboundedSender<ServerReady>>,
}

type SharedState = Arc<Mutex<MemoryState>>;

/// Sandbox runtime backed by in-memory state
#[derive(Clone, Default)]
pub struct MemorySandboxRuntime {
    state: SharedState,
}

impl MemorySandboxRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process script. Earlier scripts take precedence.
    pub fn script(&self, script: ProcessScript) {
        self.state.lock().scripts.push(script);
    }

    /// Make the next boot fail with `message`
    pub fn fail_next_boot(&self, message: impl Into<String>) {
        self.state.lock().boot_failures.push_back(message.into());
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// Command lines of every spawned process, in spawn order
    pub fn spawned_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .journal
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::Spawned { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn files(&self) -> BTreeMap<String, String> {
        self.state.lock().files.clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().files.get(&normalize(path)).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().dirs.contains(&normalize(path))
    }

    /// Number of successful boots
    pub fn boots(&self) -> u64 {
        self.state.lock().boots
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().live_boot.is_some()
    }
}

#[async_trait]
impl SandboxRuntime for MemorySandboxRuntime {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn boot(&self, options: &BootOptions) -> Result<BootedSandbox, SandboxError> {
        let mut state = self.state.lock();
        if let Some(message) = state.boot_failures.pop_front() {
            return Err(SandboxError::Boot(message));
        }

        state.boots += 1;
        let boot = state.boots;
        let (server_tx, server_ready) = mpsc::unbounded_channel();
        state.live_boot = Some(boot);
        state.server_tx = Some(server_tx);
        state.files.clear();
        state.dirs.clear();
        if state.next_pid == 0 {
            state.next_pid = FIRST_PID;
        }
        state.journal.push(JournalEntry::Booted { boot });
        log::debug!("Memory sandbox #{} booted in '{}'", boot, options.workdir_name);

        Ok(BootedSandbox {
            environment: Arc::new(MemoryEnvironment {
                state: self.state.clone(),
                boot,
            }),
            server_ready,
        })
    }
}

struct MemoryEnvironment {
    state: SharedState,
    boot: u64,
}

impl MemoryEnvironment {
    fn live_state(&self) -> Result<parking_lot::MutexGuard<'_, MemoryState>, SandboxError> {
        let state = self.state.lock();
        if state.live_boot != Some(self.boot) {
            return Err(SandboxError::TornDown);
        }
        Ok(state)
    }
}

#[async_trait]
impl SandboxEnvironment for MemoryEnvironment {
    async fn spawn(
        &self,
        program: &str,
        args: &[&str],
        options: SpawnOptions,
    ) -> Result<SpawnedProcess, SandboxError> {
        let command = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        let (pid, script) = {
            let mut state = self.live_state()?;
            let script = state
                .scripts
                .iter()
                .find(|script| command.contains(&script.matcher))
                .cloned()
                .unwrap_or_else(|| {
                    // An argument-less shell is the interactive session
                    let script = ProcessScript::new(command.clone());
                    if args.is_empty() {
                        script.stays_alive()
                    } else {
                        script
                    }
                });

            if let Some(message) = &script.spawn_error {
                return Err(SandboxError::Spawn {
                    command,
                    message: message.clone(),
                });
            }

            let pid = state.next_pid;
            state.next_pid += 1;
            state.journal.push(JournalEntry::Spawned {
                pid,
                command: command.clone(),
                terminal: options.terminal,
            });
            (pid, script)
        };

        let (tx, rx) = mpsc::channel(PROCESS_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));
        let handle = MemoryProcessHandle {
            pid,
            state: self.state.clone(),
            tx: tx.clone(),
            exited: exited.clone(),
        };

        let state = self.state.clone();
        let boot = self.boot;
        tokio::spawn(async move {
            // Keeps running when nobody reads its output
            for chunk in script.output {
                let _ = tx.send(ProcessEvent::Output(chunk.into_bytes())).await;
            }

            if let Some(port) = script.announce_port {
                let state = state.lock();
                if let (Some(server_tx), Some(live)) = (&state.server_tx, state.live_boot) {
                    if live == boot {
                        let _ = server_tx.send(ServerReady {
                            port,
                            url: format!("http://localhost:{}", port),
                        });
                    }
                }
            }

            if let Some(code) = script.exit_code {
                if !exited.swap(true, Ordering::SeqCst) {
                    state.lock().journal.push(JournalEntry::Exited { pid, code });
                    let _ = tx.send(ProcessEvent::Exited(Some(code))).await;
                }
            }
        });

        Ok((rx, Box::new(handle)))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        check_relative_path(path)?;
        let path = normalize(path);
        let mut state = self.live_state()?;

        if recursive {
            let mut current = String::new();
            for segment in path.split('/') {
                if !current.is_empty() {
                    current.push('/');
                }
                current.push_str(segment);
                if state.files.contains_key(&current) {
                    return Err(fs_error(&current, "not a directory"));
                }
                state.dirs.insert(current.clone());
            }
        } else {
            if state.dirs.contains(&path) {
                return Err(fs_error(&path, "already exists"));
            }
            if !parent_exists(&state, &path) {
                return Err(fs_error(&path, "parent directory does not exist"));
            }
            state.dirs.insert(path.clone());
        }

        state.journal.push(JournalEntry::Mkdir { path });
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        check_relative_path(path)?;
        let path = normalize(path);
        let mut state = self.live_state()?;

        if !parent_exists(&state, &path) {
            return Err(fs_error(&path, "parent directory does not exist"));
        }
        if state.dirs.contains(&path) {
            return Err(fs_error(&path, "is a directory"));
        }

        state.files.insert(path.clone(), content.to_string());
        state.journal.push(JournalEntry::WriteFile { path });
        Ok(())
    }

    async fn remove(&self, path: &str, options: RemoveOptions) -> Result<(), SandboxError> {
        check_relative_path(path)?;
        let path = normalize(path);
        let mut state = self.live_state()?;

        if state.files.remove(&path).is_none() {
            if state.dirs.contains(&path) {
                let prefix = format!("{}/", path);
                let has_children = state.files.keys().any(|p| p.starts_with(&prefix))
                    || state.dirs.iter().any(|d| d.starts_with(&prefix));
                if has_children && !options.recursive {
                    return Err(fs_error(&path, "directory not empty"));
                }
                state.files.retain(|p, _| !p.starts_with(&prefix));
                state.dirs.retain(|d| d != &path && !d.starts_with(&prefix));
            } else if !options.force {
                return Err(fs_error(&path, "no such file or directory"));
            }
        }

        state.journal.push(JournalEntry::Remove { path });
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), SandboxError> {
        let mut state = self.live_state()?;
        state.live_boot = None;
        state.server_tx = None;
        state.journal.push(JournalEntry::Shutdown { boot: self.boot });
        Ok(())
    }
}

struct MemoryProcessHandle {
    pid: u32,
    state: SharedState,
    tx: mpsc::Sender<ProcessEvent>,
    exited: Arc<AtomicBool>,
}

impl MemoryProcessHandle {
    fn ensure_running(&self) -> Result<(), String> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(format!("Process {} has exited", self.pid));
        }
        Ok(())
    }
}

impl ProcessHandle for MemoryProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn write_input(&self, data: &[u8]) -> Result<(), String> {
        self.ensure_running()?;
        self.state.lock().journal.push(JournalEntry::Input {
            pid: self.pid,
            data: String::from_utf8_lossy(data).into_owned(),
        });
        Ok(())
    }

    fn resize(&self, size: TerminalSize) -> Result<(), String> {
        self.ensure_running()?;
        self.state
            .lock()
            .journal
            .push(JournalEntry::Resized { pid: self.pid, size });
        Ok(())
    }

    fn kill(&self) -> Result<(), String> {
        if self.exited.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state
            .lock()
            .journal
            .push(JournalEntry::Killed { pid: self.pid });
        let _ = self.tx.try_send(ProcessEvent::Exited(None));
        Ok(())
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").trim_end_matches('/').to_string()
}

fn parent_exists(state: &MemoryState, path: &str) -> bool {
    match path.rsplit_once('/') {
        Some((parent, _)) => state.dirs.contains(parent),
        None => true,
    }
}

fn fs_error(path: &str, message: &str) -> SandboxError {
    SandboxError::Filesystem {
        path: path.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn boot(runtime: &MemorySandboxRuntime) -> BootedSandbox {
        runtime.boot(&BootOptions::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_requires_parent() {
        let runtime = MemorySandboxRuntime::new();
        let env = boot(&runtime).await.environment;

        assert!(env.write_file("src/a.js", "x").await.is_err());
        env.mkdir("src", true).await.unwrap();
        env.write_file("src/a.js", "x").await.unwrap();
        env.mkdir("src", true).await.unwrap();

        assert_eq!(runtime.file("src/a.js").as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_remove_options() {
        let runtime = MemorySandboxRuntime::new();
        let env = boot(&runtime).await.environment;
        env.mkdir("a/b", true).await.unwrap();
        env.write_file("a/b/c.txt", "x").await.unwrap();

        assert!(env.remove("a", RemoveOptions::default()).await.is_err());
        assert!(env.remove("missing", RemoveOptions::default()).await.is_err());
        let force = RemoveOptions {
            force: true,
            recursive: true,
        };
        env.remove("missing", force).await.unwrap();
        env.remove("a", force).await.unwrap();

        assert!(runtime.files().is_empty());
        assert!(!runtime.has_dir("a/b"));
    }

    #[tokio::test]
    async fn test_scripted_process_output_then_exit() {
        let runtime = MemorySandboxRuntime::new();
        runtime.script(ProcessScript::new("npm install").output("added 1 package\n"));
        let env = boot(&runtime).await.environment;

        let (mut rx, _handle) = env
            .spawn("sh", &["-c", "npm install"], SpawnOptions::default())
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ProcessEvent::Output(b"added 1 package\n".to_vec()))
        );
        assert_eq!(rx.recv().await, Some(ProcessEvent::Exited(Some(0))));
    }

    #[tokio::test]
    async fn test_kill_long_running_process() {
        let runtime = MemorySandboxRuntime::new();
        runtime.script(ProcessScript::new("npm run dev").stays_alive().announces_server(5173));
        let mut booted = boot(&runtime).await;

        let (mut rx, handle) = booted
            .environment
            .spawn("sh", &["-c", "npm run dev"], SpawnOptions::default())
            .await
            .unwrap();
        let ready = booted.server_ready.recv().await.unwrap();
        assert_eq!(ready.url, "http://localhost:5173");

        handle.kill().unwrap();
        assert_eq!(rx.recv().await, Some(ProcessEvent::Exited(None)));
        assert!(handle.write_input(b"q").is_err());
        assert!(runtime
            .journal()
            .contains(&JournalEntry::Killed { pid: handle.pid() }));
    }

    #[tokio::test]
    async fn test_shutdown_invalidates_environment() {
        let runtime = MemorySandboxRuntime::new();
        let env = boot(&runtime).await.environment;
        env.shutdown().await.unwrap();

        assert_eq!(env.mkdir("x", true).await, Err(SandboxError::TornDown));
        assert!(!runtime.is_live());
    }

    #[tokio::test]
    async fn test_boot_failure_is_reported_once() {
        let runtime = MemorySandboxRuntime::new();
        runtime.fail_next_boot("no network");

        assert!(matches!(
            runtime.boot(&BootOptions::default()).await,
            Err(SandboxError::Boot(_))
        ));
        assert!(runtime.boot(&BootOptions::default()).await.is_ok());
        assert_eq!(runtime.boots(), 1);
    }
}
