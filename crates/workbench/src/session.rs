//! Sandbox session manager
//!
//! Owns the lifecycle of the single live sandbox environment:
//!
//! ```text
//! unbooted --boot--> booting --ok--> ready
//!                       \--err--> unbooted
//! ready --teardown--> unbooted
//! ready --rebuild--> (teardown) --> booting --> ready
//! ```
//!
//! Lifecycle transitions are serialized by an async mutex. The live session
//! itself sits behind a synchronous lock that is only held to read or swap
//! handles, never across an `.await`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::dispatcher::FsWriteQueue;
use crate::error::SessionError;
use crate::output::OutputMultiplexer;
use crate::sandbox::{
    BootOptions, ProcessHandle, RemoveOptions, SandboxEnvironment, SandboxRuntime, SpawnOptions,
};
use crate::store::{SandboxStatus, SessionStore};
use crate::terminal::{TerminalSink, TerminalSize};

const SHELL_START_FAILED: &[u8] = b"\r\nFailed to start shell\r\n";

/// A process owned by the session: the dev server in the foreground slot, or
/// the interactive shell
pub struct ForegroundProcess {
    command: String,
    handle: Box<dyn ProcessHandle>,
    pump: Option<JoinHandle<Option<i32>>>,
}

impl ForegroundProcess {
    pub fn new(
        command: impl Into<String>,
        handle: Box<dyn ProcessHandle>,
        pump: Option<JoinHandle<Option<i32>>>,
    ) -> Self {
        Self {
            command: command.into(),
            handle,
            pump,
        }
    }

    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    fn terminate(self) {
        log::info!("Killing `{}` (pid {})", self.command, self.handle.pid());
        if let Err(e) = self.handle.kill() {
            log::warn!("Failed to kill pid {}: {}", self.handle.pid(), e);
        }
        if let Some(pump) = self.pump {
            pump.abort();
        }
    }
}

struct LiveSession {
    id: Uuid,
    environment: Arc<dyn SandboxEnvironment>,
    writer: FsWriteQueue,
    foreground: Option<ForegroundProcess>,
    shell: Option<ForegroundProcess>,
    server_watcher: JoinHandle<()>,
}

pub struct SandboxSessionManager {
    runtime: Arc<dyn SandboxRuntime>,
    store: Arc<SessionStore>,
    multiplexer: OutputMultiplexer,
    config: SandboxConfig,
    lifecycle: tokio::sync::Mutex<()>,
    live: Mutex<Option<LiveSession>>,
}

impl SandboxSessionManager {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<SessionStore>,
        multiplexer: OutputMultiplexer,
        config: SandboxConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            multiplexer,
            config,
            lifecycle: tokio::sync::Mutex::new(()),
            live: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Boot the sandbox. A no-op when a session is already live.
    pub async fn boot(&self) -> Result<(), SessionError> {
        let _guard = self.lifecycle.lock().await;
        if self.live.lock().is_some() {
            return Ok(());
        }
        self.boot_locked().await
    }

    /// Tear down the live session (if any) and return to `unbooted`
    pub async fn teardown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.teardown_locked().await;
    }

    /// Tear down the live session, then boot a fresh one
    pub async fn rebuild(&self) -> Result<(), SessionError> {
        let _guard = self.lifecycle.lock().await;
        log::info!("Rebuilding sandbox");
        self.teardown_locked().await;
        self.boot_locked().await
    }

    /// Reset per-generation state while keeping the sandbox and shell alive.
    ///
    /// Kills the foreground process, removes every tracked file from the
    /// sandbox, wipes the store and resets the terminal. Returns the new
    /// generation.
    pub async fn clear(&self) -> u64 {
        let _guard = self.lifecycle.lock().await;

        let (foreground, environment, writer) = {
            let mut live = self.live.lock();
            match live.as_mut() {
                Some(session) => (
                    session.foreground.take(),
                    Some(session.environment.clone()),
                    Some(session.writer.clone()),
                ),
                None => (None, None, None),
            }
        };

        if let Some(process) = foreground {
            process.terminate();
        }
        if let Some(writer) = &writer {
            writer.flush().await;
        }

        let (generation, removed) = self.store.reset_for_new_generation();
        if let Some(environment) = environment {
            remove_tracked_files(environment.as_ref(), &removed).await;
        }
        if let Some(terminal) = self.store.terminal() {
            terminal.reset();
        }

        log::info!("Session cleared (generation {})", generation);
        generation
    }

    async fn boot_locked(&self) -> Result<(), SessionError> {
        self.store.set_status(SandboxStatus::Booting);
        log::info!("Booting {} sandbox", self.runtime.name());

        let options = BootOptions {
            workdir_name: self.config.workdir_name.clone(),
        };
        let booted = match self.runtime.boot(&options).await {
            Ok(booted) => booted,
            Err(e) => {
                log::error!("Sandbox boot failed: {}", e);
                *self.live.lock() = None;
                self.store.set_status(SandboxStatus::Unbooted);
                return Err(SessionError::BootFailed(e));
            }
        };

        let store = self.store.clone();
        let mut server_ready = booted.server_ready;
        let server_watcher = tokio::spawn(async move {
            while let Some(ready) = server_ready.recv().await {
                log::info!("Server ready on port {}: {}", ready.port, ready.url);
                store.set_server_url(&ready.url);
            }
        });

        let stale = self.store.reset_for_boot();
        if !stale.is_empty() {
            log::debug!("Dropped {} files recorded before boot", stale.len());
        }

        let id = Uuid::new_v4();
        *self.live.lock() = Some(LiveSession {
            id,
            writer: FsWriteQueue::new(booted.environment.clone()),
            environment: booted.environment,
            foreground: None,
            shell: None,
            server_watcher,
        });
        self.store.set_status(SandboxStatus::Ready);
        log::info!("Sandbox session {} ready", id);

        if self.store.terminal().is_some() {
            self.start_shell().await;
        }
        Ok(())
    }

    async fn teardown_locked(&self) {
        let Some(session) = self.live.lock().take() else {
            self.store.set_status(SandboxStatus::Unbooted);
            return;
        };
        log::info!("Tearing down sandbox session {}", session.id);

        if let Some(process) = session.foreground {
            process.terminate();
        }
        if let Some(shell) = session.shell {
            shell.terminate();
        }

        session.writer.flush().await;
        let (_, removed) = self.store.reset_for_new_generation();
        remove_tracked_files(session.environment.as_ref(), &removed).await;

        if let Err(e) = session.environment.shutdown().await {
            log::warn!("Sandbox shutdown failed: {}", e);
        }
        session.server_watcher.abort();
        self.store.set_status(SandboxStatus::Unbooted);
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    pub fn is_ready(&self) -> bool {
        self.live.lock().is_some()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.live.lock().as_ref().map(|session| session.id)
    }

    pub fn environment(&self) -> Option<Arc<dyn SandboxEnvironment>> {
        self.live
            .lock()
            .as_ref()
            .map(|session| session.environment.clone())
    }

    pub fn writer(&self) -> Option<FsWriteQueue> {
        self.live.lock().as_ref().map(|session| session.writer.clone())
    }

    /// Pid of the process in the foreground slot
    pub fn foreground_pid(&self) -> Option<u32> {
        self.live
            .lock()
            .as_ref()
            .and_then(|session| session.foreground.as_ref())
            .map(ForegroundProcess::pid)
    }

    /// Put a long-running process in the foreground slot, killing whatever
    /// was there. Without a live session the process is killed immediately.
    pub fn replace_foreground(&self, process: ForegroundProcess) {
        let previous = {
            let mut live = self.live.lock();
            match live.as_mut() {
                Some(session) => session.foreground.replace(process),
                None => Some(process),
            }
        };
        if let Some(previous) = previous {
            previous.terminate();
        }
    }

    /// Put a process in the foreground slot only if the slot is empty.
    ///
    /// Returns the process back when the slot is occupied.
    pub fn occupy_foreground_if_vacant(
        &self,
        process: ForegroundProcess,
    ) -> Option<ForegroundProcess> {
        let mut live = self.live.lock();
        match live.as_mut() {
            Some(session) if session.foreground.is_none() => {
                session.foreground = Some(process);
                None
            }
            _ => Some(process),
        }
    }

    /// Clear the foreground slot if it still holds `pid`
    pub fn release_foreground(&self, pid: u32) -> Option<ForegroundProcess> {
        let mut live = self.live.lock();
        let session = live.as_mut()?;
        if session.foreground.as_ref().map(ForegroundProcess::pid) == Some(pid) {
            session.foreground.take()
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Terminal and interactive shell
    // ------------------------------------------------------------------

    /// Route output to `terminal` and start the interactive shell if the
    /// sandbox is ready. A running shell is resized to the new terminal.
    pub async fn attach_terminal(&self, terminal: Arc<dyn TerminalSink>) {
        self.store.attach_terminal(&terminal);

        let has_shell = {
            let live = self.live.lock();
            match live.as_ref() {
                Some(session) => session.shell.is_some(),
                None => return,
            }
        };
        if has_shell {
            self.resize_terminal(terminal.size());
        } else {
            self.start_shell().await;
        }
    }

    /// Stop routing output and stop the interactive shell
    pub fn detach_terminal(&self) {
        self.store.detach_terminal();
        let shell = self
            .live
            .lock()
            .as_mut()
            .and_then(|session| session.shell.take());
        if let Some(shell) = shell {
            shell.terminate();
        }
    }

    /// Forward terminal input to the interactive shell
    pub fn send_input(&self, data: &[u8]) -> Result<(), SessionError> {
        let live = self.live.lock();
        let session = live.as_ref().ok_or(SessionError::NotReady)?;
        let shell = session.shell.as_ref().ok_or(SessionError::NoShell)?;
        shell.handle.write_input(data).map_err(SessionError::Process)
    }

    /// Forward a terminal resize to the shell and the foreground process
    pub fn resize_terminal(&self, size: TerminalSize) {
        let live = self.live.lock();
        let Some(session) = live.as_ref() else {
            return;
        };
        for process in session.shell.iter().chain(session.foreground.iter()) {
            if let Err(e) = process.handle.resize(size) {
                log::debug!("Resize of pid {} failed: {}", process.pid(), e);
            }
        }
    }

    async fn start_shell(&self) {
        let Some((id, environment)) = self
            .live
            .lock()
            .as_ref()
            .map(|session| (session.id, session.environment.clone()))
        else {
            return;
        };
        let terminal = self.store.terminal();
        let size = terminal
            .as_ref()
            .map(|terminal| terminal.size())
            .unwrap_or(self.config.default_terminal);

        let (rx, handle) = match environment
            .spawn(&self.config.shell, &[], SpawnOptions { terminal: size })
            .await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                log::error!("Failed to start interactive shell: {}", e);
                if let Some(terminal) = terminal {
                    terminal.write(SHELL_START_FAILED);
                }
                return;
            }
        };

        let pump = self.multiplexer.spawn_pump(rx, self.store.terminal_weak());
        let shell = ForegroundProcess::new(self.config.shell.clone(), handle, Some(pump));

        let stale = {
            let mut live = self.live.lock();
            match live.as_mut() {
                Some(session) if session.id == id => session.shell.replace(shell),
                _ => Some(shell),
            }
        };
        if let Some(stale) = stale {
            stale.terminate();
        }
    }
}

async fn remove_tracked_files(environment: &dyn SandboxEnvironment, paths: &[String]) {
    let options = RemoveOptions {
        force: true,
        recursive: true,
    };
    for path in paths {
        if let Err(e) = environment.remove(path, options).await {
            log::warn!("Failed to remove {}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::classifier::RuleClassifier;
    use crate::dispatcher::write_with_parents;
    use crate::sandbox::memory::{JournalEntry, MemorySandboxRuntime, ProcessScript};
    use crate::terminal::VecTerminal;

    fn manager(runtime: &MemorySandboxRuntime) -> (SandboxSessionManager, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::new());
        let multiplexer =
            OutputMultiplexer::new(store.clone(), Arc::new(RuleClassifier::default()));
        let manager = SandboxSessionManager::new(
            Arc::new(runtime.clone()),
            store.clone(),
            multiplexer,
            SandboxConfig::default(),
        );
        (manager, store)
    }

    async fn spawn_dev_server(manager: &SandboxSessionManager) -> u32 {
        let environment = manager.environment().unwrap();
        let (_rx, handle) = environment
            .spawn("sh", &["-c", "npm run dev"], SpawnOptions::default())
            .await
            .unwrap();
        let pid = handle.pid();
        manager.replace_foreground(ForegroundProcess::new("npm run dev", handle, None));
        pid
    }

    #[tokio::test]
    async fn test_boot_is_idempotent() {
        let runtime = MemorySandboxRuntime::new();
        let (manager, store) = manager(&runtime);

        manager.boot().await.unwrap();
        let id = manager.session_id();
        manager.boot().await.unwrap();

        assert_eq!(store.status(), SandboxStatus::Ready);
        assert_eq!(runtime.boots(), 1);
        assert_eq!(manager.session_id(), id);
    }

    #[tokio::test]
    async fn test_boot_failure_returns_to_unbooted() {
        let runtime = MemorySandboxRuntime::new();
        runtime.fail_next_boot("offline");
        let (manager, store) = manager(&runtime);

        let result = manager.boot().await;

        assert!(matches!(result, Err(SessionError::BootFailed(_))));
        assert_eq!(store.status(), SandboxStatus::Unbooted);
        assert!(manager.environment().is_none());

        manager.boot().await.unwrap();
        assert_eq!(store.status(), SandboxStatus::Ready);
    }

    #[tokio::test]
    async fn test_rebuild_kills_foreground_before_new_boot() {
        let runtime = MemorySandboxRuntime::new();
        runtime.script(ProcessScript::new("npm run dev").stays_alive());
        let (manager, store) = manager(&runtime);
        manager.boot().await.unwrap();

        let pid = spawn_dev_server(&manager).await;
        store.upsert_file("a.txt", "hello");
        write_with_parents(manager.environment().unwrap().as_ref(), "a.txt", "hello")
            .await
            .unwrap();

        manager.rebuild().await.unwrap();

        let journal = runtime.journal();
        let killed = journal
            .iter()
            .position(|e| *e == JournalEntry::Killed { pid })
            .unwrap();
        let removed = journal
            .iter()
            .position(|e| *e == JournalEntry::Remove { path: "a.txt".to_string() })
            .unwrap();
        let second_boot = journal
            .iter()
            .position(|e| *e == JournalEntry::Booted { boot: 2 })
            .unwrap();
        assert!(killed < removed && removed < second_boot);

        assert!(store.files().is_empty());
        assert_eq!(store.status(), SandboxStatus::Ready);
        assert_eq!(manager.foreground_pid(), None);
    }

    #[tokio::test]
    async fn test_boot_starts_with_empty_tables() {
        let runtime = MemorySandboxRuntime::new();
        let (manager, store) = manager(&runtime);
        store.upsert_file("pre.txt", "x");

        manager.boot().await.unwrap();

        assert!(store.files().is_empty());
        assert!(store.build_errors().is_empty());
        assert_eq!(store.generation(), 0);
        assert_eq!(runtime.file("pre.txt"), None);
    }

    #[tokio::test]
    async fn test_clear_keeps_sandbox_alive() {
        let runtime = MemorySandboxRuntime::new();
        runtime.script(ProcessScript::new("npm run dev").stays_alive());
        let (manager, store) = manager(&runtime);
        let terminal = Arc::new(VecTerminal::new());
        manager.attach_terminal(terminal.clone()).await;
        manager.boot().await.unwrap();
        let id = manager.session_id();

        let pid = spawn_dev_server(&manager).await;
        store.upsert_file("src/a.txt", "x");
        let writer = manager.writer().unwrap();
        writer.enqueue("src/a.txt", "x");
        store.set_server_url("http://localhost:5173");

        let generation = manager.clear().await;

        assert_eq!(generation, 1);
        assert!(runtime.journal().contains(&JournalEntry::Killed { pid }));
        assert_eq!(runtime.file("src/a.txt"), None);
        assert!(store.files().is_empty());
        assert_eq!(store.server_url(), None);
        assert_eq!(manager.session_id(), id);
        assert!(terminal.bytes().ends_with(b"\x1bc"));
    }

    #[tokio::test]
    async fn test_server_ready_is_recorded() {
        let runtime = MemorySandboxRuntime::new();
        runtime.script(
            ProcessScript::new("npm run dev")
                .output("VITE ready\n")
                .stays_alive()
                .announces_server(5173),
        );
        let (manager, store) = manager(&runtime);
        manager.boot().await.unwrap();
        spawn_dev_server(&manager).await;

        let url = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(url) = store.server_url() {
                    break url;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(url, "http://localhost:5173");
    }

    #[tokio::test]
    async fn test_terminal_starts_shell_and_forwards_io() {
        let runtime = MemorySandboxRuntime::new();
        let (manager, _store) = manager(&runtime);
        let terminal = Arc::new(VecTerminal::with_size(TerminalSize::new(100, 40)));
        manager.boot().await.unwrap();

        assert!(matches!(manager.send_input(b"ls\n"), Err(SessionError::NoShell)));
        manager.attach_terminal(terminal.clone()).await;
        manager.send_input(b"ls\n").unwrap();
        manager.resize_terminal(TerminalSize::new(120, 40));

        let journal = runtime.journal();
        let shell_pid = journal
            .iter()
            .find_map(|entry| match entry {
                JournalEntry::Spawned { pid, command, terminal } if command == "sh" => {
                    assert_eq!(*terminal, TerminalSize::new(100, 40));
                    Some(*pid)
                }
                _ => None,
            })
            .unwrap();
        assert!(journal.contains(&JournalEntry::Input {
            pid: shell_pid,
            data: "ls\n".to_string()
        }));
        assert!(journal.contains(&JournalEntry::Resized {
            pid: shell_pid,
            size: TerminalSize::new(120, 40)
        }));
    }

    #[tokio::test]
    async fn test_shell_spawn_failure_is_reported_to_terminal() {
        let runtime = MemorySandboxRuntime::new();
        runtime.script(ProcessScript::new("sh").fails_to_spawn("no such program"));
        let (manager, _store) = manager(&runtime);
        let terminal = Arc::new(VecTerminal::new());
        manager.boot().await.unwrap();

        manager.attach_terminal(terminal.clone()).await;

        assert_eq!(terminal.contents(), "\r\nFailed to start shell\r\n");
    }

    #[tokio::test]
    async fn test_teardown_shuts_environment_down() {
        let runtime = MemorySandboxRuntime::new();
        let (manager, store) = manager(&runtime);
        manager.boot().await.unwrap();
        let environment = manager.environment().unwrap();

        manager.teardown().await;

        assert_eq!(store.status(), SandboxStatus::Unbooted);
        assert!(!runtime.is_live());
        assert!(environment.mkdir("x", true).await.is_err());
    }
}
