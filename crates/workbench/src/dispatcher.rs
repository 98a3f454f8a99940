//! Action dispatcher
//!
//! Applies extracted actions to the current session:
//! - `FileWrite` updates the file table immediately and queues the sandbox
//!   write on the session's [`FsWriteQueue`]
//! - `ShellCommand` waits for queued writes to land, then runs
//!   `<shell> -c <command>` sized to the attached terminal
//!
//! Every dispatched action carries the generation it was produced in. Actions
//! from a generation that has since been cleared are discarded.

use std::sync::Arc;

use action_parser::Action;
use tokio::sync::{mpsc, oneshot};

use crate::config::{CommandConfig, SandboxConfig};
use crate::output::OutputMultiplexer;
use crate::sandbox::{SandboxEnvironment, SandboxError, SpawnOptions};
use crate::session::{ForegroundProcess, SandboxSessionManager};
use crate::store::{ActionOutcome, SessionStore};

enum WriteRequest {
    Write { path: String, content: String },
    Flush(oneshot::Sender<()>),
}

/// Ordered queue of sandbox file writes served by a single task.
///
/// Writes are applied in enqueue order; [`flush`](Self::flush) resolves once
/// every write enqueued before it has been issued.
#[derive(Clone)]
pub struct FsWriteQueue {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl FsWriteQueue {
    pub fn new(environment: Arc<dyn SandboxEnvironment>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    WriteRequest::Write { path, content } => {
                        if let Err(e) =
                            write_with_parents(environment.as_ref(), &path, &content).await
                        {
                            log::warn!("Failed to write {} to sandbox: {}", path, e);
                        }
                    }
                    WriteRequest::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Queue a write. Returns `false` if the queue has shut down.
    pub fn enqueue(&self, path: &str, content: &str) -> bool {
        self.tx
            .send(WriteRequest::Write {
                path: path.to_string(),
                content: content.to_string(),
            })
            .is_ok()
    }

    /// Wait until every previously queued write has been issued
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteRequest::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Create the parent directory of `path` (recursively), then write the file
pub async fn write_with_parents(
    environment: &dyn SandboxEnvironment,
    path: &str,
    content: &str,
) -> Result<(), SandboxError> {
    if let Some(parent) = parent_dir(path) {
        environment.mkdir(parent, true).await?;
    }
    environment.write_file(path, content).await
}

/// Parent directory of a relative path, if it has one
pub fn parent_dir(path: &str) -> Option<&str> {
    path.trim_start_matches("./")
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|parent| !parent.is_empty())
}

pub struct ActionDispatcher {
    store: Arc<SessionStore>,
    session: Arc<SandboxSessionManager>,
    multiplexer: OutputMultiplexer,
    commands: CommandConfig,
    sandbox: SandboxConfig,
}

impl ActionDispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        session: Arc<SandboxSessionManager>,
        multiplexer: OutputMultiplexer,
        commands: CommandConfig,
        sandbox: SandboxConfig,
    ) -> Self {
        Self {
            store,
            session,
            multiplexer,
            commands,
            sandbox,
        }
    }

    /// Apply `action` and append it to the action history.
    ///
    /// Returns `None` when the action belongs to a cleared generation.
    pub async fn dispatch(&self, action: Action, generation: u64) -> Option<ActionOutcome> {
        if self.is_stale(generation) {
            log::debug!("Discarding stale action: {}", action.summary());
            return None;
        }
        log::debug!("Dispatching {}", action.summary());

        let outcome = match &action {
            Action::FileWrite { file_path, content } => self.apply_file_write(file_path, content),
            Action::ShellCommand { command } => self.run_command(command).await,
        };

        // A clear may have happened while a command was running
        if self.is_stale(generation) {
            log::debug!("Action finished after clear: {}", action.summary());
            return None;
        }
        self.store.record_action(action, outcome.clone());
        Some(outcome)
    }

    fn is_stale(&self, generation: u64) -> bool {
        generation != self.store.generation()
    }

    fn apply_file_write(&self, path: &str, content: &str) -> ActionOutcome {
        self.store.upsert_file(path, content);
        if let Some(writer) = self.session.writer() {
            if !writer.enqueue(path, content) {
                log::warn!("Sandbox write queue closed; {} not mirrored", path);
            }
        }
        ActionOutcome::Applied
    }

    async fn run_command(&self, command: &str) -> ActionOutcome {
        let Some(environment) = self.session.environment() else {
            log::debug!("Sandbox not ready, skipping `{}`", command);
            return ActionOutcome::Skipped {
                reason: "sandbox is not ready".to_string(),
            };
        };

        // Earlier file writes must reach the sandbox before the command runs
        if let Some(writer) = self.session.writer() {
            writer.flush().await;
        }

        let size = self
            .store
            .terminal_size()
            .unwrap_or(self.sandbox.default_terminal);
        let terminal = self.store.terminal_weak();

        let spawned = environment
            .spawn(&self.sandbox.shell, &["-c", command], SpawnOptions { terminal: size })
            .await;
        let (rx, handle) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                log::error!("Failed to execute `{}`: {}", command, e);
                if let Some(terminal) = self.store.terminal() {
                    terminal.write(format!("\r\nFailed to execute command: {}\r\n", e).as_bytes());
                }
                return ActionOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let pid = handle.pid();
        if self.commands.is_long_running(command) {
            log::info!("Started long-running `{}` (pid {})", command, pid);
            let pump = self.multiplexer.spawn_pump(rx, terminal);
            self.session
                .replace_foreground(ForegroundProcess::new(command, handle, Some(pump)));
            return ActionOutcome::Running { pid };
        }

        // Keep the handle alive until exit even if the slot is taken
        let _retained = self
            .session
            .occupy_foreground_if_vacant(ForegroundProcess::new(command, handle, None));
        let code = self.multiplexer.pump_until_exit(rx, terminal).await;
        self.session.release_foreground(pid);
        log::info!("`{}` exited with {:?}", command, code);
        ActionOutcome::Exited { code }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RuleClassifier;
    use crate::sandbox::memory::{JournalEntry, MemorySandboxRuntime, ProcessScript};
    use crate::store::SandboxStatus;
    use crate::terminal::{TerminalSink, TerminalSize, VecTerminal};

    struct Fixture {
        runtime: MemorySandboxRuntime,
        store: Arc<SessionStore>,
        session: Arc<SandboxSessionManager>,
        dispatcher: ActionDispatcher,
    }

    fn fixture() -> Fixture {
        let runtime = MemorySandboxRuntime::new();
        let store = Arc::new(SessionStore::new());
        let multiplexer =
            OutputMultiplexer::new(store.clone(), Arc::new(RuleClassifier::default()));
        let session = Arc::new(SandboxSessionManager::new(
            Arc::new(runtime.clone()),
            store.clone(),
            multiplexer.clone(),
            SandboxConfig::default(),
        ));
        let dispatcher = ActionDispatcher::new(
            store.clone(),
            session.clone(),
            multiplexer,
            CommandConfig::default(),
            SandboxConfig::default(),
        );
        Fixture {
            runtime,
            store,
            session,
            dispatcher,
        }
    }

    fn position(journal: &[JournalEntry], entry: &JournalEntry) -> usize {
        journal
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{:?} not in journal", entry))
    }

    fn spawn_position(journal: &[JournalEntry], command: &str) -> (usize, u32) {
        journal
            .iter()
            .enumerate()
            .find_map(|(i, e)| match e {
                JournalEntry::Spawned { pid, command: c, .. } if c.ends_with(command) => {
                    Some((i, *pid))
                }
                _ => None,
            })
            .unwrap_or_else(|| panic!("`{}` never spawned", command))
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("src/components/App.jsx"), Some("src/components"));
        assert_eq!(parent_dir("./src/main.js"), Some("src"));
        assert_eq!(parent_dir("package.json"), None);
    }

    #[tokio::test]
    async fn test_file_write_updates_table_and_sandbox() {
        let f = fixture();
        f.session.boot().await.unwrap();

        let outcome = f
            .dispatcher
            .dispatch(Action::file("src/a.txt", "hello"), 0)
            .await;
        f.session.writer().unwrap().flush().await;

        assert_eq!(outcome, Some(ActionOutcome::Applied));
        assert_eq!(f.store.file("src/a.txt").as_deref(), Some("hello"));
        assert_eq!(f.runtime.file("src/a.txt").as_deref(), Some("hello"));
        assert!(f.runtime.has_dir("src"));
        assert_eq!(f.store.actions().len(), 1);
    }

    #[tokio::test]
    async fn test_file_write_without_sandbox_only_updates_table() {
        let f = fixture();

        f.dispatcher.dispatch(Action::file("a.txt", "v1"), 0).await;
        f.dispatcher.dispatch(Action::file("a.txt", "v2"), 0).await;

        assert_eq!(f.store.file("a.txt").as_deref(), Some("v2"));
        assert_eq!(f.store.status(), SandboxStatus::Unbooted);
        assert!(f.runtime.files().is_empty());
    }

    #[tokio::test]
    async fn test_shell_without_sandbox_is_skipped() {
        let f = fixture();

        let outcome = f.dispatcher.dispatch(Action::shell("npm install"), 0).await;

        assert!(matches!(outcome, Some(ActionOutcome::Skipped { .. })));
        assert!(f.runtime.spawned_commands().is_empty());
        assert_eq!(f.store.actions().len(), 1);
    }

    #[tokio::test]
    async fn test_write_lands_before_following_command() {
        let f = fixture();
        f.session.boot().await.unwrap();

        f.dispatcher
            .dispatch(Action::file("package.json", "{}"), 0)
            .await;
        f.dispatcher.dispatch(Action::shell("npm install"), 0).await;

        let journal = f.runtime.journal();
        let written = position(
            &journal,
            &JournalEntry::WriteFile {
                path: "package.json".to_string(),
            },
        );
        let (spawned, _) = spawn_position(&journal, "npm install");
        assert!(written < spawned);
    }

    #[tokio::test]
    async fn test_short_commands_run_sequentially() {
        let f = fixture();
        f.runtime.script(ProcessScript::new("echo A").output("A\n"));
        f.runtime.script(ProcessScript::new("echo B").output("B\n"));
        let terminal: Arc<dyn TerminalSink> = Arc::new(VecTerminal::new());
        f.store.attach_terminal(&terminal);
        f.session.boot().await.unwrap();

        let a = f.dispatcher.dispatch(Action::shell("echo A"), 0).await;
        let b = f.dispatcher.dispatch(Action::shell("echo B"), 0).await;

        assert_eq!(a, Some(ActionOutcome::Exited { code: Some(0) }));
        assert_eq!(b, Some(ActionOutcome::Exited { code: Some(0) }));

        let journal = f.runtime.journal();
        let (_, pid_a) = spawn_position(&journal, "echo A");
        let (spawned_b, _) = spawn_position(&journal, "echo B");
        let exited_a = position(&journal, &JournalEntry::Exited { pid: pid_a, code: 0 });
        assert!(exited_a < spawned_b);
        assert_eq!(f.session.foreground_pid(), None);
    }

    #[tokio::test]
    async fn test_long_running_command_is_retained() {
        let f = fixture();
        f.runtime.script(ProcessScript::new("npm run dev").stays_alive());
        f.session.boot().await.unwrap();

        let outcome = f.dispatcher.dispatch(Action::shell("npm run dev"), 0).await;
        let Some(ActionOutcome::Running { pid }) = outcome else {
            panic!("expected running outcome, got {:?}", outcome);
        };
        assert_eq!(f.session.foreground_pid(), Some(pid));

        // A short command does not evict the dev server
        f.dispatcher.dispatch(Action::shell("ls"), 0).await;
        assert_eq!(f.session.foreground_pid(), Some(pid));

        f.session.rebuild().await.unwrap();
        assert!(f.runtime.journal().contains(&JournalEntry::Killed { pid }));
        assert_eq!(f.session.foreground_pid(), None);
    }

    #[tokio::test]
    async fn test_command_uses_terminal_size() {
        let f = fixture();
        let terminal: Arc<dyn TerminalSink> =
            Arc::new(VecTerminal::with_size(TerminalSize::new(132, 43)));
        f.session.boot().await.unwrap();

        f.dispatcher.dispatch(Action::shell("ls"), 0).await;
        f.store.attach_terminal(&terminal);
        f.dispatcher.dispatch(Action::shell("pwd"), 0).await;

        let sizes: Vec<TerminalSize> = f
            .runtime
            .journal()
            .into_iter()
            .filter_map(|e| match e {
                JournalEntry::Spawned { terminal, .. } => Some(terminal),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![TerminalSize::new(80, 50), TerminalSize::new(132, 43)]);
    }

    #[tokio::test]
    async fn test_spawn_failure_reported_to_terminal() {
        let f = fixture();
        f.runtime
            .script(ProcessScript::new("npm test").fails_to_spawn("out of processes"));
        let terminal = Arc::new(VecTerminal::new());
        f.session.boot().await.unwrap();
        f.store.attach_terminal(&(terminal.clone() as Arc<dyn TerminalSink>));

        let outcome = f.dispatcher.dispatch(Action::shell("npm test"), 0).await;

        assert!(matches!(outcome, Some(ActionOutcome::Failed { .. })));
        assert!(terminal
            .contents()
            .starts_with("\r\nFailed to execute command: "));
        assert!(f.store.build_errors().is_empty());
    }

    #[tokio::test]
    async fn test_build_error_from_command_output() {
        let f = fixture();
        f.runtime.script(
            ProcessScript::new("npm run build")
                .output("Error: Cannot find module 'x'")
                .exit_code(1),
        );
        f.session.boot().await.unwrap();

        let outcome = f.dispatcher.dispatch(Action::shell("npm run build"), 0).await;

        assert_eq!(outcome, Some(ActionOutcome::Exited { code: Some(1) }));
        let errors = f.store.build_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Error: Cannot find module 'x'");
    }

    #[tokio::test]
    async fn test_stale_generation_is_discarded() {
        let f = fixture();
        f.session.boot().await.unwrap();
        let generation = f.store.generation();
        f.session.clear().await;

        let outcome = f
            .dispatcher
            .dispatch(Action::file("late.txt", "x"), generation)
            .await;

        assert_eq!(outcome, None);
        assert_eq!(f.store.file("late.txt"), None);
        assert!(f.store.actions().is_empty());
    }
}
