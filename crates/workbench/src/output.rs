//! Output multiplexer
//!
//! Routes process output to the terminal sink chosen at spawn time and feeds
//! each chunk to the build-error classifier. Classification is per chunk; a
//! signature split across two chunks is not detected.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::classifier::{BuildError, OutputClassifier};
use crate::sandbox::ProcessEvent;
use crate::store::SessionStore;
use crate::terminal::TerminalSink;

#[derive(Clone)]
pub struct OutputMultiplexer {
    store: Arc<SessionStore>,
    classifier: Arc<dyn OutputClassifier>,
}

impl OutputMultiplexer {
    pub fn new(store: Arc<SessionStore>, classifier: Arc<dyn OutputClassifier>) -> Self {
        Self { store, classifier }
    }

    /// Write one chunk verbatim to `terminal` and log it as a build error if
    /// it matches a failure signature
    pub fn handle_chunk(
        &self,
        terminal: Option<&dyn TerminalSink>,
        chunk: &[u8],
    ) -> Option<BuildError> {
        if let Some(terminal) = terminal {
            terminal.write(chunk);
        }

        let text = String::from_utf8_lossy(chunk);
        let (rule, severity) = self.classifier.classify(&text)?;
        log::warn!("Build error detected ({}): {}", rule, text.trim_end());

        let error = BuildError {
            message: text.into_owned(),
            rule,
            severity,
        };
        self.store.push_build_error(error.clone());
        Some(error)
    }

    /// Forward process events until the process exits, returning its exit code
    pub async fn pump_until_exit(
        &self,
        mut rx: mpsc::Receiver<ProcessEvent>,
        terminal: Option<Weak<dyn TerminalSink>>,
    ) -> Option<i32> {
        while let Some(event) = rx.recv().await {
            match event {
                ProcessEvent::Output(data) => {
                    let sink = terminal.as_ref().and_then(Weak::upgrade);
                    self.handle_chunk(sink.as_deref(), &data);
                }
                ProcessEvent::Error(message) => {
                    log::warn!("[sandbox] Process error: {}", message);
                }
                ProcessEvent::Exited(code) => return code,
            }
        }
        None
    }

    /// Forward process events on a background task
    pub fn spawn_pump(
        &self,
        rx: mpsc::Receiver<ProcessEvent>,
        terminal: Option<Weak<dyn TerminalSink>>,
    ) -> JoinHandle<Option<i32>> {
        let multiplexer = self.clone();
        tokio::spawn(async move { multiplexer.pump_until_exit(rx, terminal).await })
    }
}
