//! Workbench context object
//!
//! Ties the session store, sandbox session manager, action dispatcher and
//! generation runner together. Front ends hold one `Workbench` per window
//! instead of reaching for global state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::classifier::{BuildError, OutputClassifier, RuleClassifier};
use crate::config::WorkbenchConfig;
use crate::dispatcher::{write_with_parents, ActionDispatcher};
use crate::error::{SessionError, WorkbenchError};
use crate::events::{EventSink, NullEventSink};
use crate::export::{self, ExportError, FileTreeNode};
use crate::feedback;
use crate::generation::{GenerationError, GenerationReport, GenerationRunner};
use crate::output::OutputMultiplexer;
use crate::provider::{
    collect_prompt, CodeModel, CodeRequest, FragmentStream, ImageData, PromptRequest,
    ProviderError,
};
use crate::sandbox::{check_relative_path, SandboxRuntime};
use crate::session::SandboxSessionManager;
use crate::store::{FileTable, SandboxStatus, SessionSnapshot, SessionStore};
use crate::terminal::{TerminalSink, TerminalSize};

pub struct Workbench {
    config: WorkbenchConfig,
    store: Arc<SessionStore>,
    session: Arc<SandboxSessionManager>,
    runner: GenerationRunner,
}

impl Workbench {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        config: WorkbenchConfig,
    ) -> Result<Self, WorkbenchError> {
        Self::with_events(runtime, config, Arc::new(NullEventSink))
    }

    /// Build a workbench that reports store changes to `events`
    pub fn with_events(
        runtime: Arc<dyn SandboxRuntime>,
        config: WorkbenchConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, WorkbenchError> {
        let classifier =
            RuleClassifier::with_extra_patterns(&config.detection.extra_error_patterns)?;
        Ok(Self::with_classifier(
            runtime,
            config,
            events,
            Arc::new(classifier),
        ))
    }

    /// Build a workbench with a custom build-error classifier
    pub fn with_classifier(
        runtime: Arc<dyn SandboxRuntime>,
        config: WorkbenchConfig,
        events: Arc<dyn EventSink>,
        classifier: Arc<dyn OutputClassifier>,
    ) -> Self {
        let store = Arc::new(SessionStore::with_events(events));
        let multiplexer = OutputMultiplexer::new(store.clone(), classifier);
        let session = Arc::new(SandboxSessionManager::new(
            runtime,
            store.clone(),
            multiplexer.clone(),
            config.sandbox.clone(),
        ));
        let dispatcher = Arc::new(ActionDispatcher::new(
            store.clone(),
            session.clone(),
            multiplexer,
            config.commands.clone(),
            config.sandbox.clone(),
        ));
        let runner = GenerationRunner::new(session.clone(), dispatcher);

        Self {
            config,
            store,
            session,
            runner,
        }
    }

    pub fn config(&self) -> &WorkbenchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn session(&self) -> &Arc<SandboxSessionManager> {
        &self.session
    }

    // ------------------------------------------------------------------
    // Sandbox lifecycle
    // ------------------------------------------------------------------

    pub async fn boot(&self) -> Result<(), SessionError> {
        self.session.boot().await
    }

    pub async fn rebuild(&self) -> Result<(), SessionError> {
        self.session.rebuild().await
    }

    /// Reset per-generation state; returns the new generation
    pub async fn clear(&self) -> u64 {
        self.session.clear().await
    }

    pub async fn shutdown(&self) {
        self.session.teardown().await;
    }

    // ------------------------------------------------------------------
    // Terminal
    // ------------------------------------------------------------------

    pub async fn attach_terminal(&self, terminal: Arc<dyn TerminalSink>) {
        self.session.attach_terminal(terminal).await;
    }

    pub fn detach_terminal(&self) {
        self.session.detach_terminal();
    }

    pub fn send_input(&self, data: &[u8]) -> Result<(), SessionError> {
        self.session.send_input(data)
    }

    pub fn resize_terminal(&self, size: TerminalSize) {
        self.session.resize_terminal(size);
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    /// Ask `model` for a code-generation prompt describing the image
    pub async fn describe_image(
        &self,
        model: &dyn CodeModel,
        image: &str,
    ) -> Result<String, ProviderError> {
        let mut request = PromptRequest::new(
            ImageData::from_data_url(image)?,
            self.config.generation.framework,
        );
        request.temperature = self.config.generation.temperature;
        collect_prompt(model.describe_image(request).await?).await
    }

    /// Code request for `prompt` using the configured framework and
    /// temperature. The image is attached only when "code with image" is on.
    pub fn code_request(
        &self,
        prompt: &str,
        image: Option<&str>,
    ) -> Result<CodeRequest, ProviderError> {
        let generation = &self.config.generation;
        let mut request = CodeRequest::new(prompt, generation.framework)
            .with_temperature(generation.temperature);
        if generation.code_with_image {
            if let Some(image) = image {
                request = request.with_image(ImageData::from_data_url(image)?);
            }
        }
        Ok(request)
    }

    /// Clear the session and apply the code `model` generates for `request`
    pub async fn generate(
        &self,
        model: &dyn CodeModel,
        request: CodeRequest,
    ) -> Result<GenerationReport, GenerationError> {
        self.runner.generate(model, request).await
    }

    /// Clear the session and apply an already-open response stream
    pub async fn run_stream(
        &self,
        stream: FragmentStream,
    ) -> Result<GenerationReport, GenerationError> {
        self.runner.run(stream).await
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Save a manual edit. Unlike streamed writes, sandbox failures are
    /// returned to the caller.
    pub async fn save_file(&self, path: &str, content: &str) -> Result<(), SessionError> {
        check_relative_path(path)?;
        self.store.upsert_file(path, content);

        let Some(environment) = self.session.environment() else {
            return Ok(());
        };
        if let Some(writer) = self.session.writer() {
            writer.flush().await;
        }
        write_with_parents(environment.as_ref(), path, content).await?;
        Ok(())
    }

    pub fn files(&self) -> FileTable {
        self.store.files()
    }

    pub fn file_tree(&self) -> Vec<FileTreeNode> {
        export::file_tree(&self.store.files())
    }

    /// Zip archive of the project, in memory
    pub fn export_zip(&self) -> Result<Vec<u8>, ExportError> {
        export::zip_bytes(&self.store.files())
    }

    /// Write the project archive into `dir` under the configured name
    pub async fn export_to(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        let path = dir.join(&self.config.export.archive_name);
        export::save_zip(&self.store.files(), &path).await?;
        Ok(path)
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn build_errors(&self) -> Vec<BuildError> {
        self.store.build_errors()
    }

    /// Follow-up instructions asking the model to fix the collected errors
    pub fn corrective_prompt(&self, instructions: &str) -> Option<String> {
        feedback::corrective_prompt(instructions, &self.store.build_errors())
    }

    pub fn server_url(&self) -> Option<String> {
        self.store.server_url()
    }

    pub fn status(&self) -> SandboxStatus {
        self.store.status()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.store.snapshot()
    }
}
