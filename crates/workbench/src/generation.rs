//! Generation runner
//!
//! Drives one generation: clear the session, then consume the model's
//! fragment stream, dispatching each action as soon as its block is complete.
//! Actions are dispatched one at a time in the order their closing markers
//! arrived.

use std::sync::Arc;

use action_parser::ActionParser;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatcher::ActionDispatcher;
use crate::provider::{CodeModel, CodeRequest, FragmentStream, ProviderError};
use crate::session::SandboxSessionManager;

/// Summary of a consumed generation stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    pub generation: u64,
    /// Fragments received
    pub fragments: usize,
    /// Full response text as received
    pub transcript: String,
    /// Actions applied to the session
    pub dispatched: usize,
    /// Actions discarded because the session was cleared mid-stream
    pub discarded: usize,
    /// Malformed blocks the parser dropped
    pub dropped_blocks: usize,
    /// Unconsumed text after the last complete block
    pub trailing: String,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Generation stream failed after {fragments} fragments: {source}")]
    Stream {
        fragments: usize,
        #[source]
        source: ProviderError,
        partial: Box<GenerationReport>,
    },
}

pub struct GenerationRunner {
    session: Arc<SandboxSessionManager>,
    dispatcher: Arc<ActionDispatcher>,
}

impl GenerationRunner {
    pub fn new(session: Arc<SandboxSessionManager>, dispatcher: Arc<ActionDispatcher>) -> Self {
        Self {
            session,
            dispatcher,
        }
    }

    /// Request code from `model` and consume the response
    pub async fn generate(
        &self,
        model: &dyn CodeModel,
        request: CodeRequest,
    ) -> Result<GenerationReport, GenerationError> {
        let generation = self.session.clear().await;
        log::info!(
            "Generating {} code (generation {})",
            request.framework.label(),
            generation
        );
        let stream = model.generate_code(request).await?;
        self.consume(stream, generation).await
    }

    /// Clear the session, then consume an already-open stream
    pub async fn run(&self, stream: FragmentStream) -> Result<GenerationReport, GenerationError> {
        let generation = self.session.clear().await;
        self.consume(stream, generation).await
    }

    /// Consume `stream` on behalf of `generation` without clearing first
    pub async fn consume(
        &self,
        mut stream: FragmentStream,
        generation: u64,
    ) -> Result<GenerationReport, GenerationError> {
        let mut parser = ActionParser::new();
        let mut report = GenerationReport {
            generation,
            ..Default::default()
        };

        while let Some(item) = stream.next().await {
            let fragment = match item {
                Ok(fragment) => fragment,
                Err(source) => {
                    log::error!(
                        "Generation stream failed after {} fragments: {}",
                        report.fragments,
                        source
                    );
                    finish(&mut report, &parser);
                    return Err(GenerationError::Stream {
                        fragments: report.fragments,
                        source,
                        partial: Box::new(report),
                    });
                }
            };

            report.fragments += 1;
            report.transcript.push_str(&fragment);
            parser.push(&fragment);

            while let Some(action) = parser.next_action() {
                match self.dispatcher.dispatch(action, generation).await {
                    Some(_) => report.dispatched += 1,
                    None => report.discarded += 1,
                }
            }
        }

        finish(&mut report, &parser);
        log::info!(
            "Generation {} complete: {} fragments, {} actions ({} discarded, {} malformed)",
            generation,
            report.fragments,
            report.dispatched,
            report.discarded,
            report.dropped_blocks
        );
        Ok(report)
    }
}

fn finish(report: &mut GenerationReport, parser: &ActionParser) {
    report.dropped_blocks = parser.dropped_blocks();
    report.trailing = parser.pending().to_string();
}
