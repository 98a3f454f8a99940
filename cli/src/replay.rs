//! `pixelforge replay`: run a recorded model response through the workbench

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use workbench::provider::fragments_from;
use workbench::sandbox::local::LocalSandboxRuntime;
use workbench::sandbox::memory::MemorySandboxRuntime;
use workbench::{
    ApplicationFramework, CodeModel, CodeRequest, FragmentStream, GenerationError, PromptRequest,
    ProviderError, SandboxRuntime, TerminalSink, Workbench, WorkbenchConfig,
};

use crate::console::{print_tree, StdoutTerminal};

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Recorded model response containing action blocks
    #[arg(long)]
    response: PathBuf,

    /// Original instructions, used for the corrective prompt
    #[arg(long)]
    prompt: Option<PathBuf>,

    /// Characters per streamed fragment
    #[arg(long, default_value_t = 24)]
    chunk_size: usize,

    /// Run against a host directory instead of the in-memory sandbox
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Write the project archive into this directory
    #[arg(long)]
    export: Option<PathBuf>,

    /// Override the configured framework (react, vue, nextjs)
    #[arg(long)]
    framework: Option<ApplicationFramework>,

    /// Print the generated file tree
    #[arg(long, default_value_t = false)]
    tree: bool,

    /// Keep the sandbox running and forward stdin to its shell until Ctrl-C
    #[arg(long, default_value_t = false)]
    serve: bool,
}

/// Model that replays recorded output in fixed-size fragments
struct RecordedModel {
    prompt: String,
    response: String,
    chunk_size: usize,
}

impl RecordedModel {
    fn fragments(&self, text: &str) -> FragmentStream {
        let chars: Vec<char> = text.chars().collect();
        let fragments: Vec<String> = chars
            .chunks(self.chunk_size.max(1))
            .map(|chunk| chunk.iter().collect())
            .collect();
        fragments_from(fragments)
    }
}

#[async_trait]
impl CodeModel for RecordedModel {
    async fn describe_image(&self, _request: PromptRequest) -> Result<FragmentStream, ProviderError> {
        Ok(self.fragments(&self.prompt))
    }

    async fn generate_code(&self, request: CodeRequest) -> Result<FragmentStream, ProviderError> {
        log::debug!(
            "Replaying {} response ({} chars)",
            request.framework.label(),
            self.response.len()
        );
        Ok(self.fragments(&self.response))
    }
}

pub async fn run(args: ReplayArgs, config: WorkbenchConfig) -> anyhow::Result<()> {
    let runtime: Arc<dyn SandboxRuntime> = match &args.workdir {
        Some(dir) => Arc::new(LocalSandboxRuntime::new(dir)),
        None => Arc::new(MemorySandboxRuntime::new()),
    };
    // The session only holds the terminal weakly
    let terminal: Arc<dyn TerminalSink> = Arc::new(StdoutTerminal::from_env());
    replay(&args, config, runtime, terminal).await
}

async fn replay(
    args: &ReplayArgs,
    mut config: WorkbenchConfig,
    runtime: Arc<dyn SandboxRuntime>,
    terminal: Arc<dyn TerminalSink>,
) -> anyhow::Result<()> {
    if let Some(framework) = args.framework {
        config.generation.framework = framework;
    }

    let response = tokio::fs::read_to_string(&args.response)
        .await
        .with_context(|| format!("Failed to read {}", args.response.display()))?;
    let prompt = match &args.prompt {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => String::new(),
    };

    let workbench = Workbench::new(runtime, config)?;

    workbench.attach_terminal(terminal.clone()).await;
    workbench.boot().await.context("Failed to boot sandbox")?;

    let model = RecordedModel {
        prompt: prompt.clone(),
        response,
        chunk_size: args.chunk_size,
    };
    let request = workbench.code_request(&prompt, None)?;
    let report = match workbench.generate(&model, request).await {
        Ok(report) => report,
        Err(GenerationError::Stream { partial, source, .. }) => {
            log::error!("Response stream failed: {}", source);
            *partial
        }
        Err(e) => return Err(e.into()),
    };

    println!();
    println!(
        "Applied {} actions from {} fragments ({} malformed blocks dropped)",
        report.dispatched, report.fragments, report.dropped_blocks
    );
    println!("Files: {}", workbench.files().len());
    if let Some(url) = workbench.server_url() {
        println!("Server: {}", url);
    }

    if args.tree {
        print_tree(&workbench.file_tree());
    }

    if let Some(dir) = &args.export {
        let path = workbench
            .export_to(dir)
            .await
            .context("Failed to export project")?;
        println!("Exported {}", path.display());
    }

    let errors = workbench.build_errors();
    if !errors.is_empty() {
        println!("Build errors detected: {}", errors.len());
        if let Some(corrective) = workbench.corrective_prompt(&prompt) {
            println!("\n--- corrective prompt ---\n{}", corrective);
        }
    }

    if args.serve {
        serve(&workbench).await?;
    }

    workbench.shutdown().await;
    drop(terminal);
    Ok(())
}

/// Forward stdin lines to the sandbox shell until Ctrl-C or end of input
async fn serve(workbench: &Workbench) -> anyhow::Result<()> {
    log::info!("Sandbox running; type shell commands, Ctrl-C to stop");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                return Ok(());
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(e) = workbench.send_input(format!("{}\n", line).as_bytes()) {
                        log::warn!("Failed to forward input: {}", e);
                    }
                }
                None => {
                    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
                    return Ok(());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workbench::sandbox::memory::{JournalEntry, ProcessScript};
    use workbench::{TerminalSize, VecTerminal};

    fn args(response: PathBuf) -> ReplayArgs {
        ReplayArgs {
            response,
            prompt: None,
            chunk_size: 7,
            workdir: None,
            export: None,
            framework: None,
            tree: false,
            serve: false,
        }
    }

    #[tokio::test]
    async fn test_replay_streams_output_to_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let response = dir.path().join("response.txt");
        std::fs::write(
            &response,
            "<boltAction type=\"shell\">echo hello</boltAction>",
        )
        .unwrap();

        let runtime = MemorySandboxRuntime::new();
        runtime.script(ProcessScript::new("echo hello").output("hello\n"));
        let terminal = Arc::new(VecTerminal::with_size(TerminalSize::new(120, 40)));

        replay(
            &args(response),
            WorkbenchConfig::default(),
            Arc::new(runtime.clone()),
            terminal.clone(),
        )
        .await
        .unwrap();

        assert!(terminal.contents().contains("hello"));
        let spawned: Vec<(String, TerminalSize)> = runtime
            .journal()
            .into_iter()
            .filter_map(|entry| match entry {
                JournalEntry::Spawned { command, terminal, .. } => Some((command, terminal)),
                _ => None,
            })
            .collect();
        // Interactive shell first, then the command at the terminal's size
        assert_eq!(spawned.len(), 2);
        assert!(spawned
            .iter()
            .all(|(_, size)| *size == TerminalSize::new(120, 40)));
        assert!(spawned[1].0.contains("echo hello"));
    }
}
