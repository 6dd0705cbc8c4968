use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use retouch::doc::DocError;
use retouch::llm::types::LlmError;
use retouch::{
    AncestorContext, DiffArtifact, Document, EditError, Editor, EditorConfig, ErrorCode, LlmClient, NodeId, NodeSpec,
    RhaiRuntime, Session, SharedDocument,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("invalid document JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid document: {0}")]
    Document(#[from] DocError),
    #[error("no element with id `{0}`")]
    UnknownSelection(String),
    #[error("generator setup failed: {0}")]
    Llm(#[from] LlmError),
    #[error("[{}] {}", .0.error_code(), .0)]
    Edit(#[from] EditError),
    #[error("stdin read failed: {0}")]
    Stdin(std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "retouch", about = "Edit elements of an HTML document with a script generator")]
struct Cli {
    /// Document tree as JSON (`{"tag": ..., "attributes": ..., "children": [...]}`).
    #[arg(long, env = "RETOUCH_DOCUMENT")]
    document: PathBuf,

    /// `id` attribute of an element to edit; repeat for several targets.
    #[arg(long = "select", required = true)]
    select: Vec<String>,

    /// Run a single request and exit. Without it, prompts are read from stdin.
    #[arg(long)]
    prompt: Option<String>,

    /// Also write each request's Markdown diff to this file.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: .env not loaded: {e}");
        }
    }
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let doc = load_document(&cli.document)?;
    let targets = resolve_targets(&doc, &cli.select)?;

    let config = EditorConfig::from_env();
    let llm = LlmClient::from_env()?;
    info!(model = llm.model(), targets = targets.len(), "retouch: editor ready");
    let editor = Editor::new(
        Arc::new(llm),
        Arc::new(RhaiRuntime::new(config.script_max_operations)),
        Arc::new(AncestorContext { max_depth: config.context_depth }),
        config,
    );
    let mut session = Session::new(SharedDocument::new(doc));

    let (progress, mut updates) = mpsc::channel::<String>(64);
    let printer = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            eprintln!("{update}");
        }
    });

    let result = match &cli.prompt {
        Some(prompt) => match request(&editor, &mut session, prompt, &targets, &progress).await {
            Ok(artifact) => deliver(&artifact, cli.output.as_deref()),
            Err(e) => Err(e),
        },
        None => repl(&editor, &mut session, &targets, &progress, cli.output.as_deref()).await,
    };

    drop(progress);
    if let Err(e) = printer.await {
        warn!(error = %e, "retouch: progress printer failed");
    }
    result
}

fn load_document(path: &Path) -> Result<Document, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Read { path: path.to_owned(), source })?;
    let spec: NodeSpec = serde_json::from_str(&raw)?;
    Ok(Document::from_spec(&spec)?)
}

fn resolve_targets(doc: &Document, ids: &[String]) -> Result<Vec<NodeId>, CliError> {
    ids.iter()
        .map(|id| {
            doc.find_by_attribute("id", id)
                .ok_or_else(|| CliError::UnknownSelection(id.clone()))
        })
        .collect()
}

/// Run one request; Ctrl-C cancels it.
async fn request(
    editor: &Editor,
    session: &mut Session,
    prompt: &str,
    targets: &[NodeId],
    progress: &mpsc::Sender<String>,
) -> Result<DiffArtifact, CliError> {
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("retouch: interrupt received, cancelling request");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "retouch: cannot listen for interrupt"),
            }
        }
    });
    let result = editor.run_request(session, prompt, targets, &cancel, progress).await;
    watcher.abort();
    Ok(result?)
}

fn deliver(artifact: &DiffArtifact, output: Option<&Path>) -> Result<(), CliError> {
    let markdown = artifact.to_markdown();
    println!("{markdown}");
    if let Some(path) = output {
        std::fs::write(path, &markdown).map_err(|source| CliError::Write { path: path.to_owned(), source })?;
    }
    Ok(())
}

/// Read prompts from stdin until EOF or `:quit`. Request failures are
/// reported and the loop continues; the document is unchanged by them.
async fn repl(
    editor: &Editor,
    session: &mut Session,
    targets: &[NodeId],
    progress: &mpsc::Sender<String>,
    output: Option<&Path>,
) -> Result<(), CliError> {
    eprintln!("Enter an instruction per line (:undo, :redo, :quit).");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.map_err(CliError::Stdin)? {
        let line = line.trim();
        let outcome = match line {
            "" => continue,
            ":quit" => break,
            ":undo" => editor
                .undo(session)
                .map(|id| report_history("undo", id))
                .map_err(CliError::from),
            ":redo" => editor
                .redo(session)
                .map(|id| report_history("redo", id))
                .map_err(CliError::from),
            prompt => match request(editor, session, prompt, targets, progress).await {
                Ok(artifact) => deliver(&artifact, output),
                Err(e) => Err(e),
            },
        };
        if let Err(e) = outcome {
            eprintln!("error: {e}");
        }
    }
    Ok(())
}

fn report_history(action: &str, request: Option<uuid::Uuid>) {
    match request {
        Some(id) => eprintln!("{action}: request {id}"),
        None => eprintln!("nothing to {action}"),
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
