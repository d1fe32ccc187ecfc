use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, bail, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use indicatif::ProgressBar;
use lookout_core::{
    bootstrap, LookoutConfig, LookoutError, LookoutExecutor, PipelineStage, PipelineState,
    ServerConfig, ServerMode,
};
use output::{OutputFormat, Renderer};
use progress::spinner;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

const CLI_SESSION: &str = "cli";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "lookout",
    version,
    about = "Turn questions into classified video, article and link results from the shell."
)]
struct Cli {
    /// Preferred renderer for command output.
    #[arg(long, global = true, value_enum, default_value = "markdown")]
    format: OutputFormat,
    /// TOML configuration file layered under `LOOKOUT__*` environment variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Disable ANSI colors in CLI output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Suppress non-critical CLI output.
    #[arg(long, global = true)]
    quiet: bool,
    /// Disable progress indicators for long-running tasks.
    #[arg(long, global = true)]
    no_progress: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, Clone)]
enum Command {
    /// Run the JSON-RPC server over STDIO.
    Serve,
    /// Check whether a chat message is a lookout command.
    Detect {
        text: String,
        /// Highlighted context snippet (may be repeated).
        #[arg(long = "context")]
        snippets: Vec<String>,
    },
    /// Generate a search query for a question.
    Query {
        question: String,
        /// Highlighted context passed to the completion provider.
        #[arg(long)]
        context: Option<String>,
        /// Override the configured generation timeout.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Search directly, skipping query generation.
    Search {
        query: String,
        /// Keep the service's ordering instead of listing videos first.
        #[arg(long)]
        no_video_priority: bool,
    },
    /// Run a chat message through the full pipeline.
    Ask {
        text: String,
        /// Highlighted context snippet (may be repeated).
        #[arg(long = "context")]
        snippets: Vec<String>,
    },
    /// Generate shell completion scripts.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    fn progress_enabled(&self) -> bool {
        !self.quiet && !self.no_progress
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    if let Command::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "lookout", &mut std::io::stdout());
        return Ok(());
    }

    let lookout = LookoutConfig::load(cli.config.as_deref())?;
    let config = ServerConfig {
        lookout,
        mode: match cli.command {
            Command::Serve => ServerMode::Stdio,
            _ => ServerMode::Headless,
        },
        ..ServerConfig::default()
    };
    let runtime = bootstrap(config).await?;
    let executor = runtime.executor();
    let renderer = Renderer::new(cli.format);

    match cli.command.clone() {
        Command::Serve => runtime.serve().await,
        Command::Completions { .. } => Ok(()),
        Command::Detect { text, snippets } => {
            let command = executor.detect(&text, &snippets).await;
            if !cli.quiet {
                renderer.command(&command)?;
            }
            Ok(())
        }
        Command::Query {
            question,
            context,
            timeout_ms,
        } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            handle_query(&cli, &renderer, &executor, &question, context.as_deref(), timeout).await
        }
        Command::Search {
            query,
            no_video_priority,
        } => handle_search(&cli, &renderer, &executor, &query, !no_video_priority).await,
        Command::Ask { text, snippets } => {
            handle_ask(&cli, &renderer, &executor, &text, &snippets).await
        }
    }
}

async fn handle_query(
    cli: &Cli,
    renderer: &Renderer,
    executor: &LookoutExecutor,
    question: &str,
    context: Option<&str>,
    timeout: Option<Duration>,
) -> Result<()> {
    let spinner = spinner(cli.progress_enabled(), "Generating search query...");
    let result = executor
        .generate_query(question, context, timeout, &CancellationToken::new())
        .await;
    finish_spinner(spinner, None);
    let query = result?;
    if !cli.quiet {
        renderer.generated_query(&query)?;
    }
    Ok(())
}

async fn handle_search(
    cli: &Cli,
    renderer: &Renderer,
    executor: &LookoutExecutor,
    query: &str,
    prioritize_videos: bool,
) -> Result<()> {
    let spinner = spinner(cli.progress_enabled(), format!("Searching for `{query}`..."));
    let body = json!({ "query": query, "prioritizeVideos": prioritize_videos });
    let result = executor.search(&body, &CancellationToken::new()).await;
    finish_spinner(spinner, None);
    let response = result?;

    if response.status != 200 {
        bail!(
            "{}",
            response
                .body
                .error
                .unwrap_or_else(|| format!("request rejected with status {}", response.status))
        );
    }
    if !cli.quiet {
        renderer.outcome(&response.body)?;
    }
    Ok(())
}

async fn handle_ask(
    cli: &Cli,
    renderer: &Renderer,
    executor: &LookoutExecutor,
    text: &str,
    snippets: &[String],
) -> Result<()> {
    let spinner = spinner(cli.progress_enabled(), "Starting...");
    let result = executor
        .ask(CLI_SESSION, text, snippets, |state| {
            debug!(target: "lookout_cli", stage = %state.stage, "pipeline stage changed");
            if let Some(progress) = &spinner {
                progress.set_message(stage_message(state));
            }
        })
        .await;

    let state = match result {
        Ok(state) => state,
        Err(error) => {
            finish_spinner(spinner, None);
            if let LookoutError::Validation(reason) = error.lookout_error() {
                bail!("{reason}; start the message with `{}`", executor.context().detector.trigger());
            }
            return Err(error.into());
        }
    };

    let summary = match (&state.stage, &state.outcome) {
        (PipelineStage::Results, Some(outcome)) => {
            Some(format!("Found {} results", outcome.results.len()))
        }
        _ => None,
    };
    finish_spinner(spinner, summary);

    if state.outcome.is_none() {
        return Err(anyhow!(
            "{}",
            state.error.unwrap_or_else(|| "pipeline ended without results".to_string())
        ));
    }
    if !cli.quiet {
        renderer.pipeline_state(&state)?;
    }
    Ok(())
}

fn stage_message(state: &PipelineState) -> String {
    match state.stage {
        PipelineStage::Idle => "Starting...".to_string(),
        PipelineStage::GeneratingQuery => "Generating search query...".to_string(),
        PipelineStage::Searching => state.generated.as_ref().map_or_else(
            || "Searching...".to_string(),
            |query| format!("Searching for `{}`...", query.search_query),
        ),
        PipelineStage::Results => "Results ready".to_string(),
        PipelineStage::Error => "Search finished with errors".to_string(),
    }
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lookout_cli=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .without_time()
        .with_ansi(!cli.no_color)
        .compact()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow!("failed to initialize logging: {error}"))
}

fn finish_spinner(spinner: Option<ProgressBar>, message: Option<String>) {
    if let Some(progress) = spinner {
        if let Some(msg) = message {
            progress.finish_with_message(msg);
        } else {
            progress.finish_and_clear();
        }
    }
}

mod output {
    use std::fmt::Write;

    use anyhow::Result;
    use clap::ValueEnum;
    use lookout_client::{SearchOutcome, SearchResult};
    use lookout_core::{GeneratedQuery, LookoutCommand, PipelineState};

    #[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
    pub enum OutputFormat {
        Json,
        Markdown,
        Table,
        Text,
    }

    #[derive(Copy, Clone, Debug)]
    pub struct Renderer {
        format: OutputFormat,
    }

    impl Renderer {
        pub fn new(format: OutputFormat) -> Self {
            Self { format }
        }

        pub fn command(&self, command: &LookoutCommand) -> Result<()> {
            match self.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(command)?);
                }
                OutputFormat::Markdown => {
                    println!("| Property | Value |");
                    println!("| --- | --- |");
                    println!("| Command | {} |", command.is_command);
                    println!("| Question | {} |", sanitize(&command.question));
                    if let Some(context) = &command.highlighted_context {
                        println!("| Context | {} |", truncate(&sanitize(context), 80));
                    }
                }
                OutputFormat::Table => {
                    let mut rows = vec![
                        vec!["Command".to_string(), command.is_command.to_string()],
                        vec!["Question".to_string(), command.question.clone()],
                    ];
                    if let Some(context) = &command.highlighted_context {
                        rows.push(vec!["Context".to_string(), truncate(&sanitize(context), 80)]);
                    }
                    render_table(&["Property", "Value"], &rows);
                }
                OutputFormat::Text => {
                    if command.is_command {
                        println!("lookout command: {}", command.question);
                    } else {
                        println!("not a lookout command");
                    }
                }
            }
            Ok(())
        }

        pub fn generated_query(&self, query: &GeneratedQuery) -> Result<()> {
            match self.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(query)?);
                }
                OutputFormat::Markdown => {
                    println!("| Property | Value |");
                    println!("| --- | --- |");
                    println!("| Question | {} |", sanitize(&query.original_question));
                    println!("| Search Query | `{}` |", query.search_query);
                    println!("| Fallback | {} |", fallback_label(query));
                }
                OutputFormat::Table => {
                    let rows = vec![
                        vec!["Question".to_string(), sanitize(&query.original_question)],
                        vec!["Search Query".to_string(), query.search_query.clone()],
                        vec!["Fallback".to_string(), fallback_label(query)],
                    ];
                    render_table(&["Property", "Value"], &rows);
                }
                OutputFormat::Text => {
                    println!("{}", query.search_query);
                }
            }
            Ok(())
        }

        pub fn outcome(&self, outcome: &SearchOutcome) -> Result<()> {
            match self.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(outcome)?);
                }
                OutputFormat::Markdown => {
                    println!("## Results for `{}`", outcome.search_query);
                    println!();
                    if let Some(error) = &outcome.error {
                        println!("> {error}");
                        println!();
                    }
                    for result in &outcome.results {
                        println!(
                            "- **{}** [{}]({}) ({})",
                            result.kind, result.title, result.url, result.source
                        );
                        if !result.description.is_empty() {
                            println!("  {}", result.description);
                        }
                    }
                }
                OutputFormat::Table => {
                    let rows: Vec<Vec<String>> = outcome
                        .results
                        .iter()
                        .map(|result| {
                            vec![
                                result.kind.to_string(),
                                truncate(&result.title, 50),
                                result.source.clone(),
                                truncate(&result.url, 60),
                            ]
                        })
                        .collect();
                    render_table(&["Type", "Title", "Source", "URL"], &rows);
                    if let Some(error) = &outcome.error {
                        println!();
                        println!("Note: {error}");
                    }
                }
                OutputFormat::Text => {
                    if let Some(error) = &outcome.error {
                        println!("{error}");
                    }
                    for result in &outcome.results {
                        print_text_result(result);
                    }
                }
            }
            Ok(())
        }

        pub fn pipeline_state(&self, state: &PipelineState) -> Result<()> {
            if self.format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(state)?);
                return Ok(());
            }
            if let Some(query) = &state.generated {
                if query.used_fallback && self.format != OutputFormat::Text {
                    println!("Query generation fell back ({}).", fallback_label(query));
                    println!();
                }
            }
            match &state.outcome {
                Some(outcome) => self.outcome(outcome),
                None => Ok(()),
            }
        }
    }

    fn print_text_result(result: &SearchResult) {
        println!("[{}] {}", result.kind, result.title);
        println!("  {}", result.url);
        if let Some(thumbnail) = &result.thumbnail {
            println!("  thumbnail: {thumbnail}");
        }
    }

    fn fallback_label(query: &GeneratedQuery) -> String {
        match (&query.used_fallback, &query.error) {
            (false, _) => "no".to_string(),
            (true, Some(reason)) => format!("yes: {reason}"),
            (true, None) => "yes".to_string(),
        }
    }

    fn render_table(headers: &[&str], rows: &[Vec<String>]) {
        fn render_line(columns: &[&str], widths: &[usize]) -> String {
            let mut line = String::new();
            for (idx, value) in columns.iter().enumerate() {
                let width = widths[idx];
                let _ = write!(line, "| {value:width$} ");
            }
            line.push('|');
            line
        }

        let mut widths: Vec<usize> = headers.iter().map(|header| header.chars().count()).collect();
        for row in rows {
            for (idx, cell) in row.iter().enumerate() {
                widths[idx] = widths[idx].max(cell.chars().count());
            }
        }

        println!("{}", render_line(headers, &widths));
        let separator: String = widths
            .iter()
            .map(|width| format!("|{:-^1$}", "", width + 2))
            .collect();
        println!("{separator}|");

        for row in rows {
            let cols: Vec<&str> = row.iter().map(String::as_str).collect();
            println!("{}", render_line(&cols, &widths));
        }
    }

    fn sanitize(value: &str) -> String {
        value
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn truncate(value: &str, max: usize) -> String {
        if value.chars().count() <= max {
            value.to_string()
        } else {
            let mut truncated = value
                .chars()
                .take(max.saturating_sub(1))
                .collect::<String>();
            truncated.push('…');
            truncated
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn truncate_counts_characters() {
            assert_eq!(truncate("héllo", 5), "héllo");
            assert_eq!(truncate("héllo world", 6), "héllo…");
        }

        #[test]
        fn sanitize_joins_lines() {
            assert_eq!(sanitize(" a \n\n b "), "a b");
        }
    }
}

mod progress {
    use std::time::Duration;

    use indicatif::{ProgressBar, ProgressStyle};

    pub fn spinner(message_enabled: bool, message: impl Into<String>) -> Option<ProgressBar> {
        if !message_enabled {
            return None;
        }
        let progress = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        progress.set_style(style);
        progress.set_message(message.into());
        progress.enable_steady_tick(Duration::from_millis(80));
        Some(progress)
    }
}
