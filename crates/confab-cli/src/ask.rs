use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use confab_core::{ChatRequest, DocumentSink, Message, ModelParams, ProviderConfig};
use confab_engine::{
    BusyPolicy, DispatchOptions, ProcessSupervisor, QueryEvent, QueryOutcome, StreamDispatcher,
};
use confab_transcript::{
    build_context, extract_fenced_block, find_separator, parse, Exchange, ParserConfig, TextSpan,
    Transcript,
};

use crate::config::{expand_path, Config};
use crate::secrets::ConfigSecretResolver;
use crate::sink::FileSink;
use crate::AskArgs;

pub async fn run(args: &AskArgs, config: &Config) -> Result<()> {
    let parser_config = config.transcript.to_parser_config();
    let sink = FileSink::open(&args.path)
        .with_context(|| format!("failed to open {}", args.path.display()))?;

    let supervisor = Arc::new(ProcessSupervisor::new());
    let secrets = Arc::new(ConfigSecretResolver::new(config.providers.clone()));
    let dispatcher =
        StreamDispatcher::new(supervisor, secrets, config.transport.to_transport_config());

    let mut session = AskSession {
        dispatcher,
        sink,
        document_key: document_key(&args.path),
        parser_config,
        args,
        config,
    };
    session.run().await
}

struct AskSession<'a> {
    dispatcher: StreamDispatcher,
    sink: FileSink,
    document_key: String,
    parser_config: ParserConfig,
    args: &'a AskArgs,
    config: &'a Config,
}

impl AskSession<'_> {
    /// Answer the chosen exchange, or under `--all` keep answering
    /// until nothing is left. The document is re-parsed after every
    /// write since answers shift the lines below them.
    async fn run(&mut self) -> Result<()> {
        let mut answered = 0;
        loop {
            let mut transcript = self.parse()?;
            let Some(target) = self.pick_target(&transcript)? else {
                break;
            };

            let outcome = self.answer(&mut transcript, target).await?;
            answered += 1;

            if !self.args.all || outcome.cancelled {
                break;
            }
        }

        if self.args.all {
            info!(answered, "finished");
        }
        Ok(())
    }

    fn parse(&self) -> Result<Transcript> {
        let lines = self.sink.lines().to_vec();
        let Some(sep) = find_separator(&lines, &self.parser_config) else {
            anyhow::bail!(
                "{} has no '{}' separator line; not a transcript",
                self.args.path.display(),
                self.parser_config.separator
            );
        };
        Ok(parse(&lines, sep, &self.parser_config)?)
    }

    /// Which exchange to answer. Without `--all` it is always the last
    /// one; with `--all`, the first that still needs an answer.
    fn pick_target(&self, transcript: &Transcript) -> Result<Option<usize>> {
        if self.args.all {
            return Ok(transcript.exchanges.iter().position(needs_answer));
        }

        let last = transcript.exchanges.len().checked_sub(1).with_context(|| {
            format!(
                "no exchanges found; start one with a '{}user' line",
                self.parser_config.user_prefix
            )
        })?;
        if !askable(&transcript.exchanges[last].question) {
            anyhow::bail!("the last exchange has an empty question");
        }
        Ok(Some(last))
    }

    async fn answer(&mut self, transcript: &mut Transcript, target: usize) -> Result<QueryOutcome> {
        let provider_name = self.provider_name(transcript)?;
        let provider = self.config.provider_config(&provider_name)?;
        let entry_default = self
            .config
            .providers
            .get(&provider_name)
            .and_then(|e| e.default_model.as_deref());
        let params = resolve_model(
            self.args.model.as_deref(),
            transcript,
            entry_default,
            &provider_name,
        )?;

        info!(
            provider = %provider_name,
            model = %params.name,
            exchange = target,
            "dispatching query"
        );

        let request = self.build_request(transcript, target, &provider, params)?;
        let options = DispatchOptions {
            busy: BusyPolicy::Reject,
            timeout: self.timeout(),
        };

        let mut query = self
            .dispatcher
            .dispatch(&self.document_key, &provider, request, options)
            .await?;

        // Ctrl-C cancels the query instead of killing the process, so
        // partial text still lands in the transcript.
        let cancel = query.cancel_handle();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = cancel.cancel();
            }
        });

        let display = !self.args.no_stream_display && atty::is(atty::Stream::Stdout);
        let mut streamed = false;
        let mut outcome = None;
        while let Some(event) = query.next_event().await {
            match event {
                QueryEvent::Delta(delta) => {
                    if display {
                        print!("{delta}");
                        let _ = std::io::stdout().flush();
                        streamed = true;
                    }
                }
                QueryEvent::Finished(finished) => {
                    outcome = Some(finished);
                    break;
                }
            }
        }
        interrupt.abort();
        if streamed {
            println!();
        }

        let outcome = outcome.context("query ended without a terminal event")?;
        self.record(transcript, target, &outcome)?;
        Ok(outcome)
    }

    fn provider_name(&self, transcript: &Transcript) -> Result<String> {
        self.args
            .provider
            .clone()
            .or_else(|| transcript.provider_name().map(|s| s.to_string()))
            .or_else(|| self.config.default_provider.clone())
            .context(
                "no provider named: pass --provider, add a '- provider:' header line, \
                 or set default_provider in the config",
            )
    }

    fn build_request(
        &self,
        transcript: &mut Transcript,
        target: usize,
        provider: &ProviderConfig,
        params: ModelParams,
    ) -> Result<ChatRequest> {
        if self.args.raw {
            let question = &transcript.exchanges[target].question;
            let body = extract_fenced_block(&question.text)
                .context("--raw needs a fenced code block in the question")?;
            return Ok(ChatRequest::new(Vec::new(), params).with_raw_body(body));
        }

        resolve_file_references(transcript, self.base_dir());

        let policy = self.config.memory.to_policy();
        let mut messages = build_context(transcript, target, &policy)?;
        if let Some(system) = transcript.header("config_system").and_then(|v| v.as_str()) {
            messages[0] = Message::system(system);
        }

        let web_search = transcript
            .web_search_override()
            .unwrap_or(provider.web_search);
        Ok(ChatRequest::new(messages, params).with_web_search(web_search))
    }

    fn timeout(&self) -> Option<Duration> {
        match self.args.timeout {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.config.transport.timeout(),
        }
    }

    fn base_dir(&self) -> &Path {
        self.args.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Persist the outcome. Partial text from a cancelled or failed
    /// stream is written, never rolled back; a run that produced
    /// nothing surfaces its error instead.
    fn record(
        &mut self,
        transcript: &Transcript,
        target: usize,
        outcome: &QueryOutcome,
    ) -> Result<()> {
        if let Some(usage) = &outcome.usage {
            info!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "token usage"
            );
        }

        if outcome.text.trim().is_empty() {
            return Err(no_output_error(outcome));
        }

        if let Some(error) = &outcome.error {
            warn!(error = %error, "stream ended with an error; keeping partial text");
        }

        let block = answer_block(&outcome.text, &self.parser_config);
        write_answer(
            &mut self.sink,
            &transcript.exchanges[target],
            block,
            &self.parser_config,
        )?;
        info!(path = %self.args.path.display(), "answer written");
        Ok(())
    }
}

/// Model precedence: `--model` flag, then the transcript header, then
/// the provider's configured default. Parameter fields from a lower
/// layer survive a bare name override.
fn resolve_model(
    flag: Option<&str>,
    transcript: &Transcript,
    entry_default: Option<&str>,
    provider: &str,
) -> Result<ModelParams> {
    let mut params = entry_default.map(ModelParams::new);

    if let Some(descriptor) = transcript.model_descriptor()? {
        let header = descriptor.normalize();
        params = Some(match params {
            Some(base) => base.overlay(&header),
            None => header,
        });
    }

    if let Some(name) = flag {
        let over = ModelParams::new(name);
        params = Some(match params {
            Some(base) => base.overlay(&over),
            None => over,
        });
    }

    params.with_context(|| {
        format!(
            "no model named: pass --model, add a '- model:' header line, \
             or set default_model under [providers.{provider}]"
        )
    })
}

/// What to report when the stream ended with nothing to write. A
/// timeout sets both the cancelled flag and an error; the error names
/// the actual cause, so it wins. Plain Ctrl-C carries no error.
fn no_output_error(outcome: &QueryOutcome) -> anyhow::Error {
    match &outcome.error {
        Some(error) => anyhow::anyhow!("{error}"),
        None if outcome.cancelled => anyhow::anyhow!("cancelled before any output arrived"),
        None => anyhow::anyhow!("stream produced no content"),
    }
}

fn askable(question: &TextSpan) -> bool {
    !question.text.trim().is_empty() || !question.file_references.is_empty()
}

/// `--all` answers exchanges that have no answer text yet, skipping
/// damaged ones with nothing to ask.
fn needs_answer(exchange: &Exchange) -> bool {
    let unanswered = exchange
        .answer
        .as_ref()
        .map_or(true, |a| a.text.trim().is_empty());
    unanswered && askable(&exchange.question)
}

/// Fill in `resolved_content` for every directive that reads cleanly.
/// Failures are logged and left unresolved; the question still goes
/// out. Relative paths resolve against the transcript's directory.
fn resolve_file_references(transcript: &mut Transcript, base: &Path) {
    for exchange in &mut transcript.exchanges {
        for reference in &mut exchange.question.file_references {
            let expanded = expand_path(&reference.path);
            let path = if expanded.is_absolute() {
                expanded
            } else {
                base.join(expanded)
            };
            match std::fs::read_to_string(&path) {
                Ok(content) => reference.resolved_content = Some(content),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "file reference left unresolved"
                ),
            }
        }
    }
}

/// The lines one answer occupies: the streamed text followed by an
/// empty summary marker for the user to fill in.
fn answer_block(text: &str, config: &ParserConfig) -> Vec<String> {
    let mut block: Vec<String> = text
        .trim()
        .lines()
        .map(|l| l.trim_end().to_string())
        .collect();
    block.push(String::new());
    block.push(config.summary_prefix.trim_end().to_string());
    block
}

/// Place `block`: replace an existing answer in place (consuming its
/// old summary and reasoning lines), or insert a fresh assistant
/// section after the question.
fn write_answer(
    sink: &mut FileSink,
    exchange: &Exchange,
    block: Vec<String>,
    config: &ParserConfig,
) -> Result<()> {
    match &exchange.answer {
        Some(span) if !span.is_empty() => {
            let mut upper = span.end_line;
            if let Some(summary) = &exchange.summary {
                upper = upper.max(summary.index);
            }
            if let Some(reasoning) = &exchange.reasoning {
                upper = upper.max(reasoning.index);
            }
            sink.replace_span(span.start_line, upper, &block)?;
        }
        Some(span) => {
            // An answer marker with nothing under it yet.
            let mut insert = vec![String::new()];
            insert.extend(block);
            sink.append_at(span.start_line.min(sink.line_count()), &insert)?;
        }
        None => {
            let mut insert = vec![
                String::new(),
                format!("{}assistant", config.assistant_prefix),
                String::new(),
            ];
            insert.extend(block);
            let at = (exchange.question.end_line + 1).min(sink.line_count());
            sink.append_at(at, &insert)?;
        }
    }
    Ok(())
}

/// Busy-exclusion key for a document: the canonical path when it
/// resolves, the given path otherwise.
fn document_key(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_text(text: &str) -> Transcript {
        let config = ParserConfig::default();
        let lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
        let sep = find_separator(&lines, &config).unwrap();
        parse(&lines, sep, &config).unwrap()
    }

    fn sink_with(content: &str) -> (tempfile::TempDir, FileSink) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.md");
        std::fs::write(&path, content).unwrap();
        (dir, FileSink::open(path).unwrap())
    }

    fn content(sink: &FileSink) -> String {
        std::fs::read_to_string(sink.path()).unwrap()
    }

    #[test]
    fn test_answer_block_shape() {
        let config = ParserConfig::default();
        let block = answer_block("Hello\nworld \n\n", &config);
        assert_eq!(block, vec!["Hello", "world", "", "==>"]);
    }

    #[test]
    fn test_write_answer_appends_after_question() {
        let text = "# T\n---\n>>> user\nq1\n";
        let (_dir, mut sink) = sink_with(text);
        let t = parse_text(text);
        let config = ParserConfig::default();

        let block = answer_block("the answer", &config);
        write_answer(&mut sink, &t.exchanges[0], block, &config).unwrap();

        assert_eq!(
            content(&sink),
            "# T\n---\n>>> user\nq1\n\n<<< assistant\n\nthe answer\n\n==>\n"
        );
        // the result still parses, with the answer attached
        let again = parse_text(&content(&sink));
        assert_eq!(again.exchanges.len(), 1);
        assert_eq!(
            again.exchanges[0].answer.as_ref().unwrap().text,
            "the answer"
        );
    }

    #[test]
    fn test_write_answer_inserts_before_next_exchange() {
        let text = "# T\n---\n>>> user\nq1\n>>> user\nq2\n";
        let (_dir, mut sink) = sink_with(text);
        let t = parse_text(text);
        let config = ParserConfig::default();

        let block = answer_block("a1", &config);
        write_answer(&mut sink, &t.exchanges[0], block, &config).unwrap();

        let again = parse_text(&content(&sink));
        assert_eq!(again.exchanges.len(), 2);
        assert_eq!(again.exchanges[0].answer.as_ref().unwrap().text, "a1");
        assert_eq!(again.exchanges[1].question.text, "q2");
        assert!(again.exchanges[1].answer.is_none());
    }

    #[test]
    fn test_write_answer_replaces_old_answer_and_summary() {
        let text = "# T\n---\n>>> user\nq\n<<< assistant\nold answer\n\n==> old summary\n";
        let (_dir, mut sink) = sink_with(text);
        let t = parse_text(text);
        let config = ParserConfig::default();

        let block = answer_block("new answer", &config);
        write_answer(&mut sink, &t.exchanges[0], block, &config).unwrap();

        let written = content(&sink);
        assert!(!written.contains("old answer"));
        assert!(!written.contains("old summary"));

        let again = parse_text(&written);
        assert_eq!(again.exchanges[0].answer.as_ref().unwrap().text, "new answer");
        assert_eq!(again.exchanges[0].summary.as_ref().unwrap().text, "");
    }

    #[test]
    fn test_write_answer_fills_bare_marker() {
        let text = "# T\n---\n>>> user\nq\n<<< assistant\n";
        let (_dir, mut sink) = sink_with(text);
        let t = parse_text(text);
        let config = ParserConfig::default();

        let block = answer_block("late answer", &config);
        write_answer(&mut sink, &t.exchanges[0], block, &config).unwrap();

        let again = parse_text(&content(&sink));
        assert_eq!(
            again.exchanges[0].answer.as_ref().unwrap().text,
            "late answer"
        );
    }

    #[test]
    fn test_no_output_error_names_the_cause() {
        let timeout = QueryOutcome {
            cancelled: true,
            error: Some("timed out after 2s".to_string()),
            ..QueryOutcome::default()
        };
        assert_eq!(no_output_error(&timeout).to_string(), "timed out after 2s");

        let ctrl_c = QueryOutcome {
            cancelled: true,
            ..QueryOutcome::default()
        };
        assert_eq!(
            no_output_error(&ctrl_c).to_string(),
            "cancelled before any output arrived"
        );

        let silent = QueryOutcome::default();
        assert_eq!(
            no_output_error(&silent).to_string(),
            "stream produced no content"
        );
    }

    #[test]
    fn test_needs_answer() {
        let t = parse_text(
            "# T\n---\n>>> user\nq1\n<<< assistant\na1\n>>> user\nq2\n<<< assistant\n>>> user\nq3",
        );
        assert!(!needs_answer(&t.exchanges[0]));
        assert!(needs_answer(&t.exchanges[1]));
        assert!(needs_answer(&t.exchanges[2]));

        // an orphaned answer has no question to ask
        let t = parse_text("# T\n---\n<<< assistant\nrecovered");
        assert!(!needs_answer(&t.exchanges[0]));
    }

    #[test]
    fn test_resolve_model_layering() {
        let t = parse_text(
            "# T\n- model: {\"name\": \"o3\", \"max_tokens\": 1000}\n---\n>>> user\nq",
        );

        let params = resolve_model(None, &t, Some("gpt-4o"), "openai").unwrap();
        assert_eq!(params.name, "o3");
        assert_eq!(params.max_tokens, Some(1000));

        let params = resolve_model(Some("o3-mini"), &t, Some("gpt-4o"), "openai").unwrap();
        assert_eq!(params.name, "o3-mini");
        assert_eq!(params.max_tokens, Some(1000));

        let bare = parse_text("# T\n---\n>>> user\nq");
        let params = resolve_model(None, &bare, Some("gpt-4o"), "openai").unwrap();
        assert_eq!(params.name, "gpt-4o");
        assert!(resolve_model(None, &bare, None, "openai").is_err());
    }

    #[test]
    fn test_resolve_file_references_reads_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "note content\n").unwrap();

        let mut t = parse_text("# T\n---\n>>> user\nSummarize.\n<notes.txt>\n<missing.txt>");
        resolve_file_references(&mut t, dir.path());

        let refs = &t.exchanges[0].question.file_references;
        assert_eq!(refs[0].resolved_content.as_deref(), Some("note content\n"));
        assert!(refs[1].resolved_content.is_none());
    }

    #[test]
    fn test_document_key_survives_missing_file() {
        let key = document_key(Path::new("/no/such/dir/chat.md"));
        assert!(key.ends_with("chat.md"));
    }
}
