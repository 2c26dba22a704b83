use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use confab_core::{
    ChatRequest, DecodeResult, Error, ProviderConfig, SecretResolver, StreamDecoder, UsageStats,
    WireRequest,
};
use confab_providers::{adapter_for, decoder_for};

use crate::artifact::PayloadStore;
use crate::supervisor::{
    BusyPolicy, Invocation, ProcessEvent, ProcessSupervisor, QueryId, Signal, SpawnedQuery,
};

/// Watchdog applied when the caller does not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// How the transport subprocess is invoked.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub program: String,
    pub payload_dir: PathBuf,
    pub payload_cap_bytes: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            program: "curl".to_string(),
            payload_dir: std::env::temp_dir().join("confab-payloads"),
            payload_cap_bytes: crate::artifact::DEFAULT_PAYLOAD_CAP,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub busy: BusyPolicy,
    /// `None` disables the watchdog entirely.
    pub timeout: Option<Duration>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            busy: BusyPolicy::Reject,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

/// Events a dispatched query yields: zero or more deltas, then exactly
/// one `Finished`.
#[derive(Debug)]
pub enum QueryEvent {
    Delta(String),
    Finished(QueryOutcome),
}

#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    pub text: String,
    pub usage: Option<UsageStats>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl QueryOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

/// A live query: a stream of [`QueryEvent`]s plus first-class
/// cancellation.
#[derive(Debug)]
pub struct ActiveQuery {
    pub id: QueryId,
    events: ReceiverStream<QueryEvent>,
    supervisor: Arc<ProcessSupervisor>,
}

impl ActiveQuery {
    pub async fn next_event(&mut self) -> Option<QueryEvent> {
        self.events.next().await
    }

    pub fn cancel(&self) -> Result<(), Error> {
        self.supervisor.cancel(self.id, Signal::Terminate).map(|_| ())
    }

    /// Detachable handle for cancelling from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id,
            supervisor: Arc::clone(&self.supervisor),
        }
    }
}

impl Stream for ActiveQuery {
    type Item = QueryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<QueryEvent>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

#[derive(Clone)]
pub struct CancelHandle {
    id: QueryId,
    supervisor: Arc<ProcessSupervisor>,
}

impl CancelHandle {
    pub fn cancel(&self) -> Result<(), Error> {
        self.supervisor.cancel(self.id, Signal::Terminate).map(|_| ())
    }
}

/// Orchestrates one request end-to-end: secret, wire request, payload
/// artifact, transport process, decode loop, terminal outcome.
pub struct StreamDispatcher {
    supervisor: Arc<ProcessSupervisor>,
    secrets: Arc<dyn SecretResolver>,
    store: PayloadStore,
    transport: TransportConfig,
}

impl StreamDispatcher {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        secrets: Arc<dyn SecretResolver>,
        transport: TransportConfig,
    ) -> Self {
        let store = PayloadStore::new(transport.payload_dir.clone(), transport.payload_cap_bytes);
        Self {
            supervisor,
            secrets,
            store,
            transport,
        }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub async fn dispatch(
        &self,
        document_key: &str,
        provider: &ProviderConfig,
        request: ChatRequest,
        options: DispatchOptions,
    ) -> Result<ActiveQuery, Error> {
        let secret = self.secrets.resolve(&provider.name).await?;
        let adapter = adapter_for(provider.kind);
        let wire = adapter.build_request(&request, provider, &secret)?;
        let artifact = self.store.write(&wire.body)?;
        let invocation = transport_invocation(&self.transport.program, &wire, &artifact);

        info!(
            document = document_key,
            provider = %provider.name,
            family = adapter.family(),
            model = %request.model.name,
            "dispatching query"
        );

        self.dispatch_with_invocation(
            document_key,
            decoder_for(provider.kind, &request),
            invocation,
            Some(artifact),
            options,
        )
    }

    /// Lower-level entry point: run `invocation` and decode its stdout
    /// with `decoder`. `dispatch` lands here after building the wire
    /// request; tests substitute shell fixtures for the transport.
    pub fn dispatch_with_invocation(
        &self,
        document_key: &str,
        decoder: Box<dyn StreamDecoder>,
        invocation: Invocation,
        artifact: Option<PathBuf>,
        options: DispatchOptions,
    ) -> Result<ActiveQuery, Error> {
        let spawned = match self.supervisor.spawn(document_key, invocation, options.busy) {
            Ok(spawned) => spawned,
            Err(e) => {
                if let Some(artifact) = &artifact {
                    self.store.remove(artifact);
                }
                return Err(e);
            }
        };
        let SpawnedQuery { id, mut events } = spawned;

        let (tx, rx) = mpsc::channel(64);
        let supervisor = Arc::clone(&self.supervisor);
        let store = self.store.clone();
        let timeout = options.timeout;

        tokio::spawn(async move {
            let timed_out = Arc::new(AtomicBool::new(false));
            let watchdog = timeout.map(|limit| {
                let supervisor = Arc::clone(&supervisor);
                let timed_out = Arc::clone(&timed_out);
                tokio::spawn(async move {
                    tokio::time::sleep(limit).await;
                    // Flag the timeout only when this cancel stopped a
                    // live query; a stream that already exited keeps
                    // its own outcome.
                    match supervisor.cancel(id, Signal::Terminate) {
                        Ok(true) => {
                            timed_out.store(true, Ordering::SeqCst);
                            warn!(query = %id, limit = ?limit, "query exceeded timeout; cancelling");
                        }
                        Ok(false) => {}
                        Err(e) => debug!(query = %id, error = %e, "timeout cancel failed"),
                    }
                })
            });

            let mut decoder = decoder;
            let mut outcome = QueryOutcome::default();
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Stdout(bytes) => {
                        let decoded = decoder.feed(&bytes);
                        forward(decoded, &mut outcome, &tx).await;
                    }
                    ProcessEvent::Stderr(bytes) => {
                        let line = String::from_utf8_lossy(&bytes);
                        debug!(query = %id, stderr = %line.trim_end(), "transport stderr");
                    }
                    ProcessEvent::Exited(summary) => {
                        forward(decoder.finish(), &mut outcome, &tx).await;
                        outcome.cancelled = summary.cancelled;
                        if timed_out.load(Ordering::SeqCst) {
                            let limit = timeout.map(|l| l.as_secs()).unwrap_or_default();
                            outcome.error = Some(format!("timed out after {limit}s"));
                        } else if !summary.cancelled
                            && outcome.error.is_none()
                            && outcome.text.is_empty()
                        {
                            // Exit code 0 with nothing decoded is still a
                            // failure.
                            warn!(query = %id, code = ?summary.code, "stream ended with no content");
                            outcome.error = Some(Error::EmptyStream.to_string());
                        }
                        break;
                    }
                }
            }

            if let Some(watchdog) = watchdog {
                watchdog.abort();
            }
            let _ = tx.send(QueryEvent::Finished(outcome)).await;
            supervisor.release(id);
            if let Some(artifact) = artifact {
                store.remove(&artifact);
            }
        });

        Ok(ActiveQuery {
            id,
            events: ReceiverStream::new(rx),
            supervisor: Arc::clone(&self.supervisor),
        })
    }
}

async fn forward(decoded: DecodeResult, outcome: &mut QueryOutcome, tx: &mpsc::Sender<QueryEvent>) {
    if let Some(usage) = decoded.usage {
        match &mut outcome.usage {
            Some(current) => current.merge(&usage),
            None => outcome.usage = Some(usage),
        }
    }
    if let Some(error) = decoded.error {
        warn!(error = %error, "provider reported an error mid-stream");
        outcome.error = Some(error);
    }
    if !decoded.text.is_empty() {
        outcome.text.push_str(&decoded.text);
        let _ = tx.send(QueryEvent::Delta(decoded.text)).await;
    }
}

fn transport_invocation(program: &str, wire: &WireRequest, artifact: &Path) -> Invocation {
    let mut invocation = Invocation::new(program)
        .arg("--silent")
        .arg("--no-buffer")
        .arg("--request")
        .arg("POST");
    for (name, value) in &wire.headers {
        invocation = invocation.arg("--header").arg(format!("{name}: {value}"));
    }
    invocation
        .arg("--data-binary")
        .arg(format!("@{}", artifact.display()))
        .arg(&wire.endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::{Message, ModelParams, WireKind};
    use confab_providers::ChatCompletionsDecoder;

    struct StaticSecret;

    #[async_trait::async_trait]
    impl SecretResolver for StaticSecret {
        async fn resolve(&self, _provider: &str) -> Result<String, Error> {
            Ok("sk-test".to_string())
        }
    }

    fn dispatcher(dir: &Path) -> StreamDispatcher {
        let transport = TransportConfig {
            program: "/bin/sh".to_string(),
            payload_dir: dir.to_path_buf(),
            payload_cap_bytes: crate::artifact::DEFAULT_PAYLOAD_CAP,
        };
        StreamDispatcher::new(
            Arc::new(ProcessSupervisor::new()),
            Arc::new(StaticSecret),
            transport,
        )
    }

    fn sh(script: &str) -> Invocation {
        Invocation::new("/bin/sh").arg("-c").arg(script)
    }

    fn sse_decoder() -> Box<dyn StreamDecoder> {
        Box::new(ChatCompletionsDecoder::new())
    }

    async fn collect(mut query: ActiveQuery) -> (Vec<String>, QueryOutcome) {
        let mut deltas = Vec::new();
        let mut outcome = None;
        while let Some(event) = query.next_event().await {
            match event {
                QueryEvent::Delta(text) => deltas.push(text),
                QueryEvent::Finished(result) => outcome = Some(result),
            }
        }
        (deltas, outcome.expect("query must finish"))
    }

    #[tokio::test]
    async fn test_dispatch_decodes_stream_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let script = r#"printf 'data: {"choices":[{"delta":{"content":"Hel"}}]}\n\ndata: {"choices":[{"delta":{"content":"lo"}}]}\n\ndata: [DONE]\n\n'"#;

        let query = dispatcher
            .dispatch_with_invocation("doc", sse_decoder(), sh(script), None, DispatchOptions::default())
            .unwrap();
        let (deltas, outcome) = collect(query).await;

        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
        assert_eq!(outcome.text, "Hello");
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_empty_stream_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let query = dispatcher
            .dispatch_with_invocation("doc", sse_decoder(), sh("true"), None, DispatchOptions::default())
            .unwrap();
        let (deltas, outcome) = collect(query).await;

        assert!(deltas.is_empty());
        assert!(outcome.error.unwrap().contains("no content"));
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_provider_error_surfaces_in_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let script = r#"printf 'data: {"error":{"message":"rate limited"}}\n\n'"#;

        let query = dispatcher
            .dispatch_with_invocation("doc", sse_decoder(), sh(script), None, DispatchOptions::default())
            .unwrap();
        let (_, outcome) = collect(query).await;

        assert_eq!(outcome.error.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn test_cancel_delivers_terminal_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let query = dispatcher
            .dispatch_with_invocation("doc", sse_decoder(), sh("sleep 5"), None, DispatchOptions::default())
            .unwrap();
        query.cancel().unwrap();
        let (_, outcome) = collect(query).await;

        assert!(outcome.cancelled);
        assert!(outcome.error.is_none());
        assert!(!dispatcher.supervisor().is_busy("doc"));
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let options = DispatchOptions {
            busy: BusyPolicy::Reject,
            timeout: Some(Duration::from_millis(100)),
        };

        let query = dispatcher
            .dispatch_with_invocation("doc", sse_decoder(), sh("sleep 5"), None, options)
            .unwrap();
        let (_, outcome) = collect(query).await;

        assert!(outcome.cancelled);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_busy_conflict_is_synchronous() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let first = dispatcher
            .dispatch_with_invocation("doc", sse_decoder(), sh("sleep 5"), None, DispatchOptions::default())
            .unwrap();
        let second = dispatcher.dispatch_with_invocation(
            "doc",
            sse_decoder(),
            sh("printf 'never'"),
            None,
            DispatchOptions::default(),
        );
        assert!(second.unwrap_err().is_busy());

        first.cancel().unwrap();
        let (_, outcome) = collect(first).await;
        assert!(outcome.cancelled);
    }

    #[tokio::test]
    async fn test_artifact_removed_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let artifact = dir.path().join("payload-test.json");
        std::fs::write(&artifact, "{}").unwrap();

        let query = dispatcher
            .dispatch_with_invocation(
                "doc",
                sse_decoder(),
                sh("true"),
                Some(artifact.clone()),
                DispatchOptions::default(),
            )
            .unwrap();
        let (_, _) = collect(query).await;

        assert!(!artifact.exists());
    }

    #[tokio::test]
    async fn test_full_dispatch_writes_then_cleans_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let provider = ProviderConfig::new("openai", WireKind::ChatCompletions);
        let request = ChatRequest::new(vec![Message::user("hi")], ModelParams::new("gpt-4o"));

        // /bin/sh rejects the curl argv and exits with no stdout, so the
        // outcome is an empty-stream error; what matters here is that the
        // payload artifact is written for the spawn and gone afterwards.
        let query = dispatcher
            .dispatch("doc", &provider, request, DispatchOptions::default())
            .await
            .unwrap();
        let (_, outcome) = collect(query).await;

        assert!(outcome.error.is_some());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_transport_invocation_shape() {
        let wire = WireRequest {
            endpoint: "https://api.example.com/v1/chat/completions".to_string(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), "Bearer sk-test".to_string()),
            ],
            body: String::new(),
        };
        let invocation = transport_invocation("curl", &wire, Path::new("/tmp/payload-1.json"));

        assert_eq!(invocation.program, "curl");
        assert_eq!(
            invocation.args,
            vec![
                "--silent",
                "--no-buffer",
                "--request",
                "POST",
                "--header",
                "Content-Type: application/json",
                "--header",
                "Authorization: Bearer sk-test",
                "--data-binary",
                "@/tmp/payload-1.json",
                "https://api.example.com/v1/chat/completions",
            ]
        );
    }
}
