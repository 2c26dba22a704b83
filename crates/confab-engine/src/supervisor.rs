use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use confab_core::Error;

/// Identifier for one spawned query, unique for the supervisor's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// What to do when a document already has a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    /// Reject the new spawn synchronously; nothing is started.
    #[default]
    Reject,
    /// Cancel the live query, then spawn the new one.
    Replace,
}

/// Signals deliverable to a query's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

impl Signal {
    fn as_raw(self) -> i32 {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Program plus argv for one transport run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Events a spawned query delivers, in read order. `Exited` arrives
/// last, exactly once.
#[derive(Debug)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exited(ExitSummary),
}

#[derive(Debug, Clone, Copy)]
pub struct ExitSummary {
    /// Exit code; `None` when the process died from a signal.
    pub code: Option<i32>,
    /// Whether a cancel was requested before the process exited.
    pub cancelled: bool,
}

/// Handle returned by [`ProcessSupervisor::spawn`].
#[derive(Debug)]
pub struct SpawnedQuery {
    pub id: QueryId,
    pub events: mpsc::Receiver<ProcessEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Spawned,
    Streaming,
    Exited,
    Cancelled,
}

impl QueryState {
    fn is_terminal(self) -> bool {
        matches!(self, QueryState::Exited | QueryState::Cancelled)
    }
}

#[derive(Debug)]
struct Entry {
    document_key: String,
    pgid: i32,
    state: QueryState,
}

#[derive(Debug, Default)]
struct Registry {
    by_id: HashMap<QueryId, Entry>,
    by_key: HashMap<String, QueryId>,
    next_id: u64,
}

impl Registry {
    /// Remove the entry, freeing the document key only when `id` still
    /// owns it. A Replace spawn may have claimed the key since.
    fn evict(&mut self, id: QueryId) {
        if let Some(entry) = self.by_id.remove(&id) {
            if self.by_key.get(&entry.document_key) == Some(&id) {
                self.by_key.remove(&entry.document_key);
            }
        }
    }
}

/// Tracks at most one live transport process per document key.
///
/// Children run in their own process group so cancellation reaches the
/// whole pipeline, not just the immediate child. Registry entries stay
/// until [`release`](Self::release): callers release only after they
/// have delivered their own terminal event, so a key never reads idle
/// while a consumer still thinks the query is running.
///
/// Thread-safe via `Mutex`.
#[derive(Debug)]
pub struct ProcessSupervisor {
    inner: Arc<Mutex<Registry>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Spawn the invocation for `document_key`. A busy key is rejected
    /// synchronously unless `policy` is `Replace`, in which case the
    /// incumbent is cancelled and detached from the key first.
    pub fn spawn(
        &self,
        document_key: &str,
        invocation: Invocation,
        policy: BusyPolicy,
    ) -> Result<SpawnedQuery, Error> {
        let id = {
            let mut reg = self.inner.lock().unwrap();

            if let Some(&live) = reg.by_key.get(document_key) {
                match policy {
                    BusyPolicy::Reject => {
                        warn!(
                            document = document_key,
                            query = %live,
                            "document already has a live query; rejecting"
                        );
                        return Err(Error::busy(document_key));
                    }
                    BusyPolicy::Replace => {
                        warn!(
                            document = document_key,
                            query = %live,
                            "document already has a live query; replacing"
                        );
                        if let Some(entry) = reg.by_id.get_mut(&live) {
                            if !entry.state.is_terminal() {
                                entry.state = QueryState::Cancelled;
                                if let Err(e) = send_group_signal(entry.pgid, Signal::Terminate) {
                                    warn!(query = %live, error = %e, "failed to signal replaced query");
                                }
                            }
                        }
                        // The old entry stays in by_id until its consumer
                        // releases it; only the key detaches now.
                        reg.by_key.remove(document_key);
                    }
                }
            }

            let id = QueryId(reg.next_id);
            reg.next_id += 1;
            reg.by_id.insert(
                id,
                Entry {
                    document_key: document_key.to_string(),
                    pgid: 0,
                    state: QueryState::Spawned,
                },
            );
            reg.by_key.insert(document_key.to_string(), id);
            id
        };

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.inner.lock().unwrap().evict(id);
                return Err(Error::transport_spawn(format!(
                    "{}: {}",
                    invocation.program, e
                )));
            }
        };

        let pgid = child.id().map(|pid| pid as i32).unwrap_or(0);
        {
            let mut reg = self.inner.lock().unwrap();
            if let Some(entry) = reg.by_id.get_mut(&id) {
                entry.pgid = pgid;
                match entry.state {
                    QueryState::Spawned => entry.state = QueryState::Streaming,
                    // A cancel raced the spawn; it marked the entry before
                    // the pgid existed, so deliver the signal now.
                    QueryState::Cancelled => {
                        let _ = send_group_signal(pgid, Signal::Terminate);
                    }
                    _ => {}
                }
            }
        }
        debug!(query = %id, document = document_key, pid = pgid, "spawned transport");

        let (tx, rx) = mpsc::channel(64);
        let registry = Arc::clone(&self.inner);
        tokio::spawn(pump(child, tx, registry, id));

        Ok(SpawnedQuery { id, events: rx })
    }

    /// Signal the query's process group and mark it cancelled. Returns
    /// whether this call stopped a live query; already terminal queries
    /// are left alone and report `false`.
    pub fn cancel(&self, id: QueryId, signal: Signal) -> Result<bool, Error> {
        let pgid = {
            let mut reg = self.inner.lock().unwrap();
            let Some(entry) = reg.by_id.get_mut(&id) else {
                return Err(Error::Unknown(format!("no such query: {id}")));
            };
            if entry.state.is_terminal() {
                return Ok(false);
            }
            entry.state = QueryState::Cancelled;
            entry.pgid
        };
        debug!(query = %id, ?signal, "cancelling query");
        send_group_signal(pgid, signal)?;
        Ok(true)
    }

    /// Cancel whatever query currently owns `document_key`. Reports
    /// `false` when the key is idle.
    pub fn cancel_document(&self, document_key: &str, signal: Signal) -> Result<bool, Error> {
        let live = {
            let reg = self.inner.lock().unwrap();
            reg.by_key.get(document_key).copied()
        };
        match live {
            Some(id) => self.cancel(id, signal),
            None => {
                debug!(document = document_key, "nothing to cancel");
                Ok(false)
            }
        }
    }

    pub fn is_busy(&self, document_key: &str) -> bool {
        self.inner.lock().unwrap().by_key.contains_key(document_key)
    }

    pub fn query_state(&self, id: QueryId) -> Option<QueryState> {
        self.inner.lock().unwrap().by_id.get(&id).map(|e| e.state)
    }

    /// Drop the registry entry and free the document key if this query
    /// still owns it.
    pub fn release(&self, id: QueryId) {
        self.inner.lock().unwrap().evict(id);
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

async fn pump(
    mut child: tokio::process::Child,
    tx: mpsc::Sender<ProcessEvent>,
    registry: Arc<Mutex<Registry>>,
    id: QueryId,
) {
    let mut readers = Vec::new();

    if let Some(mut stdout) = child.stdout.take() {
        let tx = tx.clone();
        readers.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(ProcessEvent::Stdout(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    if let Some(mut stderr) = child.stderr.take() {
        let tx = tx.clone();
        readers.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(ProcessEvent::Stderr(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    for reader in readers {
        let _ = reader.await;
    }

    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(query = %id, error = %e, "failed to reap transport");
            None
        }
    };

    let cancelled = {
        let mut reg = registry.lock().unwrap();
        match reg.by_id.get_mut(&id) {
            Some(entry) if entry.state == QueryState::Cancelled => true,
            Some(entry) => {
                entry.state = QueryState::Exited;
                false
            }
            None => false,
        }
    };

    debug!(query = %id, code = ?code, cancelled, "transport exited");
    let _ = tx
        .send(ProcessEvent::Exited(ExitSummary { code, cancelled }))
        .await;
}

fn send_group_signal(pgid: i32, signal: Signal) -> Result<(), Error> {
    if pgid <= 0 {
        return Ok(());
    }
    let rc = unsafe { libc::killpg(pgid, signal.as_raw()) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // The group is already gone; nothing left to cancel.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(Error::Io(err.to_string()))
}
