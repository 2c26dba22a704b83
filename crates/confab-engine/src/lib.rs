//! Process-backed streaming engine.
//!
//! Spawns the transport subprocess, keeps at most one live query per
//! document, decodes stdout through the provider's wire decoder, and
//! yields deltas plus a single terminal outcome per query.

pub mod artifact;
pub mod dispatcher;
pub mod supervisor;

pub use artifact::{PayloadStore, DEFAULT_PAYLOAD_CAP};
pub use dispatcher::{
    ActiveQuery, CancelHandle, DispatchOptions, QueryEvent, QueryOutcome, StreamDispatcher,
    TransportConfig, DEFAULT_TIMEOUT,
};
pub use supervisor::{
    BusyPolicy, ExitSummary, Invocation, ProcessEvent, ProcessSupervisor, QueryId, QueryState,
    Signal, SpawnedQuery,
};
