//! # Fan-Out Executor
//!
//! Runs one call per client concurrently and waits for every one of them.
//!
//! All tasks are spawned before any result is awaited, and results are collected at a single
//! join point in completion order. Every dispatched client yields exactly one outcome: a
//! response or a [`TargetError`]. Per-target failures never abort the batch, they are gathered
//! into a [`CompositeError`] by the caller.
//!
//! The tasks live in a [`JoinSet`] owned by the returned future, so dropping that future (for
//! instance because the inbound call was cancelled) aborts every call still in flight.
use crate::connect::{ConnectError, ProxyClient};
use crate::target::Target;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tonic::{Code, Status};
use tracing::{debug, warn};

/// Why a single target did not contribute a response.
#[derive(Debug, thiserror::Error)]
pub enum TargetErrorKind {
    #[error("{0}")]
    Dial(#[source] ConnectError),
    #[error("rpc error: code = {:?} desc = {}", .0.code(), .0.message())]
    Call(Status),
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// A failure attributed to one target.
#[derive(Debug, thiserror::Error)]
#[error("{target}: {kind}")]
pub struct TargetError {
    pub target: Target,
    #[source]
    pub kind: TargetErrorKind,
}

impl TargetError {
    pub fn dial(target: Target, err: ConnectError) -> Self {
        Self {
            target,
            kind: TargetErrorKind::Dial(err),
        }
    }

    pub fn call(target: Target, status: Status) -> Self {
        Self {
            target,
            kind: TargetErrorKind::Call(status),
        }
    }

    /// gRPC code this failure maps to.
    pub fn code(&self) -> Code {
        match &self.kind {
            TargetErrorKind::Dial(_) => Code::Unavailable,
            TargetErrorKind::Call(status) => status.code(),
            TargetErrorKind::Panicked(_) => Code::Internal,
        }
    }
}

/// Every per-target failure of one fan-out operation.
///
/// Displayed as:
///
/// ```text
/// 2 errors occurred:
///     * n1: ...
///     * n2: ...
/// ```
#[derive(Debug)]
pub struct CompositeError {
    errors: Vec<TargetError>,
}

impl CompositeError {
    /// `None` when there is nothing to report.
    pub fn from_errors(errors: Vec<TargetError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self { errors })
        }
    }

    pub fn errors(&self) -> &[TargetError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// A single line summary, suitable for a metadata value.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// The status reported when no target answered.
    ///
    /// A lone error keeps its status. Several errors sharing a code keep that code, mixed codes
    /// become `UNKNOWN`.
    pub fn to_status(&self) -> Status {
        if let [single] = self.errors.as_slice()
            && let TargetErrorKind::Call(status) = &single.kind
        {
            return status.clone();
        }

        let mut codes = self.errors.iter().map(TargetError::code);
        let first = codes.next().unwrap_or(Code::Unknown);
        let code = if codes.all(|code| code == first) {
            first
        } else {
            Code::Unknown
        };

        Status::new(code, self.to_string())
    }
}

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            1 => write!(f, "1 error occurred:")?,
            n => write!(f, "{n} errors occurred:")?,
        }
        for err in &self.errors {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompositeError {}

/// Outcomes of one fan-out, partitioned.
#[derive(Debug)]
pub struct FanOut<T> {
    /// Successful responses, in completion order.
    pub responses: Vec<(Target, T)>,
    pub errors: Vec<TargetError>,
}

impl<T> Default for FanOut<T> {
    fn default() -> Self {
        Self {
            responses: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Runs `call` once per client, concurrently, and collects every outcome.
///
/// At most `limit` calls run at the same time when a limit is given, otherwise every client
/// gets its own task immediately.
pub async fn fan_out<T, F, Fut>(clients: Vec<ProxyClient>, limit: Option<usize>, call: F) -> FanOut<T>
where
    F: Fn(ProxyClient) -> Fut,
    Fut: Future<Output = Result<T, Status>> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = limit.map(|permits| Arc::new(Semaphore::new(permits.max(1))));
    let mut tasks = JoinSet::new();
    let mut targets = HashMap::with_capacity(clients.len());

    for client in clients {
        let target = client.target.clone();
        let semaphore = semaphore.clone();
        let fut = call(client);

        let handle = tasks.spawn(async move {
            let _permit = match semaphore {
                Some(semaphore) => Some(
                    semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| Status::internal("fan-out limiter closed"))?,
                ),
                None => None,
            };
            fut.await
        });
        targets.insert(handle.id(), target);
    }

    let mut outcome = FanOut::default();

    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(err) => {
                let id = err.id();
                let reason = err.to_string();
                let Some(target) = targets.remove(&id) else {
                    warn!(error = %reason, "fan-out task failed without a known target");
                    continue;
                };
                warn!(%target, error = %reason, "fan-out task did not complete");
                outcome.errors.push(TargetError {
                    target,
                    kind: TargetErrorKind::Panicked(reason),
                });
                continue;
            }
        };

        let Some(target) = targets.remove(&id) else {
            warn!("fan-out task finished without a known target");
            continue;
        };

        match result {
            Ok(response) => {
                debug!(%target, "target answered");
                outcome.responses.push((target, response));
            }
            Err(status) => {
                debug!(%target, code = ?status.code(), "target failed");
                outcome.errors.push(TargetError::call(target, status));
            }
        }
    }

    outcome
}
