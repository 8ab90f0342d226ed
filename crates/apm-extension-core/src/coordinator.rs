//! Per-invocation orchestration.
//!
//! The coordinator drives the extension's main loop: long-poll the host for
//! the next event, run the invocation-scoped background workers, race the
//! completion signals against the deadline, and only then hand control back
//! to the host so the next invocation can begin. The hard constraints live
//! here: never block past the deadline, and in sync-flush mode never return
//! before outstanding telemetry has been given its chance to drain.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{ExtensionConfig, SendStrategy};
use crate::error::ExtensionError;
use crate::lifecycle::{EventType, LifecycleClient, NextEventResponse};
use crate::logsapi::LogsDispatch;
use crate::transport::ApmServerTransport;

/// Safety margin subtracted from the invocation deadline: the coordinator
/// stops waiting for completion signals this long before the function would
/// be frozen.
const FLUSH_DEADLINE_MARGIN: Duration = Duration::from_millis(100);

/// Upper bound on the final drain when a shutdown event arrives.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

/// Which signal ended the wait for the current invocation. Observable only
/// through logs; every reason leads to the same downstream steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The agent posted its end-of-invocation marker.
    AgentDone,
    /// The platform reported `platform.runtimeDone` for this request.
    RuntimeDone,
    /// Neither signal arrived before `deadline - margin`.
    DeadlineExpired,
}

/// The per-invocation orchestrator. Owns the lifecycle client and the
/// invocation-scoped cancellation; everything else is injected.
pub struct InvocationCoordinator {
    config: Arc<ExtensionConfig>,
    lifecycle: LifecycleClient,
    transport: Arc<ApmServerTransport>,
    logs: Arc<LogsDispatch>,
}

impl InvocationCoordinator {
    #[must_use]
    pub fn new(
        config: Arc<ExtensionConfig>,
        lifecycle: LifecycleClient,
        transport: Arc<ApmServerTransport>,
        logs: Arc<LogsDispatch>,
    ) -> Self {
        Self {
            config,
            lifecycle,
            transport,
            logs,
        }
    }

    /// Main loop. Returns cleanly when a shutdown event arrives or the global
    /// scope is cancelled; errors only on unrecoverable host-API failures
    /// (after an exit error has been reported).
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<(), ExtensionError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            if !self.process_event(shutdown).await? {
                return Ok(());
            }
        }
    }

    /// Handle one lifecycle event. Returns whether the loop should continue.
    async fn process_event(&mut self, shutdown: &CancellationToken) -> Result<bool, ExtensionError> {
        info!("Waiting for next event...");
        let event = tokio::select! {
            () = shutdown.cancelled() => return Ok(false),
            result = self.lifecycle.next_event() => match result {
                Ok(event) => event,
                Err(err @ ExtensionError::Protocol(_)) => {
                    // The host sent something we cannot make sense of; keep
                    // polling rather than killing the container.
                    error!("Ignoring malformed lifecycle event: {err}");
                    return Ok(true);
                }
                Err(err) => {
                    error!("Failed to poll for the next lifecycle event: {err}");
                    if let Err(report) = self.lifecycle.exit_error(&err.to_string()).await {
                        error!("Failed to report exit error to the host: {report}");
                    }
                    return Err(err);
                }
            },
        };

        if event.event_type == EventType::Shutdown {
            info!("Received shutdown event");
            shutdown.cancel();
            let drain_scope = CancellationToken::new();
            if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, self.transport.flush(&drain_scope))
                .await
                .is_err()
            {
                debug!("Final drain hit its time bound");
            }
            return Ok(false);
        }

        debug!(
            "Received invocation {} (deadline {}ms)",
            event.request_id, event.deadline_ms
        );
        self.process_invocation(shutdown, event).await;
        Ok(true)
    }

    async fn process_invocation(&self, shutdown: &CancellationToken, event: NextEventResponse) {
        // Cancellation propagates one way: global shutdown ends the
        // invocation, never the reverse.
        let invocation = shutdown.child_token();
        let agent_done = self.transport.begin_invocation();
        let runtime_done = self.logs.begin_invocation(event.clone());

        let forwarder = tokio::spawn(
            Arc::clone(&self.transport).forward_agent_data(invocation.clone()),
        );

        let reason =
            wait_for_completion(&agent_done, &runtime_done, flush_deadline_wait(&event)).await;
        match reason {
            CompletionReason::AgentDone => debug!("Received agent done signal"),
            CompletionReason::RuntimeDone => debug!("Received runtimeDone signal"),
            CompletionReason::DeadlineExpired => {
                info!("Time expired waiting for agent done or runtimeDone");
            }
        }

        // Unblock the background worker and wait for it before touching the
        // queue again; the flush below must see everything it left queued.
        invocation.cancel();
        if let Err(err) = forwarder.await {
            error!("Forwarder task failed: {err}");
        }

        if self.config.send_strategy == SendStrategy::SyncFlush {
            let budget = remaining_budget(&event);
            if tokio::time::timeout(budget, self.transport.flush(shutdown))
                .await
                .is_err()
            {
                info!("Sync flush ran out of invocation budget");
            }
        }
    }
}

/// Race the completion signals against the deadline timer. The agent is the
/// most authoritative "I'm done", so ties resolve Agent > Runtime > Timer.
pub(crate) async fn wait_for_completion(
    agent_done: &CancellationToken,
    runtime_done: &CancellationToken,
    deadline_wait: Duration,
) -> CompletionReason {
    tokio::select! {
        biased;
        () = agent_done.cancelled() => CompletionReason::AgentDone,
        () = runtime_done.cancelled() => CompletionReason::RuntimeDone,
        () = tokio::time::sleep(deadline_wait) => CompletionReason::DeadlineExpired,
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// How long to wait for completion signals: until `deadline - margin`.
fn flush_deadline_wait(event: &NextEventResponse) -> Duration {
    let margin = i64::try_from(FLUSH_DEADLINE_MARGIN.as_millis()).unwrap_or(100);
    let wait_ms = event.deadline_ms - margin - now_ms();
    Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0))
}

/// Time left until the hard deadline; bounds the sync flush.
fn remaining_budget(event: &NextEventResponse) -> Duration {
    let wait_ms = event.deadline_ms - now_ms();
    Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0))
}
