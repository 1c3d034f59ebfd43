// crates/alphred-supervisor/src/lib.rs
// ============================================================================
// Module: Alphred Background Execution Manager
// Description: Per-run single-flight supervisor driving runs off-request.
// Purpose: Own the only place a run is driven to terminal state asynchronously.
// Dependencies: alphred-core, tokio, tracing
// ============================================================================

//! ## Overview
//! The manager keeps a process-wide single-flight map from run id to the
//! in-flight task's completion signal. Each task opens its own store session
//! (the launching request's session is released when that request returns),
//! drives the synchronous executor inside `spawn_blocking`, reconciles
//! detached failures to a terminal run status, and removes itself from the
//! map only if the entry is still its own. Re-entries while a task is in
//! flight debounce into a single reschedule that re-reads the run once the
//! current task finishes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use alphred_core::ExecutionOptions;
use alphred_core::ExecutorError;
use alphred_core::ProviderResolver;
use alphred_core::RunId;
use alphred_core::RunResult;
use alphred_core::RunStatus;
use alphred_core::StoreError;
use alphred_core::StoreSessionFactory;
use alphred_core::SystemClock;
use alphred_core::WorkflowExecutor;
use alphred_core::WorkflowStore;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing::warn;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Background execution errors (logged, never raised to callers).
///
/// # Invariants
/// - Variants are stable for programmatic handling in logs.
#[derive(Debug, Error)]
pub enum BackgroundError {
    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Executor step failed.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    /// Background task panicked or was aborted.
    #[error("background task join error: {0}")]
    Join(String),
}

// ============================================================================
// SECTION: Execution Context
// ============================================================================

/// Working-directory context resolved for a background run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunExecutionContext {
    /// Directory the provider executes in (process cwd fallback).
    pub working_directory: Option<String>,
    /// True when the directory is an adapter-managed worktree.
    pub has_managed_worktree: bool,
    /// True when the worktree should be cleaned up after the run settles.
    pub cleanup_worktree: bool,
}

/// Hooks into the external worktree adapter.
pub trait WorktreeHooks: Send + Sync {
    /// Cleans up the worktree of a settled run.
    ///
    /// # Errors
    ///
    /// Returns a description of the cleanup failure (logged, never raised).
    fn cleanup_run(&self, run_id: RunId) -> Result<(), String>;
}

/// No-op worktree hooks for deployments without managed worktrees.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWorktreeHooks;

impl WorktreeHooks for NoopWorktreeHooks {
    fn cleanup_run(&self, _run_id: RunId) -> Result<(), String> {
        Ok(())
    }
}

// ============================================================================
// SECTION: Manager
// ============================================================================

/// Process-wide background execution manager.
///
/// # Invariants
/// - At most one in-flight task per run id.
/// - Reschedules debounce: one pending re-entry per run id.
pub struct BackgroundExecutionManager<F, R> {
    /// Factory opening an independent store session per task.
    sessions: Arc<F>,
    /// Provider resolver shared by all tasks.
    resolver: Arc<R>,
    /// Base execution options; the per-run working directory overlays these.
    base_options: ExecutionOptions,
    /// Step ceiling handed to the run loop.
    max_steps: u64,
    /// Worktree adapter hooks.
    worktrees: Arc<dyn WorktreeHooks>,
    /// Single-flight map: run id to the in-flight completion signal.
    inflight: Mutex<HashMap<i64, watch::Receiver<bool>>>,
    /// Run ids with a reschedule already waiting.
    reschedule_pending: Mutex<HashSet<i64>>,
}

impl<F, R> BackgroundExecutionManager<F, R>
where
    F: StoreSessionFactory + 'static,
    R: ProviderResolver + 'static,
{
    /// Creates a manager over a session factory and resolver.
    pub fn new(
        sessions: F,
        resolver: R,
        base_options: ExecutionOptions,
        max_steps: u64,
        worktrees: Arc<dyn WorktreeHooks>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Arc::new(sessions),
            resolver: Arc::new(resolver),
            base_options,
            max_steps,
            worktrees,
            inflight: Mutex::new(HashMap::new()),
            reschedule_pending: Mutex::new(HashSet::new()),
        })
    }

    /// Returns the number of in-flight background executions.
    pub async fn background_execution_count(&self) -> usize {
        self.inflight.lock().await.len()
    }

    /// Returns true when the run has an in-flight background execution.
    pub async fn has_background_execution(&self, run_id: RunId) -> bool {
        self.inflight.lock().await.contains_key(&run_id.get())
    }

    /// Spawns a background task for the run unless one is already in flight.
    /// Returns false when the run was already being driven.
    pub async fn enqueue(self: &Arc<Self>, run_id: RunId, context: RunExecutionContext) -> bool {
        let (sender, receiver) = {
            let mut inflight = self.inflight.lock().await;
            if inflight.contains_key(&run_id.get()) {
                return false;
            }
            let (sender, receiver) = watch::channel(false);
            inflight.insert(run_id.get(), receiver.clone());
            (sender, receiver)
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.drive_run(run_id, context).await;
            let mut inflight = manager.inflight.lock().await;
            if inflight
                .get(&run_id.get())
                .is_some_and(|current| current.same_channel(&receiver))
            {
                inflight.remove(&run_id.get());
            }
            drop(inflight);
            let _ = sender.send(true);
        });
        true
    }

    /// Ensures the run is (or will be) driven: enqueues directly, or
    /// registers a once-only reschedule behind the in-flight task.
    pub async fn ensure(self: &Arc<Self>, run_id: RunId) -> bool {
        let context = match self.resolve_run_execution_context(run_id).await {
            Ok(context) => context,
            Err(error) => {
                warn!(run_id = run_id.get(), %error, "failed to resolve execution context");
                RunExecutionContext::default()
            }
        };
        if self.enqueue(run_id, context).await {
            return true;
        }
        {
            let mut pending = self.reschedule_pending.lock().await;
            if !pending.insert(run_id.get()) {
                return false;
            }
        }
        let receiver = self.inflight.lock().await.get(&run_id.get()).cloned();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(mut receiver) = receiver {
                while !*receiver.borrow() {
                    if receiver.changed().await.is_err() {
                        break;
                    }
                }
            }
            manager.reschedule_pending.lock().await.remove(&run_id.get());
            manager.reschedule_if_still_running(run_id).await;
        });
        false
    }

    /// Re-reads the run in a fresh session and re-enqueues it when still
    /// running.
    async fn reschedule_if_still_running(self: &Arc<Self>, run_id: RunId) {
        let sessions = Arc::clone(&self.sessions);
        let loaded = tokio::task::spawn_blocking(move || {
            let store = sessions.open_session()?;
            store.load_run(run_id)
        })
        .await;
        match loaded {
            Ok(Ok(Some(run))) if run.status == RunStatus::Running => {
                let context = match self.resolve_run_execution_context(run_id).await {
                    Ok(context) => context,
                    Err(error) => {
                        warn!(
                            run_id = run_id.get(),
                            %error,
                            "failed to resolve execution context for reschedule"
                        );
                        RunExecutionContext::default()
                    }
                };
                let _ = self.enqueue(run_id, context).await;
            }
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                warn!(run_id = run_id.get(), %error, "reschedule run read failed");
            }
            Err(error) => {
                warn!(run_id = run_id.get(), %error, "reschedule task join failed");
            }
        }
    }

    /// Resolves the working directory for a run from its latest active
    /// worktree row, falling back to the process cwd.
    ///
    /// # Errors
    ///
    /// Returns [`BackgroundError`] when the store read fails.
    pub async fn resolve_run_execution_context(
        &self,
        run_id: RunId,
    ) -> Result<RunExecutionContext, BackgroundError> {
        let sessions = Arc::clone(&self.sessions);
        let worktree = tokio::task::spawn_blocking(move || {
            let store = sessions.open_session()?;
            store.latest_active_worktree(run_id)
        })
        .await
        .map_err(|error| BackgroundError::Join(error.to_string()))??;
        Ok(worktree.map_or_else(
            || RunExecutionContext {
                working_directory: std::env::current_dir()
                    .ok()
                    .map(|path| path.display().to_string()),
                has_managed_worktree: false,
                cleanup_worktree: false,
            },
            |worktree| RunExecutionContext {
                working_directory: Some(worktree.path),
                has_managed_worktree: true,
                cleanup_worktree: true,
            },
        ))
    }

    /// Drives one run to a settled point and reconciles detached failures.
    async fn drive_run(&self, run_id: RunId, context: RunExecutionContext) {
        let sessions = Arc::clone(&self.sessions);
        let resolver = Arc::clone(&self.resolver);
        let mut options = self.base_options.clone();
        options.working_directory = context.working_directory.clone();
        let max_steps = self.max_steps;
        let driven = tokio::task::spawn_blocking(move || -> Result<RunResult, BackgroundError> {
            let store = sessions.open_session()?;
            let executor = WorkflowExecutor::new(store, resolver, SystemClock);
            Ok(executor.execute_run(run_id, &options, max_steps)?)
        })
        .await;
        match driven {
            Ok(Ok(result)) => {
                info!(
                    run_id = run_id.get(),
                    executed_nodes = result.executed_nodes,
                    run_status = %result.final_step.run_status(),
                    "background execution settled"
                );
            }
            Ok(Err(background_error)) => {
                error!(
                    run_id = run_id.get(),
                    %background_error,
                    "background execution failed; reconciling run status"
                );
                self.mark_run_terminal_after_background_failure(run_id).await;
            }
            Err(join_error) => {
                error!(
                    run_id = run_id.get(),
                    %join_error,
                    "background execution task died; reconciling run status"
                );
                self.mark_run_terminal_after_background_failure(run_id).await;
            }
        }
        if context.has_managed_worktree
            && context.cleanup_worktree
            && let Err(cleanup_error) = self.worktrees.cleanup_run(run_id)
        {
            warn!(run_id = run_id.get(), %cleanup_error, "worktree cleanup failed");
        }
    }

    /// Reconciles a run whose background task failed: `pending -> cancelled`,
    /// `running -> failed`, `paused -> cancelled`. Precondition misses are
    /// swallowed; every error here is logged, never re-raised.
    pub async fn mark_run_terminal_after_background_failure(&self, run_id: RunId) {
        let sessions = Arc::clone(&self.sessions);
        let reconciled = tokio::task::spawn_blocking(move || -> Result<(), BackgroundError> {
            let store = sessions.open_session()?;
            let Some(run) = store.load_run(run_id)? else {
                return Ok(());
            };
            let target = match run.status {
                RunStatus::Pending | RunStatus::Paused => RunStatus::Cancelled,
                RunStatus::Running => RunStatus::Failed,
                RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => return Ok(()),
            };
            match store.transition_run(run_id, run.status, target) {
                Ok(()) => Ok(()),
                Err(error) if error.is_precondition() => Ok(()),
                Err(error) => Err(error.into()),
            }
        })
        .await;
        match reconciled {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(run_id = run_id.get(), %error, "terminal reconciliation failed");
            }
            Err(error) => {
                warn!(run_id = run_id.get(), %error, "terminal reconciliation task died");
            }
        }
    }
}
