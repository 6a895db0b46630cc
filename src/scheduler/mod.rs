//! Per-document injection scheduling.
//!
//! Each context walks forward through the document lifecycle. Signals that
//! merely repeat or fall behind the recorded stage are ignored; signals that
//! skip ahead invalidate the context until the embedder resets it for a new
//! document. Every accepted signal runs one injection pass.

pub mod set;
pub mod task;

pub use set::ScriptSet;
pub use task::{
    InjectionHost, InjectionKind, InjectionOutcome, InjectionRequest, ScriptInjection,
};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::cache::SourceCache;
use crate::distribution::{DistributionError, ScriptRegion};
use crate::matcher::FrameTree;
use crate::script::RunLocation;
use crate::types::ContextId;

/// Recorded injection progress of one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    None,
    Start,
    End,
    Idle,
    /// Lifecycle signals arrived out of order; the context takes no further
    /// work until reset.
    Invalidated,
}

enum Decision {
    Accept,
    Ignore,
    Invalidate,
}

fn transition(current: Stage, incoming: RunLocation) -> Decision {
    match current {
        Stage::Invalidated | Stage::Idle => Decision::Ignore,
        Stage::None => {
            if incoming == RunLocation::DocumentStart {
                Decision::Accept
            } else {
                Decision::Invalidate
            }
        }
        Stage::Start | Stage::End => {
            let recorded = if current == Stage::Start {
                RunLocation::DocumentStart
            } else {
                RunLocation::DocumentEnd
            };
            if incoming <= recorded {
                Decision::Ignore
            } else if Some(incoming) == recorded.next() {
                Decision::Accept
            } else {
                Decision::Invalidate
            }
        }
    }
}

fn stage_for(location: RunLocation) -> Stage {
    match location {
        RunLocation::DocumentStart => Stage::Start,
        RunLocation::DocumentEnd => Stage::End,
        RunLocation::DocumentIdle => Stage::Idle,
    }
}

#[derive(Debug, Default)]
struct ContextState {
    stage: Stage,
    /// Bumped on every reset; outstanding passes and timers tagged with an
    /// older generation become no-ops.
    generation: u64,
    executed: HashSet<String>,
    inserted: HashSet<String>,
    pending: Vec<ScriptInjection>,
    running: Vec<u64>,
    idle_fired: bool,
}

impl ContextState {
    fn reset(&mut self) {
        self.stage = Stage::None;
        self.generation += 1;
        self.executed.clear();
        self.inserted.clear();
        self.pending.clear();
        self.running.clear();
        self.idle_fired = false;
    }
}

#[derive(Clone)]
pub struct InjectionScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    set: RwLock<ScriptSet>,
    cache: SourceCache,
    frames: Arc<dyn FrameTree>,
    host: Arc<dyn InjectionHost>,
    contexts: DashMap<ContextId, ContextState>,
    next_task: AtomicU64,
    idle_timeout: Duration,
}

impl InjectionScheduler {
    pub fn new(
        frames: Arc<dyn FrameTree>,
        host: Arc<dyn InjectionHost>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                set: RwLock::new(ScriptSet::new()),
                cache: SourceCache::new(),
                frames,
                host,
                contexts: DashMap::new(),
                next_task: AtomicU64::new(0),
                idle_timeout,
            }),
        }
    }

    /// Register a fresh context (a newly created document).
    pub fn create_context(&self, context: ContextId) {
        self.inner.contexts.insert(context, ContextState::default());
    }

    /// A lifecycle signal for one context. Unknown contexts are registered
    /// implicitly.
    pub fn signal(&self, context: ContextId, location: RunLocation) {
        self.inner.signal(context, location);
    }

    /// Explicit notification that the document's resources settled; runs the
    /// idle pass early. Idempotent per generation.
    pub fn resources_settled(&self, context: ContextId) {
        let generation = match self.inner.contexts.get(&context) {
            Some(entry) => entry.generation,
            None => return,
        };
        self.inner.run_idle(context, generation);
    }

    /// The document's provisional load failed after document-start ran.
    /// Parks the context at idle with nothing further due.
    pub fn did_fail_provisional_load(&self, context: ContextId) {
        if let Some(mut entry) = self.inner.contexts.get_mut(&context) {
            if entry.stage == Stage::Start {
                warn!(%context, "load failed after document-start, parking context at idle");
                entry.reset();
                entry.stage = Stage::Idle;
                entry.idle_fired = true;
            }
        }
    }

    /// Loading stopped; same handling as a failed provisional load.
    pub fn stop(&self, context: ContextId) {
        self.did_fail_provisional_load(context);
    }

    /// A new document committed in this context. Discards tracked progress;
    /// with `force` even an untracked context drops its pending work.
    pub fn reset_context(&self, context: ContextId, force: bool) {
        if let Some(mut entry) = self.inner.contexts.get_mut(&context) {
            let tracked = entry.stage != Stage::None;
            if force || tracked {
                entry.reset();
            } else {
                entry.generation += 1;
                entry.idle_fired = false;
            }
        }
    }

    /// The context is gone; drop everything scheduled against it.
    pub fn remove_context(&self, context: ContextId) {
        self.inner.contexts.remove(&context);
    }

    /// Outcome report for an injection the host answered with `Blocked`.
    pub fn injection_finished(&self, context: ContextId, task: u64) {
        if let Some(mut entry) = self.inner.contexts.get_mut(&context) {
            entry.running.retain(|id| *id != task);
        }
    }

    /// Adopt a new distribution region. Pending injections whose script
    /// vanished or changed are cancelled.
    pub fn update_scripts(&self, region: &ScriptRegion) -> Result<(), DistributionError> {
        let changed = {
            let mut set = self
                .inner
                .set
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            set.update(region)?
        };
        self.inner.cache.clear();
        if !changed.is_empty() {
            for mut entry in self.inner.contexts.iter_mut() {
                let before = entry.pending.len();
                entry.pending.retain(|t| !changed.contains(t.script_key()));
                if entry.pending.len() != before {
                    debug!(
                        context = %entry.key(),
                        cancelled = before - entry.pending.len(),
                        "cancelled pending injections for changed scripts"
                    );
                }
            }
        }
        Ok(())
    }

    /// Recorded stage of a context, if known.
    pub fn stage(&self, context: ContextId) -> Option<Stage> {
        self.inner.contexts.get(&context).map(|entry| entry.stage)
    }

    /// Count of injections parked waiting for the host.
    pub fn pending_count(&self, context: ContextId) -> usize {
        self.inner
            .contexts
            .get(&context)
            .map(|entry| entry.pending.len())
            .unwrap_or(0)
    }

    /// Count of blocked injections not yet reported finished.
    pub fn running_count(&self, context: ContextId) -> usize {
        self.inner
            .contexts
            .get(&context)
            .map(|entry| entry.running.len())
            .unwrap_or(0)
    }
}

impl SchedulerInner {
    fn signal(self: &Arc<Self>, context: ContextId, location: RunLocation) {
        let generation;
        let mut tasks;
        {
            let mut entry = self.contexts.entry(context).or_default();
            match transition(entry.stage, location) {
                Decision::Ignore => {
                    trace!(%context, ?location, stage = ?entry.stage, "lifecycle signal ignored");
                    return;
                }
                Decision::Invalidate => {
                    warn!(
                        %context,
                        ?location,
                        stage = ?entry.stage,
                        "out-of-order lifecycle signal, invalidating context"
                    );
                    entry.stage = Stage::Invalidated;
                    entry.pending.clear();
                    entry.running.clear();
                    return;
                }
                Decision::Accept => {
                    entry.stage = stage_for(location);
                    if location == RunLocation::DocumentIdle {
                        entry.idle_fired = true;
                    }
                    generation = entry.generation;
                    tasks = std::mem::take(&mut entry.pending);
                }
            }
        }

        // Guard released: matching and host calls must not hold it.
        if let Some(document_url) = self.frames.document_url(context) {
            let set = self.set.read().unwrap_or_else(PoisonError::into_inner);
            tasks.extend(set.injections_for(&*self.frames, context, &document_url, location));
        } else {
            trace!(%context, "context has no document url, only retrying parked work");
        }

        debug!(%context, ?location, tasks = tasks.len(), "injection pass");
        self.run_pass(context, generation, tasks);

        if location == RunLocation::DocumentEnd {
            self.arm_idle_timer(context, generation);
        }
    }

    fn run_pass(&self, context: ContextId, generation: u64, tasks: Vec<ScriptInjection>) {
        for mut task in tasks {
            if task.id == 0 {
                task.id = self.next_task.fetch_add(1, Ordering::Relaxed) + 1;
            }

            // Resolve the due payloads and mark their content keys while
            // still holding the entry, so a host reentering the scheduler
            // (navigation from injected script) finds them in the dedup
            // sets and never double-executes. The entry guard is released
            // before any host call.
            let due = {
                let Some(mut entry) = self.contexts.get_mut(&context) else {
                    debug!(%context, "context removed mid-pass, abandoning remainder");
                    return;
                };
                if entry.generation != generation || entry.stage == Stage::Invalidated {
                    debug!(%context, "context reset mid-pass, abandoning remainder");
                    return;
                }
                let due = task.due_payloads(&self.cache, &entry.executed, &entry.inserted);
                for payload in &due {
                    match payload.kind {
                        InjectionKind::Script => entry.executed.insert(payload.content_key.clone()),
                        InjectionKind::Stylesheet => {
                            entry.inserted.insert(payload.content_key.clone())
                        }
                    };
                }
                due
            };
            if due.is_empty() {
                continue;
            }

            let mut outcome = InjectionOutcome::Finished;
            let mut refused_from = due.len();
            for (index, payload) in due.iter().enumerate() {
                let request = InjectionRequest {
                    context,
                    task: task.id,
                    script_key: task.script_key(),
                    content_key: &payload.content_key,
                    kind: payload.kind,
                    source: &payload.source,
                };
                match self.host.inject(&request) {
                    InjectionOutcome::Waiting => {
                        outcome = InjectionOutcome::Waiting;
                        refused_from = index;
                        break;
                    }
                    InjectionOutcome::Blocked => outcome = InjectionOutcome::Blocked,
                    InjectionOutcome::Finished => {}
                }
            }

            let Some(mut entry) = self.contexts.get_mut(&context) else {
                return;
            };
            if entry.generation != generation || entry.stage == Stage::Invalidated {
                return;
            }
            match outcome {
                InjectionOutcome::Waiting => {
                    // Nothing from the refused payload onward was delivered;
                    // release those marks so the parked retry owes them again.
                    for payload in &due[refused_from..] {
                        match payload.kind {
                            InjectionKind::Script => entry.executed.remove(&payload.content_key),
                            InjectionKind::Stylesheet => {
                                entry.inserted.remove(&payload.content_key)
                            }
                        };
                    }
                    entry.pending.push(task);
                }
                InjectionOutcome::Blocked => entry.running.push(task.id),
                InjectionOutcome::Finished => {}
            }
        }
    }

    fn arm_idle_timer(self: &Arc<Self>, context: ContextId, generation: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(%context, "no async runtime, idle fallback timer disabled");
            return;
        };
        let weak = Arc::downgrade(self);
        let timeout = self.idle_timeout;
        handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.run_idle(context, generation);
            }
        });
    }

    fn run_idle(self: &Arc<Self>, context: ContextId, generation: u64) {
        {
            let Some(entry) = self.contexts.get(&context) else {
                return;
            };
            if entry.generation != generation || entry.idle_fired {
                return;
            }
        }
        debug!(%context, "running idle pass");
        self.signal(context, RunLocation::DocumentIdle);
    }
}
