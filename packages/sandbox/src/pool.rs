// ABOUTME: Warm sandbox pool keyed by runtime kind and initialized action
// ABOUTME: Enforces the warm/busy partition, LRU eviction under the size cap, and idle cleanup

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::substrate::{Sandbox, SandboxSpec, Substrate, SubstrateError};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("sandbox {0} is not checked out of the pool")]
    NotInPool(String),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// A sandbox plus its pool metadata.
#[derive(Debug, Clone)]
pub struct PooledSandbox {
    pub sandbox: Sandbox,
    pub runtime_kind: String,
    pub last_used: DateTime<Utc>,
    /// None until the first successful `/init`; written exactly once.
    pub initialized_action: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on the warm set, enforced on release.
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
}

/// Per-runtime pool counts, published with every heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub warm: HashMap<String, usize>,
    pub stem_cells: HashMap<String, usize>,
    pub busy: usize,
}

/// Grace period given to a sandbox's stop handler before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(10);

struct PoolState {
    /// Warm sandboxes per runtime kind, each vec ordered oldest-used first.
    warm: HashMap<String, Vec<PooledSandbox>>,
    busy: HashMap<String, PooledSandbox>,
}

impl PoolState {
    fn warm_total(&self) -> usize {
        self.warm.values().map(Vec::len).sum()
    }

    /// Remove and return the globally least-recently-used warm sandbox.
    /// Vecs are ordered by last_used, so the LRU is the oldest list front.
    fn pop_lru_warm(&mut self) -> Option<PooledSandbox> {
        let kind = self
            .warm
            .iter()
            .filter_map(|(kind, list)| list.first().map(|pc| (kind, pc.last_used)))
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(kind, _)| kind.clone())?;

        let list = self.warm.get_mut(&kind)?;
        let victim = list.remove(0);
        if list.is_empty() {
            self.warm.remove(&kind);
        }
        Some(victim)
    }
}

/// Bounded cache of warm sandboxes.
///
/// All list manipulation happens under one mutex; sandbox creation and
/// removal always run outside it.
pub struct SandboxPool {
    substrate: Arc<dyn Substrate>,
    state: Mutex<PoolState>,
    config: PoolConfig,
    cancel: CancellationToken,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxPool {
    pub fn new(substrate: Arc<dyn Substrate>, config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            substrate,
            state: Mutex::new(PoolState {
                warm: HashMap::new(),
                busy: HashMap::new(),
            }),
            config,
            cancel: CancellationToken::new(),
            cleanup_task: Mutex::new(None),
        });

        let task = {
            let pool = pool.clone();
            let token = pool.cancel.clone();
            let interval = pool.config.cleanup_interval;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                tick.tick().await; // the first tick fires immediately
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => pool.cleanup_idle().await,
                    }
                }
            })
        };
        *pool.cleanup_task.lock().unwrap() = Some(task);

        pool
    }

    /// Get a sandbox for `(runtime_kind, action)`, preferring in order: a
    /// warm sandbox initialized for this action, a warm stem cell of the
    /// same kind, a freshly created sandbox. Returns the sandbox marked
    /// busy plus whether this is a cold start.
    pub async fn acquire(&self, runtime_kind: &str, action: &str) -> Result<(PooledSandbox, bool)> {
        {
            let mut state = self.state.lock().unwrap();
            let mut warm_hit = None;
            if let Some(list) = state.warm.get_mut(runtime_kind) {
                // Most-recently-used candidates sit at the back.
                let hit = list
                    .iter()
                    .rposition(|pc| pc.initialized_action.as_deref() == Some(action))
                    .map(|pos| (pos, false))
                    .or_else(|| {
                        list.iter()
                            .rposition(|pc| pc.initialized_action.is_none())
                            .map(|pos| (pos, true))
                    });

                if let Some((pos, cold)) = hit {
                    let mut pc = list.remove(pos);
                    pc.last_used = Utc::now();
                    warm_hit = Some((pc, cold));
                }
            }

            if let Some((pc, cold)) = warm_hit {
                if state.warm.get(runtime_kind).is_some_and(Vec::is_empty) {
                    state.warm.remove(runtime_kind);
                }
                state.busy.insert(pc.sandbox.id.clone(), pc.clone());
                debug!(
                    sandbox_id = %pc.sandbox.id,
                    runtime = %runtime_kind,
                    cold_start = cold,
                    "acquired warm sandbox"
                );
                return Ok((pc, cold));
            }
        }

        // Cold path: create and start outside the lock.
        let sandbox = self.create_started(runtime_kind).await?;
        let pc = PooledSandbox {
            sandbox,
            runtime_kind: runtime_kind.to_string(),
            last_used: Utc::now(),
            initialized_action: None,
        };

        self.state
            .lock()
            .unwrap()
            .busy
            .insert(pc.sandbox.id.clone(), pc.clone());

        debug!(sandbox_id = %pc.sandbox.id, runtime = %runtime_kind, "created sandbox for cold start");
        Ok((pc, true))
    }

    /// Record a successful `/init` on a busy sandbox.
    pub fn mark_initialized(&self, sandbox_id: &str, action: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let pc = state
            .busy
            .get_mut(sandbox_id)
            .ok_or_else(|| PoolError::NotInPool(sandbox_id.to_string()))?;
        if pc.initialized_action.is_none() {
            pc.initialized_action = Some(action.to_string());
        }
        Ok(())
    }

    /// Return a busy sandbox. With `reuse` it re-enters the warm set (the
    /// globally least-recently-used warm sandbox is evicted first when the
    /// cap would be exceeded); without it the sandbox is destroyed.
    /// Releasing a sandbox not checked out is an error.
    pub async fn release(&self, sandbox_id: &str, reuse: bool) -> Result<()> {
        let (retained, evicted) = {
            let mut state = self.state.lock().unwrap();
            let mut pc = state
                .busy
                .remove(sandbox_id)
                .ok_or_else(|| PoolError::NotInPool(sandbox_id.to_string()))?;

            if !reuse {
                (false, Vec::new())
            } else {
                let mut evicted = Vec::new();
                while state.warm_total() >= self.config.max_size {
                    match state.pop_lru_warm() {
                        Some(victim) => evicted.push(victim.sandbox.id),
                        None => break,
                    }
                }
                // Eviction can come up empty (max_size of zero); the cap
                // then only holds if the candidate is destroyed instead
                // of inserted.
                if state.warm_total() >= self.config.max_size {
                    (false, evicted)
                } else {
                    pc.last_used = Utc::now();
                    state
                        .warm
                        .entry(pc.runtime_kind.clone())
                        .or_default()
                        .push(pc);
                    (true, evicted)
                }
            }
        };

        if !retained {
            info!(sandbox_id = %sandbox_id, "destroying released sandbox");
            self.substrate.remove(sandbox_id, true).await?;
        }

        for victim in evicted {
            info!(sandbox_id = %victim, "evicting least-recently-used warm sandbox");
            if let Err(e) = self.substrate.remove(&victim, true).await {
                warn!(sandbox_id = %victim, error = %e, "failed to remove evicted sandbox");
            }
        }
        Ok(())
    }

    /// Ensure at least `count` stem cells exist for `runtime_kind`.
    /// Idempotent: the count is a watermark, not a delta.
    pub async fn prewarm(&self, runtime_kind: &str, count: usize) -> Result<()> {
        let existing = self.stem_cell_count(runtime_kind);
        for _ in existing..count {
            let sandbox = self.create_started(runtime_kind).await?;
            self.insert_stem_cell(runtime_kind, sandbox);
        }
        Ok(())
    }

    /// Grow or shrink the stem-cell count for a runtime. Shrinking removes
    /// only stem cells, oldest first.
    pub async fn scale(&self, runtime_kind: &str, delta: i64) -> Result<()> {
        if delta >= 0 {
            for _ in 0..delta {
                let sandbox = self.create_started(runtime_kind).await?;
                self.insert_stem_cell(runtime_kind, sandbox);
            }
            return Ok(());
        }

        let victims = {
            let mut state = self.state.lock().unwrap();
            let mut victims = Vec::new();
            if let Some(list) = state.warm.get_mut(runtime_kind) {
                let mut remaining = (-delta) as usize;
                let mut i = 0;
                while i < list.len() && remaining > 0 {
                    if list[i].initialized_action.is_none() {
                        victims.push(list.remove(i).sandbox.id);
                        remaining -= 1;
                    } else {
                        i += 1;
                    }
                }
                if list.is_empty() {
                    state.warm.remove(runtime_kind);
                }
            }
            victims
        };

        for id in victims {
            if let Err(e) = self.substrate.remove(&id, true).await {
                warn!(sandbox_id = %id, error = %e, "failed to remove stem cell while scaling down");
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        let mut warm = HashMap::new();
        let mut stem_cells = HashMap::new();
        for (kind, list) in &state.warm {
            warm.insert(kind.clone(), list.len());
            stem_cells.insert(
                kind.clone(),
                list.iter()
                    .filter(|pc| pc.initialized_action.is_none())
                    .count(),
            );
        }
        PoolStats {
            warm,
            stem_cells,
            busy: state.busy.len(),
        }
    }

    /// Remove warm sandboxes idle for longer than the configured timeout.
    /// Failures are logged; the next pass retries nothing (the entry is
    /// already gone from the pool).
    pub async fn cleanup_idle(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let expired = {
            let mut state = self.state.lock().unwrap();
            let mut expired = Vec::new();
            state.warm.retain(|_, list| {
                list.retain(|pc| {
                    if pc.last_used < cutoff {
                        expired.push(pc.sandbox.id.clone());
                        false
                    } else {
                        true
                    }
                });
                !list.is_empty()
            });
            expired
        };

        for id in expired {
            info!(sandbox_id = %id, "removing idle sandbox");
            if let Err(e) = self.substrate.remove(&id, true).await {
                warn!(sandbox_id = %id, error = %e, "failed to remove idle sandbox");
            }
        }
    }

    /// Stop the cleanup loop and destroy every warm and busy sandbox.
    /// Safe to call more than once.
    pub async fn drain(&self) {
        self.cancel.cancel();
        let task = self.cleanup_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let all = {
            let mut state = self.state.lock().unwrap();
            let mut all: Vec<String> = state
                .warm
                .drain()
                .flat_map(|(_, list)| list.into_iter().map(|pc| pc.sandbox.id))
                .collect();
            all.extend(state.busy.drain().map(|(id, _)| id));
            all
        };

        info!(count = all.len(), "draining sandbox pool");
        for id in all {
            // Give in-sandbox processes their stop grace before removal.
            if let Err(e) = self.substrate.stop(&id, STOP_GRACE).await {
                debug!(sandbox_id = %id, error = %e, "stop during drain failed");
            }
            if let Err(e) = self.substrate.remove(&id, true).await {
                warn!(sandbox_id = %id, error = %e, "failed to remove sandbox during drain");
            }
        }
    }

    fn stem_cell_count(&self, runtime_kind: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .warm
            .get(runtime_kind)
            .map(|list| {
                list.iter()
                    .filter(|pc| pc.initialized_action.is_none())
                    .count()
            })
            .unwrap_or(0)
    }

    fn insert_stem_cell(&self, runtime_kind: &str, sandbox: Sandbox) {
        let mut state = self.state.lock().unwrap();
        state
            .warm
            .entry(runtime_kind.to_string())
            .or_default()
            .push(PooledSandbox {
                sandbox,
                runtime_kind: runtime_kind.to_string(),
                last_used: Utc::now(),
                initialized_action: None,
            });
    }

    async fn create_started(&self, runtime_kind: &str) -> Result<Sandbox> {
        let spec = SandboxSpec {
            image: runtime_kind.to_string(),
            memory_bytes: 0,
            stop_timeout: STOP_GRACE,
            env: HashMap::new(),
        };

        let mut sandbox = self.substrate.create(&spec).await?;
        match self.substrate.start(&sandbox.id).await {
            Ok(addr) => {
                sandbox.addr = addr;
                sandbox.state = crate::substrate::SandboxState::Running;
                Ok(sandbox)
            }
            Err(e) => {
                // Don't leak the half-started container.
                if let Err(remove_err) = self.substrate.remove(&sandbox.id, true).await {
                    warn!(
                        sandbox_id = %sandbox.id,
                        error = %remove_err,
                        "failed to remove sandbox after start failure"
                    );
                }
                Err(e.into())
            }
        }
    }
}
