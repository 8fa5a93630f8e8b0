// ABOUTME: In-memory substrate for tests; no container daemon required
// ABOUTME: Records lifecycle calls and serves caller-seeded multiplexed log frames

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::logs::encode_frame;
use crate::substrate::{Result, Sandbox, SandboxSpec, SandboxState, Substrate, SubstrateError};

#[derive(Default)]
struct FakeState {
    next_id: u64,
    live: HashMap<String, Sandbox>,
    logs: HashMap<String, Vec<u8>>,
    removed: Vec<String>,
    created: u64,
    fail_next_create: bool,
}

/// Substrate double backed by plain maps.
pub struct FakeSubstrate {
    state: Mutex<FakeState>,
    /// Address every fake sandbox reports; tests point this at localhost.
    addr: String,
}

impl FakeSubstrate {
    pub fn new() -> Arc<Self> {
        Self::with_addr("10.0.0.1")
    }

    pub fn with_addr(addr: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            addr: addr.to_string(),
        })
    }

    /// Seed one framed log line for a sandbox.
    pub fn push_log(&self, sandbox_id: &str, stream: u8, timestamp: DateTime<Utc>, message: &str) {
        let payload = format!(
            "{} {}\n",
            timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            message
        );
        let mut state = self.state.lock().unwrap();
        let buf = state.logs.entry(sandbox_id.to_string()).or_default();
        encode_frame(stream, payload.as_bytes(), buf);
    }

    pub fn created_count(&self) -> u64 {
        self.state.lock().unwrap().created
    }

    pub fn removed_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().live.keys().cloned().collect()
    }

    pub fn fail_next_create(&self) {
        self.state.lock().unwrap().fail_next_create = true;
    }

    /// Register a pre-existing sandbox, as if left over from a crashed
    /// invoker.
    pub fn seed_leftover(&self, id: &str, runtime_kind: &str) {
        let mut state = self.state.lock().unwrap();
        state.live.insert(
            id.to_string(),
            Sandbox {
                id: id.to_string(),
                addr: self.addr.clone(),
                state: SandboxState::Running,
                runtime_kind: runtime_kind.to_string(),
                created_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl Substrate for FakeSubstrate {
    async fn ensure_network(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<Sandbox> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_create {
            state.fail_next_create = false;
            return Err(SubstrateError::Create("injected create failure".to_string()));
        }

        state.next_id += 1;
        state.created += 1;
        let sandbox = Sandbox {
            id: format!("sbx-{}", state.next_id),
            addr: String::new(),
            state: SandboxState::Created,
            runtime_kind: spec.image.clone(),
            created_at: Utc::now(),
        };
        state.live.insert(sandbox.id.clone(), sandbox.clone());
        Ok(sandbox)
    }

    async fn start(&self, id: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let sandbox = state.live.get_mut(id).ok_or_else(|| SubstrateError::Start {
            id: id.to_string(),
            reason: "no such sandbox".to_string(),
        })?;
        sandbox.state = SandboxState::Running;
        sandbox.addr = self.addr.clone();
        Ok(self.addr.clone())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(sandbox) = state.live.get_mut(id) {
            sandbox.state = SandboxState::Stopped;
        }
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.live.remove(id).is_some() {
            state.removed.push(id.to_string());
        }
        Ok(())
    }

    async fn raw_logs(&self, id: &str, _since: DateTime<Utc>) -> Result<Vec<u8>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_sandboxes(&self, _filters: &HashMap<String, String>) -> Result<Vec<Sandbox>> {
        Ok(self.state.lock().unwrap().live.values().cloned().collect())
    }
}
