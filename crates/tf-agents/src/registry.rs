use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("loop not found: `{0}`")]
    LoopNotFound(String),
    #[error("duplicate loop name: `{0}`")]
    DuplicateLoop(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

// ---------------------------------------------------------------------------
// RunFlag
// ---------------------------------------------------------------------------

/// Shared `running` flag injected into a loop. Flipping it to false lets the
/// loop finish its current cycle and exit.
#[derive(Debug, Clone)]
pub struct RunFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl RunFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_running(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn stop(&self) {
        self.tx.send_replace(false);
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|running| !*running).await;
    }
}

// ---------------------------------------------------------------------------
// LoopHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Controller,
    Worker,
    Generic,
}

#[derive(Debug)]
pub struct LoopHandle {
    pub name: String,
    pub kind: LoopKind,
    pub flag: RunFlag,
    join: Option<JoinHandle<()>>,
}

impl LoopHandle {
    /// False for loops registered without a spawned task.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_some_and(|j| j.is_finished())
    }

    /// Wait for the loop task to exit. A panicked loop is logged, not
    /// propagated.
    pub async fn join(mut self) {
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(name = %self.name, error = %e, "loop task ended abnormally");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LoopRegistry
// ---------------------------------------------------------------------------

/// Owns one [`LoopHandle`] per running loop, keyed by name.
#[derive(Debug, Default)]
pub struct LoopRegistry {
    loops: HashMap<String, LoopHandle>,
}

impl LoopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loop that is driven elsewhere. Returns the flag to hand it.
    pub fn register(&mut self, name: impl Into<String>, kind: LoopKind) -> Result<RunFlag> {
        let name = name.into();
        if self.loops.contains_key(&name) {
            return Err(RegistryError::DuplicateLoop(name));
        }
        let flag = RunFlag::new();
        debug!(name = %name, kind = ?kind, "loop registered");
        self.loops.insert(
            name.clone(),
            LoopHandle {
                name,
                kind,
                flag: flag.clone(),
                join: None,
            },
        );
        Ok(flag)
    }

    /// Register a loop and spawn it on the tokio runtime.
    pub fn spawn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        kind: LoopKind,
        run: F,
    ) -> Result<RunFlag>
    where
        F: FnOnce(RunFlag) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let flag = self.register(name.clone(), kind)?;
        let join = tokio::spawn(run(flag.clone()));
        if let Some(handle) = self.loops.get_mut(&name) {
            handle.join = Some(join);
        }
        info!(name = %name, kind = ?kind, "loop spawned");
        Ok(flag)
    }

    /// Remove a loop from the registry, stopping it first.
    pub fn deregister(&mut self, name: &str) -> Result<LoopHandle> {
        let handle = self
            .loops
            .remove(name)
            .ok_or_else(|| RegistryError::LoopNotFound(name.to_string()))?;
        handle.flag.stop();
        debug!(name = %name, "loop deregistered");
        Ok(handle)
    }

    pub fn stop(&self, name: &str) -> Result<()> {
        let handle = self
            .loops
            .get(name)
            .ok_or_else(|| RegistryError::LoopNotFound(name.to_string()))?;
        handle.flag.stop();
        info!(name = %name, "loop stop requested");
        Ok(())
    }

    pub fn stop_all(&self) {
        for handle in self.loops.values() {
            handle.flag.stop();
        }
        info!(count = self.loops.len(), "all loops stop requested");
    }

    /// False for unknown names.
    pub fn is_running(&self, name: &str) -> bool {
        self.loops
            .get(name)
            .is_some_and(|h| h.flag.is_running() && !h.is_finished())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loops.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Drain the registry and wait for every spawned loop to exit.
    pub async fn join_all(&mut self) {
        for (_, handle) in self.loops.drain() {
            handle.join().await;
        }
    }
}
