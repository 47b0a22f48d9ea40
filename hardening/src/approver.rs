//! Approval of agents performing their initial connection.

use crate::Error;
use async_trait::async_trait;
use bastion_persistence::{AgentStore, AuthStatus};
use futures::channel::oneshot;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Waits for an operator or policy to authorize an agent.
#[async_trait]
pub trait Approver: Send + Sync + 'static {
    /// Block until `agent_id` is approved, denied, or `context` is cancelled.
    async fn wait_for_auth(&self, context: &CancellationToken, agent_id: &str)
        -> Result<(), Error>;
}

/// Outcome of an approval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
    Block,
}

impl Decision {
    fn into_result(self) -> Result<(), Error> {
        match self {
            Self::Approve => Ok(()),
            Self::Deny => Err(Error::Denied),
            Self::Block => Err(Error::Blocked),
        }
    }
}

struct Waiter {
    id: u64,
    sender: oneshot::Sender<Decision>,
}

/// In-process [Approver] resolved through [Registry::resolve] or [Registry::sync].
///
/// Several connections may wait for the same agent. A resolution wakes all of them and later
/// resolutions of the same agent are no-ops until a new wait begins.
#[derive(Default)]
pub struct Registry {
    next: AtomicU64,
    pending: Mutex<HashMap<String, Vec<Waiter>>>,
}

/// Removes a waiter when its wait ends, however it ends.
struct Registration<'a> {
    registry: &'a Registry,
    agent_id: &'a str,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.deregister(self.agent_id, self.id);
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, agent_id: &str) -> (u64, oneshot::Receiver<Decision>) {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_default()
            .push(Waiter { id, sender });
        (id, receiver)
    }

    fn deregister(&self, agent_id: &str, id: u64) {
        let mut pending = self.pending.lock().unwrap();
        let Some(waiters) = pending.get_mut(agent_id) else {
            return;
        };
        waiters.retain(|waiter| waiter.id != id);
        if waiters.is_empty() {
            pending.remove(agent_id);
        }
    }

    /// Resolve all waits for `agent_id`. Returns the number of waits resolved.
    pub fn resolve(&self, agent_id: &str, decision: Decision) -> usize {
        let waiters = self.pending.lock().unwrap().remove(agent_id);
        let Some(waiters) = waiters else {
            return 0;
        };
        let mut resolved = 0;
        for waiter in waiters {
            if waiter.sender.send(decision).is_ok() {
                resolved += 1;
            }
        }
        debug!(agent_id, ?decision, resolved, "resolved approval");
        resolved
    }

    /// Agents with at least one pending wait, sorted.
    pub fn pending(&self) -> Vec<String> {
        let mut agents: Vec<_> = self.pending.lock().unwrap().keys().cloned().collect();
        agents.sort();
        agents
    }

    /// Resolve pending waits from the authorization status in `store`.
    ///
    /// Authorized agents are approved and blocked agents are blocked. Agents without a record
    /// are denied. Unauthorized agents keep waiting. Returns the number of waits resolved.
    pub async fn sync(&self, store: &dyn AgentStore) -> Result<usize, Error> {
        let mut resolved = 0;
        for agent_id in self.pending() {
            let decision = match store.find_agent_by_hash(&agent_id).await? {
                None => Decision::Deny,
                Some(record) => match record.auth_status {
                    AuthStatus::Authorized => Decision::Approve,
                    AuthStatus::Blocked => Decision::Block,
                    AuthStatus::Unauthorized => continue,
                },
            };
            resolved += self.resolve(&agent_id, decision);
        }
        Ok(resolved)
    }
}

#[async_trait]
impl Approver for Registry {
    async fn wait_for_auth(
        &self,
        context: &CancellationToken,
        agent_id: &str,
    ) -> Result<(), Error> {
        let (id, receiver) = self.register(agent_id);
        let _registration = Registration {
            registry: self,
            agent_id,
            id,
        };
        debug!(agent_id, "waiting for approval");
        tokio::select! {
            _ = context.cancelled() => Err(Error::Cancelled),
            decision = receiver => decision.map_err(|_| Error::Closed)?.into_result(),
        }
    }
}
