use alloy::primitives::{Address, Bytes, B256};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanPriority {
    /// Operator re-trigger: always processed first.
    Manual,
    /// Default lane for watcher-detected deployments.
    Deployment,
}

/// One scan target handed from a watcher (or a manual trigger) to the
/// orchestrator workers. Carries everything the pipeline needs so workers
/// never re-fetch what the watcher already observed.
#[derive(Clone, Debug)]
pub struct ScanRequest {
    pub address: Address,
    pub network: String,
    pub chain_id: u64,
    pub code: Bytes,
    pub code_hash: B256,
    pub deployer: Option<Address>,
    pub block_number: u64,
    pub priority: ScanPriority,
}

impl ScanRequest {
    pub fn fingerprint(&self) -> (Address, B256) {
        (self.address, self.code_hash)
    }
}

struct ScanQueueState {
    manual: VecDeque<ScanRequest>,
    deployment: VecDeque<ScanRequest>,
    queued: HashSet<(Address, B256)>,
    max_len: usize,
    closed: bool,
}

impl ScanQueueState {
    fn len(&self) -> usize {
        self.manual.len().saturating_add(self.deployment.len())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop_next(&mut self) -> Option<ScanRequest> {
        if let Some(request) = self.manual.pop_front() {
            self.queued.remove(&request.fingerprint());
            return Some(request);
        }
        if let Some(request) = self.deployment.pop_front() {
            self.queued.remove(&request.fingerprint());
            return Some(request);
        }
        None
    }

    /// Evict the newest deployment-lane work first so earlier backlog stays
    /// stable. Manual triggers are never evicted.
    fn evict_one_newest(&mut self) -> bool {
        if let Some(request) = self.deployment.pop_back() {
            self.queued.remove(&request.fingerprint());
            return true;
        }
        false
    }

    fn push(&mut self, request: ScanRequest) {
        match request.priority {
            ScanPriority::Manual => self.manual.push_back(request),
            ScanPriority::Deployment => self.deployment.push_back(request),
        }
    }
}

struct ScanQueueInner {
    state: Mutex<ScanQueueState>,
    notify: Notify,
}

#[derive(Clone)]
pub struct ScanQueueSender {
    inner: Arc<ScanQueueInner>,
}

pub struct ScanQueueReceiver {
    inner: Arc<ScanQueueInner>,
}

pub struct ScanQueue;

impl ScanQueue {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(max_len: usize) -> (ScanQueueSender, ScanQueueReceiver) {
        let max_len = std::cmp::max(1, max_len);
        let inner = Arc::new(ScanQueueInner {
            state: Mutex::new(ScanQueueState {
                manual: VecDeque::new(),
                deployment: VecDeque::new(),
                queued: HashSet::new(),
                max_len,
                closed: false,
            }),
            notify: Notify::new(),
        });
        (
            ScanQueueSender {
                inner: Arc::clone(&inner),
            },
            ScanQueueReceiver { inner },
        )
    }
}

impl ScanQueueSender {
    /// Enqueue a scan target.
    ///
    /// Returns `true` if the request was accepted, `false` if it was dropped
    /// (fingerprint already queued, queue full, or queue closed).
    pub async fn enqueue(&self, request: ScanRequest) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return false;
        }
        if state.queued.contains(&request.fingerprint()) {
            return false;
        }

        while state.len() >= state.max_len {
            let evicted = match request.priority {
                ScanPriority::Manual => state.evict_one_newest(),
                ScanPriority::Deployment => false,
            };
            if !evicted {
                return false;
            }
        }

        state.queued.insert(request.fingerprint());
        state.push(request);
        drop(state);
        self.inner.notify.notify_one();
        true
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.len()
    }

    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

impl ScanQueueReceiver {
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn recv(&mut self) -> Option<ScanRequest> {
        loop {
            let notified = {
                let mut state = self.inner.state.lock().await;
                if let Some(request) = state.pop_next() {
                    return Some(request);
                }
                if state.closed && state.is_empty() {
                    return None;
                }
                self.inner.notify.notified()
            };
            notified.await;
        }
    }
}
