// Batch Coordinator
// Collects pending requests issued against one batch, sends them as a single
// envelope and settles every member in registration order.
//
// Open -> Draining -> Executing -> Completed | Failed
//
// Draining waits for outstanding dependencies (flows that still have to
// register a request, such as an item add that first looks up its list's
// entity type). Only those dependency holders may register while draining.

use crate::client::Client;
use sprest_core::{BatchId, Error, HttpRequest, ODataError, RawResponse, RequestSeq, Result, SequenceAllocator};
use sprest_transport::retry_after;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Receives the fragment (or envelope error) for one pending request.
pub(crate) type Settle = Box<dyn FnOnce(Result<RawResponse>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    Open,
    Draining,
    Executing,
    Completed,
    Failed,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Failed)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Open => "open",
            BatchState::Draining => "draining",
            BatchState::Executing => "executing",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct PendingRequest {
    seq: RequestSeq,
    request: HttpRequest,
    settle: Settle,
}

struct BatchCore {
    state: BatchState,
    pending: Vec<PendingRequest>,
    reserved: usize,
}

struct BatchInner {
    id: BatchId,
    client: Client,
    base_url: String,
    max_size: usize,
    core: Mutex<BatchCore>,
    dependencies: watch::Sender<usize>,
    sequence: SequenceAllocator,
}

/// A batching scope. Cheap to clone; clones share the same envelope.
#[derive(Clone)]
pub struct Batch {
    inner: Arc<BatchInner>,
}

impl Batch {
    pub(crate) fn new(client: Client, base_url: String, max_size: usize) -> Self {
        let (dependencies, _) = watch::channel(0usize);
        let batch = Batch {
            inner: Arc::new(BatchInner {
                id: BatchId::new(),
                client,
                base_url,
                max_size,
                core: Mutex::new(BatchCore {
                    state: BatchState::Open,
                    pending: Vec::new(),
                    reserved: 0,
                }),
                dependencies,
                sequence: SequenceAllocator::new(),
            }),
        };
        debug!(batch_id = %batch.id(), max_size, "Batch created");
        batch
    }

    pub fn id(&self) -> BatchId {
        self.inner.id
    }

    pub fn state(&self) -> BatchState {
        self.core().state
    }

    /// Number of registered requests still waiting for `execute`.
    pub fn len(&self) -> usize {
        self.core().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    pub fn outstanding_dependencies(&self) -> usize {
        *self.inner.dependencies.borrow()
    }

    fn core(&self) -> MutexGuard<'_, BatchCore> {
        self.inner.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_error(&self, action: &str, state: BatchState) -> Error {
        Error::batch_state(self.inner.id, format!("cannot {} a batch that is {}", action, state))
    }

    fn check_accepting(&self, core: &BatchCore, action: &str) -> Result<()> {
        match core.state {
            BatchState::Open => Ok(()),
            BatchState::Draining if self.outstanding_dependencies() > 0 => Ok(()),
            state => Err(self.state_error(action, state)),
        }
    }

    fn check_capacity(&self, core: &BatchCore) -> Result<()> {
        if core.pending.len() + core.reserved >= self.inner.max_size {
            return Err(Error::batch_state(
                self.inner.id,
                format!("batch is full ({} requests)", self.inner.max_size),
            ));
        }
        Ok(())
    }

    /// Fail fast unless a request could be registered right now.
    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        let core = self.core();
        self.check_accepting(&core, "register on")
    }

    /// Reserve a position for a request that will be registered later.
    /// Must be followed by `register(Some(seq), ..)` or `release_slot`.
    pub(crate) fn reserve_slot(&self) -> Result<RequestSeq> {
        let mut core = self.core();
        self.check_accepting(&core, "register on")?;
        self.check_capacity(&core)?;
        core.reserved += 1;
        Ok(self.inner.sequence.allocate())
    }

    pub(crate) fn release_slot(&self, seq: RequestSeq) {
        let mut core = self.core();
        core.reserved = core.reserved.saturating_sub(1);
        debug!(batch_id = %self.inner.id, seq = seq.as_u64(), "Batch slot released");
    }

    pub(crate) fn register(&self, slot: Option<RequestSeq>, request: HttpRequest, settle: Settle) -> Result<RequestSeq> {
        let mut core = self.core();
        self.check_accepting(&core, "register on")?;
        let seq = match slot {
            Some(seq) => {
                core.reserved = core.reserved.saturating_sub(1);
                seq
            }
            None => {
                self.check_capacity(&core)?;
                self.inner.sequence.allocate()
            }
        };
        debug!(
            batch_id = %self.inner.id,
            seq = seq.as_u64(),
            method = %request.method,
            url = %request.url,
            "Request registered on batch"
        );
        core.pending.push(PendingRequest { seq, request, settle });
        Ok(seq)
    }

    /// Hold the batch open for a flow that still has to register. `execute`
    /// waits until every dependency is dropped or released.
    pub fn add_dependency(&self) -> Result<BatchDependency> {
        let core = self.core();
        self.check_accepting(&core, "add a dependency to")?;
        self.inner.dependencies.send_modify(|count| *count += 1);
        Ok(BatchDependency {
            batch: self.clone(),
            released: false,
        })
    }

    /// Send every registered request in one envelope and settle each of them,
    /// in registration order, before returning.
    ///
    /// An envelope-level failure (transport error, throttling exhausted,
    /// error status, undecodable body) rejects every member with the same
    /// error and is returned here as well. A spent batch cannot run again.
    pub async fn execute(&self) -> Result<()> {
        {
            let mut core = self.core();
            if core.state != BatchState::Open {
                return Err(self.state_error("execute", core.state));
            }
            core.state = BatchState::Draining;
        }

        let waiting = self.outstanding_dependencies();
        if waiting > 0 {
            debug!(batch_id = %self.inner.id, waiting, "Waiting for batch dependencies");
        }
        let mut dependencies = self.inner.dependencies.subscribe();
        if dependencies.wait_for(|count| *count == 0).await.is_err() {
            return Err(Error::batch_state(self.inner.id, "dependency channel closed"));
        }

        let mut pending = {
            let mut core = self.core();
            core.state = BatchState::Executing;
            std::mem::take(&mut core.pending)
        };
        pending.sort_by_key(|p| p.seq);

        if pending.is_empty() {
            debug!(batch_id = %self.inner.id, "Empty batch completed without a request");
            self.core().state = BatchState::Completed;
            return Ok(());
        }

        info!(batch_id = %self.inner.id, requests = pending.len(), "Executing batch");
        let requests: Vec<HttpRequest> = pending.iter().map(|p| p.request.clone()).collect();

        match self.send_envelope(&requests).await {
            Ok(fragments) => {
                for (member, fragment) in pending.into_iter().zip(fragments) {
                    let outcome = self.member_outcome(&member.request, fragment);
                    (member.settle)(outcome);
                }
                self.core().state = BatchState::Completed;
                debug!(batch_id = %self.inner.id, "Batch completed");
                Ok(())
            }
            Err(err) => {
                warn!(batch_id = %self.inner.id, error = %err, "Batch envelope failed");
                for member in pending {
                    (member.settle)(Err(err.clone()));
                }
                self.core().state = BatchState::Failed;
                Err(err)
            }
        }
    }

    /// A throttled fragment rejects its member the way an unbatched request
    /// rejects once retries are spent. The envelope itself is not resent.
    fn member_outcome(&self, request: &HttpRequest, fragment: RawResponse) -> Result<RawResponse> {
        if !self.inner.client.config().retry.is_throttled(fragment.status) {
            return Ok(fragment);
        }
        let retry_after = retry_after(&fragment);
        warn!(
            batch_id = %self.inner.id,
            url = %request.url,
            status = fragment.status,
            "Batch member throttled"
        );
        Err(Error::Throttled {
            url: request.url.clone(),
            status: fragment.status,
            attempts: 1,
            retry_after,
        })
    }

    async fn send_envelope(&self, requests: &[HttpRequest]) -> Result<Vec<RawResponse>> {
        let format = self.inner.client.batch_format();
        let endpoint = format.endpoint(&self.inner.base_url);
        let envelope = format
            .encode(&self.inner.id, &self.inner.base_url, requests)
            .map_err(|e| e.into_error(&endpoint))?;

        let response = self.inner.client.send(envelope).await?;
        if !response.is_success() {
            return Err(ODataError::from_body(response.status, &response.text(), &endpoint).into());
        }
        format.decode(&response, requests).map_err(|e| e.into_error(&endpoint))
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("Batch")
            .field("id", &self.inner.id)
            .field("state", &core.state)
            .field("pending", &core.pending.len())
            .field("dependencies", &self.outstanding_dependencies())
            .finish()
    }
}

/// Keeps a batch from sending while held. Released on drop.
#[must_use = "a dependency is released as soon as it is dropped"]
pub struct BatchDependency {
    batch: Batch,
    released: bool,
}

impl BatchDependency {
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.batch
                .inner
                .dependencies
                .send_modify(|count| *count = count.saturating_sub(1));
        }
    }
}

impl Drop for BatchDependency {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for BatchDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchDependency")
            .field("batch_id", &self.batch.id())
            .field("released", &self.released)
            .finish()
    }
}
