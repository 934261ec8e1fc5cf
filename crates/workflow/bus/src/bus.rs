//! The message bus
//!
//! `send` and `publish` enqueue without blocking. Consumer tasks drain the
//! priority queue and hand every message to the delivery lane of its
//! recipient: one lane per worker and one per subscription. A lane settles
//! its head message (delivered or dead-lettered) before it looks at the
//! next one, so retries never reorder a recipient's stream. Lanes are
//! handed messages inside the dequeue critical section and therefore
//! receive them in dequeue order.

use crate::config::BusConfig;
use crate::dead_letter::{DeadLetter, DeadLetterSink, MemoryDeadLetterLog};
use crate::error::{BusError, BusResult};
use crate::queue::PriorityQueues;
use crate::worker::{Worker, WorkerResponse};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use workflow_types::{
    AgentMessage, ChannelId, CorrelationId, DeliveryStatus, MessageId, Priority, Recipient,
    WorkerId,
};

// ── Public types ─────────────────────────────────────────────────────

/// Returned by `send` / `publish` once a message is enqueued
#[derive(Clone, Debug)]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub priority: Priority,
    /// Ids tracked in the delivery ledger; broadcast copies get their own
    pub tracked: Vec<MessageId>,
    /// Workers or subscribers the message was addressed to at enqueue time
    pub recipients: usize,
    pub enqueued_at: DateTime<Utc>,
}

/// Delivery ledger entry for one message.
///
/// A published message has one entry for all of its subscribers: it is
/// `Delivered` once every subscriber got it and `DeadLettered` as soon as
/// one copy is.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: MessageId,
    pub status: DeliveryStatus,
    pub attempts: u32,
    /// Backoff delays actually waited between attempts, in milliseconds
    pub backoffs_ms: Vec<u64>,
    pub last_error: Option<String>,
    /// Recipients whose copy is not settled yet
    pub outstanding: u32,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    fn queued(message_id: MessageId, recipients: usize) -> Self {
        Self {
            message_id,
            status: DeliveryStatus::Queued,
            attempts: 0,
            backoffs_ms: Vec::new(),
            last_error: None,
            outstanding: recipients as u32,
            updated_at: Utc::now(),
        }
    }
}

/// Events raised by the bus
#[derive(Clone, Debug)]
pub enum BusEvent {
    Delivered {
        message_id: MessageId,
        recipient: WorkerId,
        attempts: u32,
    },
    DeadLettered(DeadLetter),
    TimedOut {
        message_id: MessageId,
        correlation_id: CorrelationId,
    },
}

/// Subscription identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiving end of a channel subscription. Dropping it unsubscribes.
pub struct Subscription {
    pub id: SubscriptionId,
    pub channel: ChannelId,
    receiver: mpsc::Receiver<AgentMessage>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<AgentMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AgentMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.subscribers.write().retain(|s| s.id != self.id);
        }
    }
}

// ── Internals ────────────────────────────────────────────────────────

struct Subscriber {
    id: SubscriptionId,
    channel: ChannelId,
    /// Empty means every message type
    types: HashSet<String>,
    sender: mpsc::Sender<AgentMessage>,
}

impl Subscriber {
    fn matches(&self, channel: &ChannelId, message_type: &str) -> bool {
        &self.channel == channel && (self.types.is_empty() || self.types.contains(message_type))
    }
}

enum Route {
    Worker(WorkerId),
    /// Subscriber senders snapshotted at enqueue time
    Subscribers(Vec<(SubscriptionId, mpsc::Sender<AgentMessage>)>),
}

struct Envelope {
    message: AgentMessage,
    route: Route,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum LaneKey {
    Worker(WorkerId),
    Subscription(SubscriptionId),
}

enum Target {
    Worker(WorkerId),
    Subscriber(SubscriptionId, mpsc::Sender<AgentMessage>),
}

struct Delivery {
    message: AgentMessage,
    target: Target,
    /// Shared by every copy of one dequeued envelope
    permit: Arc<OwnedSemaphorePermit>,
}

struct Lane {
    sender: mpsc::UnboundedSender<Delivery>,
    task: JoinHandle<()>,
}

/// Result of one delivery attempt
enum Attempt {
    Done(Option<WorkerResponse>),
    Retry(String),
    /// The recipient is gone for good
    Abandon(String),
}

type PendingSender = oneshot::Sender<BusResult<AgentMessage>>;

struct BusInner {
    config: BusConfig,
    queue: PriorityQueues<Envelope>,
    workers: DashMap<WorkerId, Arc<dyn Worker>>,
    subscribers: RwLock<Vec<Subscriber>>,
    pending: DashMap<CorrelationId, PendingSender>,
    ledger: DashMap<MessageId, DeliveryRecord>,
    /// Settled ledger entries, oldest first
    settled: Mutex<VecDeque<MessageId>>,
    lanes: DashMap<LaneKey, Lane>,
    dead_letters: Arc<dyn DeadLetterSink>,
    events: broadcast::Sender<BusEvent>,
    in_flight: Arc<Semaphore>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl BusInner {
    /// Mark a ledger entry settled and evict the oldest beyond retention
    fn settle(&self, message_id: MessageId) {
        let evicted: Vec<MessageId> = {
            let mut settled = self.settled.lock();
            settled.push_back(message_id);
            let excess = settled.len().saturating_sub(self.config.ledger_retention);
            settled.drain(..excess).collect()
        };
        for message_id in evicted {
            self.ledger.remove(&message_id);
        }
    }
}

// ── Message bus ──────────────────────────────────────────────────────

/// Priority-aware, at-least-once message bus
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self::with_dead_letter_sink(config, Arc::new(MemoryDeadLetterLog::new()))
    }

    pub fn with_dead_letter_sink(config: BusConfig, sink: Arc<dyn DeadLetterSink>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = BusInner {
            queue: PriorityQueues::new(config.fairness_window),
            workers: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            pending: DashMap::new(),
            ledger: DashMap::new(),
            settled: Mutex::new(VecDeque::new()),
            lanes: DashMap::new(),
            dead_letters: sink,
            events,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            consumers: Mutex::new(Vec::new()),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Launch the consumer tasks. Calling it again is a no-op.
    pub fn start(&self) {
        let mut consumers = self.inner.consumers.lock();
        if !consumers.is_empty() {
            return;
        }
        for index in 0..self.inner.config.consumers.max(1) {
            let inner = self.inner.clone();
            consumers.push(tokio::spawn(consume(inner, index)));
        }
        info!(consumers = consumers.len(), "Message bus started");
    }

    /// Stop consuming and delivering, reject new messages and fail
    /// pending requests
    pub fn shutdown(&self) {
        self.inner.queue.close();
        for handle in self.inner.consumers.lock().drain(..) {
            handle.abort();
        }

        let lanes: Vec<LaneKey> = self.inner.lanes.iter().map(|e| e.key().clone()).collect();
        for key in lanes {
            if let Some((_, lane)) = self.inner.lanes.remove(&key) {
                lane.task.abort();
            }
        }

        let pending: Vec<CorrelationId> =
            self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for correlation_id in pending {
            if let Some((_, tx)) = self.inner.pending.remove(&correlation_id) {
                let _ = tx.send(Err(BusError::ShutDown));
            }
        }
        info!("Message bus shut down");
    }

    // ── Workers ──────────────────────────────────────────────────────

    /// Attach a worker endpoint; replaces any endpoint with the same id
    pub fn attach(&self, worker: Arc<dyn Worker>) -> WorkerId {
        let id = worker.id();
        self.inner.workers.insert(id.clone(), worker);
        debug!(worker_id = %id, "Worker attached");
        id
    }

    pub fn detach(&self, worker_id: &WorkerId) -> bool {
        let removed = self.inner.workers.remove(worker_id).is_some();
        if removed {
            debug!(worker_id = %worker_id, "Worker detached");
        }
        removed
    }

    pub fn is_attached(&self, worker_id: &WorkerId) -> bool {
        self.inner.workers.contains_key(worker_id)
    }

    // ── Point-to-point ───────────────────────────────────────────────

    /// Enqueue a message for its recipient. Never blocks.
    ///
    /// A response whose correlation id has a pending request completes
    /// that request directly.
    #[instrument(skip(self, message), fields(message_id = %message.id, priority = %message.priority))]
    pub fn send(&self, message: AgentMessage) -> BusResult<DeliveryReceipt> {
        self.check_accepting(&message)?;

        if message.is_response() {
            if let Some((_, tx)) = self.inner.pending.remove(&message.correlation_id) {
                let receipt = receipt_for(&message, vec![message.id.clone()], 1);
                let mut record = DeliveryRecord::queued(message.id.clone(), 0);
                record.status = DeliveryStatus::Delivered;
                record.attempts = 1;
                self.inner.ledger.insert(message.id.clone(), record);
                self.inner.settle(message.id.clone());

                debug!(correlation_id = %message.correlation_id, "Response matched pending request");
                let _ = tx.send(Ok(message));
                return Ok(receipt);
            }
        }

        match message.recipient.clone() {
            Recipient::Worker(worker_id) => {
                let receipt = receipt_for(&message, vec![message.id.clone()], 1);
                self.enqueue(message, Route::Worker(worker_id), 1)?;
                Ok(receipt)
            }
            Recipient::Broadcast => {
                let targets: Vec<WorkerId> =
                    self.inner.workers.iter().map(|e| e.key().clone()).collect();
                if targets.is_empty() {
                    warn!(message_type = %message.message_type, "Broadcast with no attached workers");
                }

                let mut tracked = Vec::with_capacity(targets.len());
                for worker_id in &targets {
                    let mut copy = message.clone();
                    copy.id = MessageId::generate();
                    copy.recipient = Recipient::Worker(worker_id.clone());
                    tracked.push(copy.id.clone());
                    self.enqueue(copy, Route::Worker(worker_id.clone()), 1)?;
                }
                Ok(receipt_for(&message, tracked, targets.len()))
            }
        }
    }

    // ── Pub/sub ──────────────────────────────────────────────────────

    /// Subscribe to a channel, optionally filtered by message types
    pub fn subscribe<I, S>(&self, channel: ChannelId, types: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (sender, receiver) = mpsc::channel(self.inner.config.subscriber_capacity.max(1));
        let id = SubscriptionId::generate();
        {
            let mut subs = self.inner.subscribers.write();
            subs.retain(|s| !s.sender.is_closed());
            subs.push(Subscriber {
                id: id.clone(),
                channel: channel.clone(),
                types: types.into_iter().map(Into::into).collect(),
                sender,
            });
        }
        debug!(subscription_id = %id, channel = %channel, "New subscription registered");
        Subscription {
            id,
            channel,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscription. Messages already enqueued for it still arrive.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subs = self.inner.subscribers.write();
        let before = subs.len();
        subs.retain(|s| &s.id != id);
        let removed = subs.len() != before;
        if removed {
            debug!(subscription_id = %id, "Subscription removed");
        }
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Fan a message out to the current subscribers of `channel`
    #[instrument(skip(self, message), fields(message_id = %message.id, channel = %channel))]
    pub fn publish(&self, channel: ChannelId, message: AgentMessage) -> BusResult<DeliveryReceipt> {
        let mut message = message.with_channel(channel.clone());
        message.recipient = Recipient::Broadcast;
        self.check_accepting(&message)?;

        let snapshot: Vec<(SubscriptionId, mpsc::Sender<AgentMessage>)> = self
            .inner
            .subscribers
            .read()
            .iter()
            .filter(|s| s.matches(&channel, &message.message_type) && !s.sender.is_closed())
            .map(|s| (s.id.clone(), s.sender.clone()))
            .collect();

        let receipt = receipt_for(&message, vec![message.id.clone()], snapshot.len());
        if snapshot.is_empty() {
            debug!(message_type = %message.message_type, "No subscribers for published message");
            return Ok(receipt);
        }
        let recipients = snapshot.len();
        self.enqueue(message, Route::Subscribers(snapshot), recipients)?;
        Ok(receipt)
    }

    // ── Request / response ───────────────────────────────────────────

    /// Send a request and wait for the correlated response
    #[instrument(skip(self, message), fields(message_id = %message.id, correlation_id = %message.correlation_id))]
    pub async fn request(
        &self,
        message: AgentMessage,
        timeout: Option<Duration>,
    ) -> BusResult<AgentMessage> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        self.request_handle(message)?.wait(timeout).await
    }

    /// Send a request and return a handle to its pending response
    pub fn request_handle(&self, mut message: AgentMessage) -> BusResult<PendingReply> {
        message.kind = workflow_types::MessageKind::Request;
        let correlation_id = message.correlation_id.clone();
        let message_id = message.id.clone();

        let (tx, rx) = oneshot::channel();
        match self.inner.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => return Err(BusError::DuplicateCorrelation(correlation_id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        if let Err(err) = self.send(message) {
            self.inner.pending.remove(&correlation_id);
            return Err(err);
        }

        Ok(PendingReply {
            correlation_id,
            message_id,
            receiver: Some(rx),
            inner: self.inner.clone(),
        })
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Ledger entry for a message, while it is retained
    pub fn delivery_record(&self, message_id: &MessageId) -> Option<DeliveryRecord> {
        self.inner.ledger.get(message_id).map(|r| r.clone())
    }

    pub fn ledger_len(&self) -> usize {
        self.inner.ledger.len()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.entries().await
    }

    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    /// Recipients with a live delivery lane
    pub fn active_lanes(&self) -> usize {
        self.inner.lanes.len()
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn check_accepting(&self, message: &AgentMessage) -> BusResult<()> {
        if message.hop_count > self.inner.config.max_hops {
            warn!(
                message_id = %message.id,
                hops = message.hop_count,
                "Rejecting message over hop limit"
            );
            return Err(BusError::HopLimitExceeded {
                message_id: message.id.clone(),
                hops: message.hop_count,
                max: self.inner.config.max_hops,
            });
        }
        if self.inner.queue.is_closed() {
            return Err(BusError::ShutDown);
        }
        Ok(())
    }

    fn enqueue(&self, message: AgentMessage, route: Route, recipients: usize) -> BusResult<()> {
        if !enqueue(&self.inner, message, route, recipients) {
            return Err(BusError::ShutDown);
        }
        Ok(())
    }
}

fn enqueue(inner: &BusInner, message: AgentMessage, route: Route, recipients: usize) -> bool {
    let priority = message.priority;
    let message_id = message.id.clone();
    inner.ledger.insert(
        message_id.clone(),
        DeliveryRecord::queued(message_id.clone(), recipients),
    );
    if !inner.queue.push(priority, Envelope { message, route }) {
        inner.ledger.remove(&message_id);
        return false;
    }
    debug!(message_id = %message_id, priority = %priority, "Message enqueued");
    true
}

fn receipt_for(message: &AgentMessage, tracked: Vec<MessageId>, recipients: usize) -> DeliveryReceipt {
    DeliveryReceipt {
        message_id: message.id.clone(),
        priority: message.priority,
        tracked,
        recipients,
        enqueued_at: Utc::now(),
    }
}

// ── Pending replies ──────────────────────────────────────────────────

/// Caller-side handle on an outstanding request.
///
/// Dropping the handle releases the waiting slot; the request message
/// itself is not retracted.
pub struct PendingReply {
    correlation_id: CorrelationId,
    message_id: MessageId,
    receiver: Option<oneshot::Receiver<BusResult<AgentMessage>>>,
    inner: Arc<BusInner>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Wait for the response or `timeout`, whichever comes first
    pub async fn wait(mut self, timeout: Duration) -> BusResult<AgentMessage> {
        let receiver = match self.receiver.take() {
            Some(rx) => rx,
            None => return Err(BusError::Cancelled(self.correlation_id.clone())),
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Cancelled(self.correlation_id.clone())),
            Err(_) => {
                self.inner.pending.remove(&self.correlation_id);
                if let Some(mut record) = self.inner.ledger.get_mut(&self.message_id) {
                    if record.status == DeliveryStatus::Queued {
                        record.status = DeliveryStatus::TimedOut;
                        record.updated_at = Utc::now();
                    }
                }
                let _ = self.inner.events.send(BusEvent::TimedOut {
                    message_id: self.message_id.clone(),
                    correlation_id: self.correlation_id.clone(),
                });
                warn!(
                    correlation_id = %self.correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(BusError::DeliveryTimeout {
                    correlation_id: self.correlation_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Stop waiting. Already-dispatched messages are not retracted.
    pub fn cancel(self) {
        debug!(correlation_id = %self.correlation_id, "Request cancelled by caller");
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.correlation_id);
    }
}

// ── Consumers ────────────────────────────────────────────────────────

async fn consume(inner: Arc<BusInner>, index: usize) {
    debug!(consumer = index, "Bus consumer running");
    loop {
        let permit = match inner.in_flight.clone().acquire_owned().await {
            Ok(permit) => Arc::new(permit),
            Err(_) => break,
        };

        let dispatched = inner
            .queue
            .pop_with(|priority, envelope| dispatch(&inner, priority, envelope, &permit))
            .await;
        if dispatched.is_none() {
            break;
        }
    }
    debug!(consumer = index, "Bus consumer stopped");
}

/// Runs inside the queue's critical section
fn dispatch(
    inner: &Arc<BusInner>,
    priority: Priority,
    envelope: Envelope,
    permit: &Arc<OwnedSemaphorePermit>,
) {
    let Envelope { message, route } = envelope;
    debug!(message_id = %message.id, priority = %priority, "Message dequeued");
    match route {
        Route::Worker(worker_id) => push_lane(
            inner,
            LaneKey::Worker(worker_id.clone()),
            Delivery {
                message,
                target: Target::Worker(worker_id),
                permit: permit.clone(),
            },
        ),
        Route::Subscribers(targets) => {
            for (subscription_id, sender) in targets {
                push_lane(
                    inner,
                    LaneKey::Subscription(subscription_id.clone()),
                    Delivery {
                        message: message.clone(),
                        target: Target::Subscriber(subscription_id, sender),
                        permit: permit.clone(),
                    },
                );
            }
        }
    }
}

fn push_lane(inner: &Arc<BusInner>, key: LaneKey, delivery: Delivery) {
    match inner.lanes.entry(key) {
        Entry::Occupied(lane) => {
            if let Err(mpsc::error::SendError(delivery)) = lane.get().sender.send(delivery) {
                debug!(message_id = %delivery.message.id, "Delivery lane closed");
            }
        }
        Entry::Vacant(slot) => {
            let (sender, receiver) = mpsc::unbounded_channel();
            // The receiver is alive, so this cannot fail
            let _ = sender.send(delivery);
            let task = tokio::spawn(run_lane(inner.clone(), slot.key().clone(), receiver));
            slot.insert(Lane { sender, task });
        }
    }
}

/// Deliver a recipient's messages one at a time, in arrival order.
/// The lane retires itself once it runs dry.
async fn run_lane(inner: Arc<BusInner>, key: LaneKey, mut receiver: mpsc::UnboundedReceiver<Delivery>) {
    loop {
        match receiver.try_recv() {
            Ok(delivery) => deliver(&inner, delivery).await,
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {
                // Pushes hold the map entry, so nothing can slip in between
                // the emptiness check and the removal
                if inner
                    .lanes
                    .remove_if(&key, |_, _| receiver.is_empty())
                    .is_some()
                {
                    break;
                }
            }
        }
    }
}

async fn deliver(inner: &BusInner, delivery: Delivery) {
    let Delivery {
        mut message,
        target,
        permit: _permit,
    } = delivery;
    let policy = inner.config.retry.clone();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        message.retry_count = attempts - 1;

        let reason = match attempt(inner, &target, &message).await {
            Attempt::Done(response) => {
                record_delivered(inner, &message.id, attempts);
                if let Target::Worker(worker_id) = &target {
                    debug!(message_id = %message.id, worker_id = %worker_id, attempts, "Message delivered");
                    let _ = inner.events.send(BusEvent::Delivered {
                        message_id: message.id.clone(),
                        recipient: worker_id.clone(),
                        attempts,
                    });
                    if let (true, Some(response)) = (message.is_request(), response) {
                        complete_request(inner, &message, worker_id, response);
                    }
                }
                return;
            }
            Attempt::Abandon(reason) => {
                record_failure(inner, &message.id, attempts, &reason);
                dead_letter(inner, message, attempts, reason).await;
                return;
            }
            Attempt::Retry(reason) => reason,
        };

        record_failure(inner, &message.id, attempts, &reason);
        if !policy.should_retry(attempts) {
            dead_letter(inner, message, attempts, reason).await;
            return;
        }

        let delay = policy.jittered_delay_for(attempts);
        warn!(
            message_id = %message.id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "Delivery failed, retrying"
        );
        if let Some(mut record) = inner.ledger.get_mut(&message.id) {
            record.backoffs_ms.push(delay.as_millis() as u64);
        }
        tokio::time::sleep(delay).await;
    }
}

async fn attempt(inner: &BusInner, target: &Target, message: &AgentMessage) -> Attempt {
    let attempt_timeout = inner.config.attempt_timeout();
    match target {
        Target::Worker(worker_id) => {
            let Some(worker) = inner.workers.get(worker_id).map(|w| w.value().clone()) else {
                return Attempt::Retry(format!("no worker attached as {}", worker_id));
            };
            match tokio::time::timeout(attempt_timeout, worker.handle(message)).await {
                Ok(Ok(response)) => Attempt::Done(Some(response)),
                Ok(Err(err)) => Attempt::Retry(err.to_string()),
                Err(_) => Attempt::Retry(format!(
                    "handler exceeded {}ms",
                    attempt_timeout.as_millis()
                )),
            }
        }
        // Waits for room instead of dropping; a subscriber that stays full
        // for the whole attempt counts as a failed attempt
        Target::Subscriber(subscription_id, sender) => {
            match tokio::time::timeout(attempt_timeout, sender.send(message.clone())).await {
                Ok(Ok(())) => Attempt::Done(None),
                Ok(Err(_)) => Attempt::Abandon(format!("subscription {} closed", subscription_id)),
                Err(_) => Attempt::Retry(format!(
                    "subscription {} full for {}ms",
                    subscription_id,
                    attempt_timeout.as_millis()
                )),
            }
        }
    }
}

fn record_delivered(inner: &BusInner, message_id: &MessageId, attempts: u32) {
    let settled = match inner.ledger.get_mut(message_id) {
        Some(mut record) => {
            record.attempts = record.attempts.max(attempts);
            record.outstanding = record.outstanding.saturating_sub(1);
            if record.outstanding == 0 && record.status == DeliveryStatus::Queued {
                record.status = DeliveryStatus::Delivered;
            }
            record.updated_at = Utc::now();
            record.outstanding == 0
        }
        None => false,
    };
    if settled {
        inner.settle(message_id.clone());
    }
}

fn record_failure(inner: &BusInner, message_id: &MessageId, attempts: u32, reason: &str) {
    if let Some(mut record) = inner.ledger.get_mut(message_id) {
        record.attempts = record.attempts.max(attempts);
        record.last_error = Some(reason.to_string());
        record.updated_at = Utc::now();
    }
}

fn complete_request(
    inner: &BusInner,
    request: &AgentMessage,
    worker_id: &WorkerId,
    response: WorkerResponse,
) {
    let reply = request.reply(worker_id.as_str(), response.to_value());

    if let Some((_, tx)) = inner.pending.remove(&request.correlation_id) {
        let _ = tx.send(Ok(reply));
        return;
    }

    // Nobody waiting: hand the response to the requester's endpoint
    let requester = WorkerId::new(request.sender.clone());
    if inner.workers.contains_key(&requester) {
        if !enqueue(inner, reply, Route::Worker(requester), 1) {
            debug!(correlation_id = %request.correlation_id, "Bus closed before the response could be routed");
        }
    } else {
        debug!(
            correlation_id = %request.correlation_id,
            "Response arrived with no pending request"
        );
    }
}

async fn dead_letter(inner: &BusInner, message: AgentMessage, attempts: u32, reason: String) {
    let settled = match inner.ledger.get_mut(&message.id) {
        Some(mut record) => {
            record.status = DeliveryStatus::DeadLettered;
            record.outstanding = record.outstanding.saturating_sub(1);
            record.updated_at = Utc::now();
            record.outstanding == 0
        }
        None => false,
    };
    if settled {
        inner.settle(message.id.clone());
    }

    warn!(
        message_id = %message.id,
        attempts,
        error = %reason,
        "Message dead-lettered"
    );

    if message.is_request() {
        if let Some((_, tx)) = inner.pending.remove(&message.correlation_id) {
            let _ = tx.send(Err(BusError::DeadLetter {
                message_id: message.id.clone(),
                attempts,
                reason: reason.clone(),
            }));
        }
    }

    let mut parked = message;
    parked.delivery_status = DeliveryStatus::DeadLettered;
    let letter = DeadLetter {
        message: parked,
        attempts,
        reason,
        dead_lettered_at: Utc::now(),
    };
    inner.dead_letters.record(letter.clone()).await;
    let _ = inner.events.send(BusEvent::DeadLettered(letter));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{WorkerError, WorkerResponse};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use workflow_types::CapabilityTag;

    struct EchoWorker {
        id: &'static str,
    }

    #[async_trait]
    impl Worker for EchoWorker {
        fn id(&self) -> WorkerId {
            WorkerId::new(self.id)
        }

        fn capabilities(&self) -> BTreeSet<CapabilityTag> {
            BTreeSet::from([CapabilityTag::new("echo")])
        }

        async fn handle(&self, message: &AgentMessage) -> Result<WorkerResponse, WorkerError> {
            Ok(WorkerResponse::success(message.payload.clone()))
        }
    }

    struct FlakyWorker {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl Worker for FlakyWorker {
        fn id(&self) -> WorkerId {
            WorkerId::new("flaky")
        }

        fn capabilities(&self) -> BTreeSet<CapabilityTag> {
            BTreeSet::new()
        }

        async fn handle(&self, _message: &AgentMessage) -> Result<WorkerResponse, WorkerError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(WorkerError::new("temporarily unavailable"));
            }
            Ok(WorkerResponse::success(serde_json::json!({"ok": true})))
        }
    }

    fn request_to(worker: &str, payload: serde_json::Value) -> AgentMessage {
        AgentMessage::request("tester", Recipient::worker(worker), "echo", payload)
    }

    #[tokio::test]
    async fn test_request_response() {
        let bus = MessageBus::new(BusConfig::default());
        bus.attach(Arc::new(EchoWorker { id: "echo-1" }));
        bus.start();

        let request = request_to("echo-1", serde_json::json!({"n": 1}));
        let correlation_id = request.correlation_id.clone();
        let response = bus
            .request(request, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(response.correlation_id, correlation_id);
        let decoded = WorkerResponse::from_message(&response).unwrap();
        assert_eq!(decoded.payload, serde_json::json!({"n": 1}));
        assert_eq!(bus.pending_requests(), 0);
        bus.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_deliver() {
        let bus = MessageBus::new(BusConfig::default());
        bus.attach(Arc::new(FlakyWorker {
            failures_left: AtomicU32::new(1),
        }));
        bus.start();

        let request = request_to("flaky", serde_json::Value::Null);
        let message_id = request.id.clone();
        let response = bus.request(request, None).await.unwrap();
        assert!(WorkerResponse::from_message(&response).unwrap().is_success());

        let record = bus.delivery_record(&message_id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.backoffs_ms.len(), 1);
        bus.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_to_unknown_worker_dead_letters() {
        let bus = MessageBus::new(BusConfig::default());
        bus.start();

        let err = bus
            .request(request_to("nobody", serde_json::Value::Null), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::DeadLetter { attempts: 3, .. }));
        assert_eq!(bus.dead_letters().await.len(), 1);
        bus.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_marks_timed_out() {
        let bus = MessageBus::new(BusConfig::default());
        // Not started: the request is never consumed
        let request = request_to("echo-1", serde_json::Value::Null);
        let message_id = request.id.clone();

        let err = bus
            .request(request, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::DeliveryTimeout { timeout_ms: 50, .. }));
        assert_eq!(
            bus.delivery_record(&message_id).unwrap().status,
            DeliveryStatus::TimedOut
        );
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_correlation_rejected() {
        let bus = MessageBus::new(BusConfig::default());
        let first = request_to("w", serde_json::Value::Null);
        let second = request_to("w", serde_json::Value::Null)
            .with_correlation(first.correlation_id.clone());

        let _pending = bus.request_handle(first).unwrap();
        assert!(matches!(
            bus.request_handle(second),
            Err(BusError::DuplicateCorrelation(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_releases_slot() {
        let bus = MessageBus::new(BusConfig::default());
        let pending = bus.request_handle(request_to("w", serde_json::Value::Null)).unwrap();
        assert_eq!(bus.pending_requests(), 1);
        pending.cancel();
        assert_eq!(bus.pending_requests(), 0);
        // the request itself stays enqueued
        assert_eq!(bus.queue_depth(), 1);
    }

    #[tokio::test]
    async fn test_hop_limit() {
        let bus = MessageBus::new(BusConfig {
            max_hops: 1,
            ..Default::default()
        });
        let msg = AgentMessage::new("a", Recipient::worker("b"), "handoff", serde_json::Value::Null);
        let hop1 = msg.forwarded("b", WorkerId::new("c"));
        let hop2 = hop1.forwarded("c", WorkerId::new("d"));

        assert!(bus.send(hop1).is_ok());
        assert!(matches!(
            bus.send(hop2),
            Err(BusError::HopLimitExceeded { hops: 2, max: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_subscription_snapshot_at_enqueue() {
        let bus = MessageBus::new(BusConfig::default());
        let channel = ChannelId::new("orders");

        let mut early = bus.subscribe(channel.clone(), Vec::<String>::new());
        let receipt = bus
            .publish(
                channel.clone(),
                AgentMessage::new("engine", Recipient::Broadcast, "order.created", serde_json::json!(1)),
            )
            .unwrap();
        assert_eq!(receipt.recipients, 1);

        // Subscribed after the publish: must not see it
        let mut late = bus.subscribe(channel.clone(), Vec::<String>::new());
        // Unsubscribed after the publish: still receives it
        assert!(bus.unsubscribe(&early.id));

        bus.start();
        let got = early.recv().await.unwrap();
        assert_eq!(got.message_type, "order.created");
        assert_eq!(got.channel, channel);

        bus.publish(
            channel.clone(),
            AgentMessage::new("engine", Recipient::Broadcast, "order.paid", serde_json::json!(2)),
        )
        .unwrap();
        let got = late.recv().await.unwrap();
        assert_eq!(got.message_type, "order.paid");
        assert!(late.try_recv().is_none());
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_subscription_type_filter() {
        let bus = MessageBus::new(BusConfig::default());
        let channel = ChannelId::new("orders");
        let mut paid_only = bus.subscribe(channel.clone(), ["order.paid"]);

        let skipped = bus
            .publish(
                channel.clone(),
                AgentMessage::new("engine", Recipient::Broadcast, "order.created", serde_json::Value::Null),
            )
            .unwrap();
        assert_eq!(skipped.recipients, 0);

        bus.publish(
            channel.clone(),
            AgentMessage::new("engine", Recipient::Broadcast, "order.paid", serde_json::Value::Null),
        )
        .unwrap();
        bus.start();
        assert_eq!(paid_only.recv().await.unwrap().message_type, "order.paid");
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_fanout_preserves_fifo() {
        let bus = MessageBus::new(BusConfig::default());
        let channel = ChannelId::new("instance.events");
        let mut sub = bus.subscribe(channel.clone(), Vec::<String>::new());

        for i in 0..20 {
            bus.publish(
                channel.clone(),
                AgentMessage::new("engine", Recipient::Broadcast, "transition", serde_json::json!(i)),
            )
            .unwrap();
        }
        bus.start();

        for i in 0..20 {
            assert_eq!(sub.recv().await.unwrap().payload, serde_json::json!(i));
        }
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let bus = MessageBus::new(BusConfig::default());
        bus.start();
        bus.shutdown();
        let msg = AgentMessage::new("a", Recipient::worker("b"), "x", serde_json::Value::Null);
        assert!(matches!(bus.send(msg), Err(BusError::ShutDown)));
    }

    #[tokio::test]
    async fn test_broadcast_copies_per_worker() {
        let bus = MessageBus::new(BusConfig::default());
        bus.attach(Arc::new(EchoWorker { id: "a" }));
        bus.attach(Arc::new(EchoWorker { id: "b" }));

        let receipt = bus
            .send(AgentMessage::new("engine", Recipient::Broadcast, "ping", serde_json::Value::Null))
            .unwrap();
        assert_eq!(receipt.recipients, 2);
        assert_eq!(receipt.tracked.len(), 2);
        assert_eq!(bus.queue_depth(), 2);
    }

    /// Fails the first attempt at each payload and records what got through
    struct OrderedWorker {
        failed: Mutex<HashSet<String>>,
        seen: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Worker for OrderedWorker {
        fn id(&self) -> WorkerId {
            WorkerId::new("ordered")
        }

        fn capabilities(&self) -> BTreeSet<CapabilityTag> {
            BTreeSet::new()
        }

        async fn handle(&self, message: &AgentMessage) -> Result<WorkerResponse, WorkerError> {
            if self.failed.lock().insert(message.payload.to_string()) {
                return Err(WorkerError::new("first try fails"));
            }
            self.seen.lock().push(message.payload.clone());
            Ok(WorkerResponse::success(serde_json::Value::Null))
        }
    }

    async fn until<F: Fn() -> bool>(done: F) {
        for _ in 0..1_000 {
            if done() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    async fn next_dead_letter(events: &mut broadcast::Receiver<BusEvent>) -> DeadLetter {
        loop {
            if let BusEvent::DeadLettered(letter) = events.recv().await.unwrap() {
                return letter;
            }
        }
    }

    fn status_of(bus: &MessageBus, id: &MessageId) -> Option<DeliveryStatus> {
        bus.delivery_record(id).map(|r| r.status)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_reorder_worker_stream() {
        let bus = MessageBus::new(BusConfig::default());
        let worker = Arc::new(OrderedWorker {
            failed: Mutex::new(HashSet::new()),
            seen: Mutex::new(Vec::new()),
        });
        bus.attach(worker.clone());
        bus.start();

        for i in 0..3 {
            bus.send(AgentMessage::new("engine", Recipient::worker("ordered"), "step", serde_json::json!(i)))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            *worker.seen.lock(),
            vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)]
        );
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_slow_subscriber_gets_every_message() {
        let bus = MessageBus::new(BusConfig {
            subscriber_capacity: 1,
            ..Default::default()
        });
        let channel = ChannelId::new("audit");
        let mut sub = bus.subscribe(channel.clone(), Vec::<String>::new());

        let ids: Vec<MessageId> = (0..3)
            .map(|i| {
                bus.publish(
                    channel.clone(),
                    AgentMessage::new("engine", Recipient::Broadcast, "audit", serde_json::json!(i)),
                )
                .unwrap()
                .message_id
            })
            .collect();
        bus.start();

        for i in 0..3 {
            assert_eq!(sub.recv().await.unwrap().payload, serde_json::json!(i));
        }
        until(|| ids.iter().all(|id| status_of(&bus, id) == Some(DeliveryStatus::Delivered))).await;
        assert!(bus.dead_letters().await.is_empty());
        bus.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_subscriber_dead_letters_instead_of_dropping() {
        let bus = MessageBus::new(BusConfig {
            subscriber_capacity: 1,
            ..Default::default()
        });
        let channel = ChannelId::new("audit");
        // Held but never read
        let _sub = bus.subscribe(channel.clone(), Vec::<String>::new());
        let mut events = bus.events();

        let first = bus
            .publish(channel.clone(), AgentMessage::new("engine", Recipient::Broadcast, "audit", serde_json::json!(0)))
            .unwrap();
        let second = bus
            .publish(channel.clone(), AgentMessage::new("engine", Recipient::Broadcast, "audit", serde_json::json!(1)))
            .unwrap();
        bus.start();

        let letter = next_dead_letter(&mut events).await;
        assert_eq!(letter.message.id, second.message_id);
        assert_eq!(letter.attempts, 3);
        assert!(letter.reason.contains("full"));

        assert_eq!(status_of(&bus, &first.message_id), Some(DeliveryStatus::Delivered));
        let record = bus.delivery_record(&second.message_id).unwrap();
        assert_eq!(record.status, DeliveryStatus::DeadLettered);
        assert_eq!(record.outstanding, 0);
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_closed_subscriber_copy_dead_letters() {
        let bus = MessageBus::new(BusConfig::default());
        let channel = ChannelId::new("audit");
        let sub = bus.subscribe(channel.clone(), Vec::<String>::new());
        let mut events = bus.events();

        let receipt = bus
            .publish(channel.clone(), AgentMessage::new("engine", Recipient::Broadcast, "audit", serde_json::Value::Null))
            .unwrap();
        drop(sub);
        bus.start();

        let letter = next_dead_letter(&mut events).await;
        assert_eq!(letter.message.id, receipt.message_id);
        assert_eq!(letter.attempts, 1);
        assert_eq!(status_of(&bus, &receipt.message_id), Some(DeliveryStatus::DeadLettered));
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_dropped_subscription_unsubscribes() {
        let bus = MessageBus::new(BusConfig::default());
        let channel = ChannelId::new("audit");
        let kept = bus.subscribe(channel.clone(), Vec::<String>::new());
        let dropped = bus.subscribe(channel.clone(), Vec::<String>::new());
        assert_eq!(bus.subscription_count(), 2);

        drop(dropped);
        assert_eq!(bus.subscription_count(), 1);

        let receipt = bus
            .publish(channel, AgentMessage::new("engine", Recipient::Broadcast, "audit", serde_json::Value::Null))
            .unwrap();
        assert_eq!(receipt.recipients, 1);
        drop(kept);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_ledger_retention_evicts_oldest_settled() {
        let bus = MessageBus::new(BusConfig {
            ledger_retention: 2,
            ..Default::default()
        });
        bus.attach(Arc::new(EchoWorker { id: "echo-1" }));

        let ids: Vec<MessageId> = (0..3)
            .map(|i| {
                bus.send(AgentMessage::new("engine", Recipient::worker("echo-1"), "tick", serde_json::json!(i)))
                    .unwrap()
                    .message_id
            })
            .collect();
        // Nothing settles before the bus runs
        assert_eq!(bus.ledger_len(), 3);
        bus.start();

        until(|| status_of(&bus, &ids[2]) == Some(DeliveryStatus::Delivered)).await;
        assert!(bus.delivery_record(&ids[0]).is_none());
        assert_eq!(status_of(&bus, &ids[1]), Some(DeliveryStatus::Delivered));
        assert_eq!(bus.ledger_len(), 2);

        // The idle lane retires itself
        until(|| bus.active_lanes() == 0).await;
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_matched_response_is_recorded() {
        let bus = MessageBus::new(BusConfig::default());
        let request = request_to("w", serde_json::Value::Null);
        let response = request.reply("w", serde_json::json!({"status": "success"}));
        let pending = bus.request_handle(request).unwrap();

        let receipt = bus.send(response).unwrap();
        let record = bus.delivery_record(&receipt.message_id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.outstanding, 0);

        let got = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.id, receipt.message_id);
    }
}
