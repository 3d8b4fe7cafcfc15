// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The event processor: a single-consumer dispatch pipeline
//!
//! Producers (the client's variation/track/identify paths) push input
//! events into a bounded inbox with a non-blocking offer; when the inbox is
//! full the event is dropped and counted, never blocking the caller. One
//! dispatcher task owns all pipeline state (buffer, summarizer, context
//! window), so per-event logic needs no locks. Flushes snapshot the state
//! and hand the payload to a fixed pool of sender workers; when every
//! worker is busy the snapshot is folded back in and retried on the next
//! flush.
//!
//! If the dispatcher task ever terminates abnormally, a supervisor flips
//! the closed flag so producers stop enqueueing and shutdown waiters are
//! released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::events::dedup::ContextKeyDeduplicator;
use crate::events::diagnostics::DiagnosticsManager;
use crate::events::output::EventOutputFormatter;
use crate::events::sender::{EventPayloadKind, EventSender};
use crate::events::summarizer::EventSummarizer;
use crate::events::{now_millis, BaseEvent, EventsConfig, FeatureRequestEvent, InputEvent};

#[derive(Debug)]
enum DispatcherMessage {
    Event(Box<InputEvent>),
    Flush,
    FlushUsers,
    Diagnostic,
    /// Test/shutdown barrier: replied to once all sender workers are idle.
    Sync(oneshot::Sender<()>),
    /// Final flush, drain, and exit.
    Shutdown(oneshot::Sender<()>),
}

/// The producer-facing handle. Cheap to share; all real work happens on the
/// dispatcher task.
pub struct EventProcessor {
    inbox: mpsc::Sender<DispatcherMessage>,
    inbox_full_warned: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    disabled: Arc<AtomicBool>,
    dropped_events: Arc<AtomicU64>,
    last_known_past_time: Arc<AtomicU64>,
    periodic_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventProcessor {
    pub fn new(
        config: EventsConfig,
        sender: Arc<EventSender>,
        diagnostics: Option<Arc<Mutex<DiagnosticsManager>>>,
    ) -> EventProcessor {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let disabled = Arc::new(AtomicBool::new(false));
        let dropped_events = Arc::new(AtomicU64::new(0));
        let last_known_past_time = Arc::new(AtomicU64::new(0));
        let pool_size = config.sender_pool_size.max(1);

        let dispatcher = Dispatcher {
            capacity: config.capacity.max(1),
            formatter: EventOutputFormatter::new(
                config.all_attributes_private,
                config.private_attributes.clone(),
            ),
            summarizer: EventSummarizer::new(),
            buffer: Vec::new(),
            dedup: ContextKeyDeduplicator::new(config.context_keys_capacity),
            dropped_events: Arc::clone(&dropped_events),
            deduplicated_contexts: 0,
            events_in_last_batch: 0,
            overflow_warned: false,
            sender: Arc::clone(&sender),
            sender_slots: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            disabled: Arc::clone(&disabled),
            last_known_past_time: Arc::clone(&last_known_past_time),
            diagnostics: diagnostics.clone(),
        };
        let dispatcher_handle = tokio::spawn(dispatcher.run(inbox_rx));

        // Abnormal-termination shield: if the dispatcher dies, stop
        // accepting events. Dropping its inbox receiver also errors any
        // pending Sync/Shutdown reply channels, releasing waiters.
        {
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                if let Err(e) = dispatcher_handle.await {
                    if e.is_panic() {
                        error!("event dispatcher terminated abnormally; events are disabled");
                    }
                }
                closed.store(true, Ordering::SeqCst);
            });
        }

        let mut periodic_tasks = Vec::new();
        periodic_tasks.push(spawn_periodic(
            inbox_tx.clone(),
            config.flush_interval,
            || DispatcherMessage::Flush,
        ));
        periodic_tasks.push(spawn_periodic(
            inbox_tx.clone(),
            config.context_keys_flush_interval,
            || DispatcherMessage::FlushUsers,
        ));
        if let Some(diagnostics) = diagnostics {
            let init_event = diagnostics.lock().init_event();
            let init_sender = Arc::clone(&sender);
            periodic_tasks.push(tokio::spawn(async move {
                init_sender
                    .send_event_data(EventPayloadKind::Diagnostic, &init_event)
                    .await;
            }));
            periodic_tasks.push(spawn_periodic(
                inbox_tx.clone(),
                config.diagnostic_recording_interval,
                || DispatcherMessage::Diagnostic,
            ));
        }

        EventProcessor {
            inbox: inbox_tx,
            inbox_full_warned: Arc::new(AtomicBool::new(false)),
            closed,
            disabled,
            dropped_events,
            last_known_past_time,
            periodic_tasks: Mutex::new(periodic_tasks),
        }
    }

    /// Offers an event to the pipeline. Never blocks; a full inbox drops
    /// the event, counts it, and warns once per burst.
    pub fn send_event(&self, event: InputEvent) {
        if self.closed.load(Ordering::SeqCst) || self.disabled.load(Ordering::SeqCst) {
            return;
        }
        match self
            .inbox
            .try_send(DispatcherMessage::Event(Box::new(event)))
        {
            Ok(()) => {
                self.inbox_full_warned.store(false, Ordering::SeqCst);
            }
            Err(TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::SeqCst);
                if !self.inbox_full_warned.swap(true, Ordering::SeqCst) {
                    warn!(
                        "events are being produced faster than they can be processed; some events will be dropped"
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Requests an asynchronous flush.
    pub fn flush(&self) {
        let _ = self.inbox.try_send(DispatcherMessage::Flush);
    }

    /// Flushes and waits until all delivery workers are idle again.
    pub async fn flush_and_wait(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.inbox.send(DispatcherMessage::Flush).await.is_err() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.inbox.send(DispatcherMessage::Sync(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Drains and stops the pipeline. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.periodic_tasks.lock().drain(..) {
            task.abort();
        }
        let (tx, rx) = oneshot::channel();
        if self
            .inbox
            .send(DispatcherMessage::Shutdown(tx))
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// The most recent service-reported time, in epoch milliseconds.
    pub fn last_known_past_time(&self) -> u64 {
        self.last_known_past_time.load(Ordering::SeqCst)
    }
}

fn spawn_periodic(
    inbox: mpsc::Sender<DispatcherMessage>,
    period: std::time::Duration,
    message: impl Fn() -> DispatcherMessage + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(std::time::Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate first tick
        loop {
            ticker.tick().await;
            if inbox.send(message()).await.is_err() {
                return;
            }
        }
    })
}

struct Dispatcher {
    capacity: usize,
    formatter: EventOutputFormatter,
    summarizer: EventSummarizer,
    buffer: Vec<Value>,
    dedup: ContextKeyDeduplicator,
    dropped_events: Arc<AtomicU64>,
    deduplicated_contexts: u64,
    events_in_last_batch: usize,
    overflow_warned: bool,
    sender: Arc<EventSender>,
    sender_slots: Arc<Semaphore>,
    pool_size: usize,
    disabled: Arc<AtomicBool>,
    last_known_past_time: Arc<AtomicU64>,
    diagnostics: Option<Arc<Mutex<DiagnosticsManager>>>,
}

impl Dispatcher {
    async fn run(mut self, mut inbox: mpsc::Receiver<DispatcherMessage>) {
        while let Some(message) = inbox.recv().await {
            match message {
                DispatcherMessage::Event(event) => self.process_event(*event),
                DispatcherMessage::Flush => self.trigger_flush(),
                DispatcherMessage::FlushUsers => self.dedup.clear(),
                DispatcherMessage::Diagnostic => self.send_diagnostic(),
                DispatcherMessage::Sync(reply) => {
                    self.wait_for_senders().await;
                    let _ = reply.send(());
                }
                DispatcherMessage::Shutdown(reply) => {
                    self.trigger_flush();
                    self.wait_for_senders().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    // Blocks the dispatcher until every sender slot is free. Used only for
    // the Sync barrier and Shutdown; the inbox simply backs up meanwhile.
    async fn wait_for_senders(&self) {
        if let Ok(permits) = Arc::clone(&self.sender_slots)
            .acquire_many_owned(self.pool_size as u32)
            .await
        {
            drop(permits);
        }
    }

    fn process_event(&mut self, event: InputEvent) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        match event {
            InputEvent::FeatureRequest(e) => {
                if !e.exclude_from_summaries {
                    self.summarizer.summarize(&e);
                }
                self.note_context(&e.base);
                let sampled = sample(e.sampling_ratio);
                if e.track_events && sampled {
                    let json = self.formatter.feature_event_json(&e, false);
                    self.enqueue(json);
                }
                if sampled && self.should_debug(&e) {
                    let json = self.formatter.feature_event_json(&e, true);
                    self.enqueue(json);
                }
            }
            InputEvent::Identify(e) => {
                // The identify event itself carries the attributes, so the
                // context is marked seen without an index event.
                self.dedup.notice(e.base.context.fully_qualified_key());
                let json = self.formatter.identify_event_json(&e);
                self.enqueue(json);
            }
            InputEvent::Custom(e) => {
                self.note_context(&e.base);
                let json = self.formatter.custom_event_json(&e);
                self.enqueue(json);
            }
        }
    }

    fn note_context(&mut self, base: &BaseEvent) {
        if self.dedup.notice(base.context.fully_qualified_key()) {
            self.deduplicated_contexts += 1;
        } else {
            let json = self
                .formatter
                .index_event_json(base.creation_date, &base.context);
            self.enqueue(json);
        }
    }

    // The debug window must be open by the local clock AND by the service's
    // clock as last reported; the latter closes the window even when the
    // local clock is far behind.
    fn should_debug(&self, event: &FeatureRequestEvent) -> bool {
        match event.debug_events_until_date {
            Some(until) => {
                until > now_millis() && until > self.last_known_past_time.load(Ordering::SeqCst)
            }
            None => false,
        }
    }

    fn enqueue(&mut self, event: Value) {
        if self.buffer.len() >= self.capacity {
            self.dropped_events.fetch_add(1, Ordering::SeqCst);
            if !self.overflow_warned {
                warn!(
                    "exceeded event queue capacity; increase capacity to avoid dropping events"
                );
                self.overflow_warned = true;
            }
        } else {
            self.buffer.push(event);
        }
    }

    fn trigger_flush(&mut self) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        if self.buffer.is_empty() && self.summarizer.is_empty() {
            return;
        }

        let events = std::mem::take(&mut self.buffer);
        let summary = self.summarizer.take();
        self.overflow_warned = false;

        match Arc::clone(&self.sender_slots).try_acquire_owned() {
            Ok(permit) => {
                let mut payload = events;
                if !summary.is_empty() {
                    payload.push(self.formatter.summary_event_json(&summary));
                }
                self.events_in_last_batch = payload.len();
                let sender = Arc::clone(&self.sender);
                let disabled = Arc::clone(&self.disabled);
                let last_known = Arc::clone(&self.last_known_past_time);
                tokio::spawn(async move {
                    let result = sender
                        .send_event_data(EventPayloadKind::Analytics, &Value::Array(payload))
                        .await;
                    if let Some(server_time) = result.time_from_server {
                        last_known.fetch_max(server_time, Ordering::SeqCst);
                    }
                    if result.must_shutdown {
                        disabled.store(true, Ordering::SeqCst);
                    }
                    drop(permit);
                });
            }
            Err(_) => {
                // All workers busy: fold the snapshot back in and try again
                // on the next flush.
                debug!("event delivery is busy; payload deferred to the next flush");
                self.summarizer.merge(summary);
                let mut restored = events;
                restored.append(&mut self.buffer);
                self.buffer = restored;
            }
        }
    }

    fn send_diagnostic(&mut self) {
        let Some(diagnostics) = &self.diagnostics else {
            return;
        };
        let event = diagnostics.lock().periodic_event(
            self.dropped_events.swap(0, Ordering::SeqCst),
            self.deduplicated_contexts,
            self.events_in_last_batch,
        );
        self.deduplicated_contexts = 0;
        let sender = Arc::clone(&self.sender);
        tokio::spawn(async move {
            sender
                .send_event_data(EventPayloadKind::Diagnostic, &event)
                .await;
        });
    }
}

fn sample(ratio: u32) -> bool {
    match ratio {
        0 => false,
        1 => true,
        n => rand::thread_rng().gen_ratio(1, n),
    }
}
