//! Synchronous in-process event bus.
//!
//! Publish does not return until every subscriber callback has returned,
//! and callbacks run in registration order. This keeps delivery ordered
//! with no queues, at the cost of a rule for subscribers: handlers must
//! stay short and must dispatch any long-running or re-publishing work to
//! a fresh task (the coordinator does exactly this for judge startup).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Topics carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A team's task queue reached a fully terminal state.
    TeamCompleted,
    /// A bridge handed a task to a freshly created worker instance.
    BridgeTaskStarted,
    /// A bridge observed a task outcome.
    BridgeTaskCompleted,
    /// Triple-shot specific: one attempt reached a terminal status.
    AttemptCompleted,
    /// Triple-shot specific: the judge pipeline finished.
    JudgeCompleted,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TeamCompleted => "team.completed",
            Self::BridgeTaskStarted => "bridge.task_started",
            Self::BridgeTaskCompleted => "bridge.task_completed",
            Self::AttemptCompleted => "tripleshot.attempt_completed",
            Self::JudgeCompleted => "tripleshot.judge_completed",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed event with its payload.
#[derive(Debug, Clone)]
pub enum BusEvent {
    TeamCompleted {
        team_id: String,
        success: bool,
        tasks_completed: u32,
        tasks_failed: u32,
    },
    BridgeTaskStarted {
        team_id: String,
        task_id: String,
        instance_id: String,
    },
    BridgeTaskCompleted {
        team_id: String,
        task_id: String,
        instance_id: String,
        success: bool,
        commit_count: u32,
        error: Option<String>,
    },
    AttemptCompleted {
        attempt_index: usize,
        team_id: String,
        success: bool,
    },
    JudgeCompleted {
        team_id: String,
        success: bool,
    },
}

impl BusEvent {
    /// The topic this event is delivered on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::TeamCompleted { .. } => Topic::TeamCompleted,
            Self::BridgeTaskStarted { .. } => Topic::BridgeTaskStarted,
            Self::BridgeTaskCompleted { .. } => Topic::BridgeTaskCompleted,
            Self::AttemptCompleted { .. } => Topic::AttemptCompleted,
            Self::JudgeCompleted { .. } => Topic::JudgeCompleted,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: HashMap<Topic, Vec<(u64, Handler)>>,
}

/// The bus. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic. Handlers for the same topic are
    /// invoked in registration order.
    pub fn subscribe(
        &self,
        topic: Topic,
        handler: impl Fn(&BusEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .subscribers
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionId(id)
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for handlers in inner.subscribers.values_mut() {
            handlers.retain(|(hid, _)| *hid != id.0);
        }
    }

    /// Deliver `event` to every subscriber of its topic, returning only
    /// after the last callback has returned.
    ///
    /// The registry lock is dropped before fan-out, so handlers may
    /// subscribe, unsubscribe, or publish; a registry change made during a
    /// publish affects the next publish, not the in-flight one.
    pub fn publish(&self, event: BusEvent) {
        let handlers: Vec<Handler> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .subscribers
                .get(&event.topic())
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(&event);
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let counts: HashMap<&str, usize> = inner
            .subscribers
            .iter()
            .map(|(t, hs)| (t.as_str(), hs.len()))
            .collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}
