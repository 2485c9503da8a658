//! Event bus — topic and pattern subscriptions with brokered dispatch.
//!
//! A single process-wide broker. Topics are dot-segmented strings; patterns
//! may use `*` to match exactly one segment. Within a publication,
//! subscribers run to completion one after another (higher priority first,
//! registration order breaking ties); handler errors are logged and never
//! abort dispatch to the remaining subscribers.

use crate::error::{self, TrellisError};
use crate::host::{Clock, SystemClock};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// Metadata key tagging a subscription with its owning plugin.
pub const META_PLUGIN_ID: &str = "pluginId";
/// Metadata key naming the plugin method a subscription dispatches to.
pub const META_HANDLER: &str = "handler";

// ---------------------------------------------------------------------------
// Event & handler types
// ---------------------------------------------------------------------------

/// An event as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub topic: String,
    pub payload: serde_json::Value,
    /// Who published this; the plugin context forces `plugin:<id>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp_ms: u64,
}

pub type HandlerFuture = BoxFuture<'static, error::Result<()>>;

/// Subscriber callback. Receives its own clone of the event.
pub type EventHandler = Arc<dyn Fn(BusEvent) -> HandlerFuture + Send + Sync>;

/// Options accepted by `subscribe` and `subscribe_pattern`.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Higher priority subscribers run first within a publication.
    pub priority: i32,
    /// Free-form tags; `META_PLUGIN_ID` enables bulk revocation.
    pub metadata: HashMap<String, String>,
}

impl SubscribeOptions {
    pub fn for_plugin(plugin_id: &str) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(META_PLUGIN_ID.to_string(), plugin_id.to_string());
        Self {
            priority: 0,
            metadata,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Options accepted by `publish`.
#[derive(Clone, Default)]
pub struct PublishOptions {
    pub source: Option<String>,
}

impl PublishOptions {
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
        }
    }
}

/// Delivery counters for one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub id: String,
    pub topic: String,
    pub priority: i32,
    pub metadata: HashMap<String, String>,
    pub delivered: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Topic matching
// ---------------------------------------------------------------------------

/// Match a dot-segmented pattern against a topic. `*` matches exactly one
/// segment: `plugins.*` matches `plugins.installed` but not
/// `plugins.lifecycle.activated`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('.');
    let mut topic_segments = topic.split('.');
    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(t)) => {
                if p != "*" && p != t {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

enum TopicFilter {
    Exact(String),
    Pattern(String),
}

impl TopicFilter {
    fn as_str(&self) -> &str {
        match self {
            TopicFilter::Exact(t) | TopicFilter::Pattern(t) => t,
        }
    }
}

struct Subscription {
    id: String,
    filter: TopicFilter,
    handler: EventHandler,
    priority: i32,
    seq: u64,
    metadata: HashMap<String, String>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

struct BusInner {
    exact: HashMap<String, Vec<Arc<Subscription>>>,
    patterns: Vec<Arc<Subscription>>,
    next_seq: u64,
    destroyed: bool,
}

/// The process-wide broker.
pub struct EventBus {
    inner: RwLock<BusInner>,
    clock: Arc<dyn Clock>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.read() {
            Ok(inner) => {
                let exact: usize = inner.exact.values().map(|v| v.len()).sum();
                f.debug_struct("EventBus")
                    .field("exact_subscriptions", &exact)
                    .field("pattern_subscriptions", &inner.patterns.len())
                    .finish()
            }
            Err(_) => f.debug_struct("EventBus").field("poisoned", &true).finish(),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(BusInner {
                exact: HashMap::new(),
                patterns: Vec::new(),
                next_seq: 0,
                destroyed: false,
            }),
            clock,
        }
    }

    fn read_inner(&self) -> error::Result<RwLockReadGuard<'_, BusInner>> {
        self.inner
            .read()
            .map_err(|_| TrellisError::internal("event bus lock poisoned"))
    }

    fn write_inner(&self) -> error::Result<RwLockWriteGuard<'_, BusInner>> {
        self.inner
            .write()
            .map_err(|_| TrellisError::internal("event bus lock poisoned"))
    }

    /// Register an exact-match subscription. Returns the subscription id.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> error::Result<String> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(TrellisError::InvalidTopic {
                message: "topic must not be empty".to_string(),
            });
        }
        self.insert(TopicFilter::Exact(topic), handler, options)
    }

    /// Register a pattern subscription. See [`topic_matches`] for the
    /// wildcard grammar.
    pub fn subscribe_pattern(
        &self,
        pattern: impl Into<String>,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> error::Result<String> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(TrellisError::InvalidTopic {
                message: "pattern must not be empty".to_string(),
            });
        }
        self.insert(TopicFilter::Pattern(pattern), handler, options)
    }

    fn insert(
        &self,
        filter: TopicFilter,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> error::Result<String> {
        let mut inner = self.write_inner()?;
        if inner.destroyed {
            return Err(TrellisError::not_permitted("subscribe on destroyed bus"));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let id = format!("sub_{seq}");
        let subscription = Arc::new(Subscription {
            id: id.clone(),
            handler,
            priority: options.priority,
            seq,
            metadata: options.metadata,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            filter,
        });
        match &subscription.filter {
            TopicFilter::Exact(topic) => {
                inner
                    .exact
                    .entry(topic.clone())
                    .or_default()
                    .push(subscription.clone());
            }
            TopicFilter::Pattern(_) => inner.patterns.push(subscription.clone()),
        }
        Ok(id)
    }

    /// Publish an event. The matching subscriber set is snapshotted before
    /// the first handler runs, so handlers may subscribe or unsubscribe
    /// without perturbing the ongoing dispatch. Returns the number of
    /// subscribers the event was delivered to.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> error::Result<usize> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(TrellisError::InvalidTopic {
                message: "topic must not be empty".to_string(),
            });
        }

        let mut matched = {
            let inner = self.read_inner()?;
            if inner.destroyed {
                return Err(TrellisError::not_permitted("publish on destroyed bus"));
            }
            let mut matched: Vec<Arc<Subscription>> =
                inner.exact.get(&topic).cloned().unwrap_or_default();
            matched.extend(
                inner
                    .patterns
                    .iter()
                    .filter(|s| topic_matches(s.filter.as_str(), &topic))
                    .cloned(),
            );
            matched
        };
        matched.sort_by_key(|s| (std::cmp::Reverse(s.priority), s.seq));

        let event = BusEvent {
            topic: topic.clone(),
            payload,
            source: options.source,
            timestamp_ms: self.clock.now_ms(),
        };

        let mut delivered = 0;
        for subscription in &matched {
            match (subscription.handler)(event.clone()).await {
                Ok(()) => {
                    subscription.delivered.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(e) => {
                    subscription.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription = %subscription.id,
                        topic = %topic,
                        metadata = ?subscription.metadata,
                        error = %e,
                        "Event handler failed"
                    );
                }
            }
        }
        Ok(delivered)
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, subscription_id: &str) -> error::Result<bool> {
        let mut inner = self.write_inner()?;
        let mut found = false;
        for subs in inner.exact.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != subscription_id);
            found |= subs.len() < before;
        }
        let before = inner.patterns.len();
        inner.patterns.retain(|s| s.id != subscription_id);
        found |= inner.patterns.len() < before;
        inner.exact.retain(|_, subs| !subs.is_empty());
        Ok(found)
    }

    /// Remove every subscription tagged with the given plugin id. Returns
    /// how many were removed.
    pub fn unsubscribe_plugin(&self, plugin_id: &str) -> error::Result<usize> {
        let owned =
            |s: &Arc<Subscription>| s.metadata.get(META_PLUGIN_ID).map(String::as_str) == Some(plugin_id);
        let mut inner = self.write_inner()?;
        let mut removed = 0;
        for subs in inner.exact.values_mut() {
            let before = subs.len();
            subs.retain(|s| !owned(s));
            removed += before - subs.len();
        }
        let before = inner.patterns.len();
        inner.patterns.retain(|s| !owned(s));
        removed += before - inner.patterns.len();
        inner.exact.retain(|_, subs| !subs.is_empty());
        Ok(removed)
    }

    /// Number of subscribers a publication on `topic` would reach now.
    pub fn subscriber_count(&self, topic: &str) -> error::Result<usize> {
        let inner = self.read_inner()?;
        let exact = inner.exact.get(topic).map(|v| v.len()).unwrap_or(0);
        let patterns = inner
            .patterns
            .iter()
            .filter(|s| topic_matches(s.filter.as_str(), topic))
            .count();
        Ok(exact + patterns)
    }

    /// Topics and patterns that currently have subscribers, sorted.
    pub fn active_topics(&self) -> error::Result<Vec<String>> {
        let inner = self.read_inner()?;
        let mut topics: Vec<String> = inner
            .exact
            .iter()
            .filter(|(_, subs)| !subs.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.extend(inner.patterns.iter().map(|s| s.filter.as_str().to_string()));
        topics.sort();
        topics.dedup();
        Ok(topics)
    }

    /// Delivery counters for every live subscription.
    pub fn subscription_stats(&self) -> error::Result<Vec<SubscriptionStats>> {
        let inner = self.read_inner()?;
        Ok(inner
            .exact
            .values()
            .flatten()
            .chain(inner.patterns.iter())
            .map(|s| SubscriptionStats {
                id: s.id.clone(),
                topic: s.filter.as_str().to_string(),
                priority: s.priority,
                metadata: s.metadata.clone(),
                delivered: s.delivered.load(Ordering::Relaxed),
                failed: s.failed.load(Ordering::Relaxed),
            })
            .collect())
    }

    /// Drop every subscription. Host-only; the plugin façade refuses this.
    pub fn clear_all(&self) -> error::Result<()> {
        let mut inner = self.write_inner()?;
        inner.exact.clear();
        inner.patterns.clear();
        Ok(())
    }

    /// Tear the bus down. Subsequent operations fail. Host-only.
    pub fn destroy(&self) -> error::Result<()> {
        let mut inner = self.write_inner()?;
        inner.exact.clear();
        inner.patterns.clear();
        inner.destroyed = true;
        Ok(())
    }
}
