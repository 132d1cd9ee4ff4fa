//! Usage metering.
//!
//! Every evaluation is counted under its (instance, environment, collection,
//! feature or property, entity, segment) key. A background task periodically
//! swaps the counters out and posts them to the service in per-collection
//! batches.
//!
//! Delivery is at most once: counters leave the store when they are swapped
//! out, and a batch whose post fails is logged and dropped.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_with::skip_serializing_none;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Duration, Instant},
};
use tracing::{event, Level};

use crate::http::AppConfigHttpClient;

pub const DEFAULT_METERING_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_USAGE_LIMIT: usize = 25;

/// Tenant identifiers attached to every usage record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageContext {
    pub instance_id: String,
    pub environment_id: String,
    pub collection_id: String,
}

/// What was evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UsageSubject {
    Feature(String),
    Property(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    pub instance_id: String,
    pub environment_id: String,
    pub collection_id: String,
    pub subject: UsageSubject,
    pub entity_id: String,
    pub segment_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCounter {
    pub count: u64,
    pub last_evaluation_time: DateTime<Utc>,
}

fn serialize_evaluation_time<S>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub feature_id: Option<String>,
    pub property_id: Option<String>,
    pub entity_id: String,
    #[serialize_always]
    pub segment_id: Option<String>,
    #[serde(serialize_with = "serialize_evaluation_time")]
    pub evaluation_time: DateTime<Utc>,
    pub count: u64,
}

/// Usages of one collection in one environment, as posted to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBatch {
    pub collection_id: String,
    pub environment_id: String,
    pub usages: Vec<UsageEntry>,
}

/// Splits `batch` into consecutive batches of at most `limit` usages.
pub fn split_batch(batch: UsageBatch, limit: usize) -> Vec<UsageBatch> {
    let limit = limit.max(1);
    batch
        .usages
        .chunks(limit)
        .map(|usages| UsageBatch {
            collection_id: batch.collection_id.clone(),
            environment_id: batch.environment_id.clone(),
            usages: usages.to_vec(),
        })
        .collect()
}

pub struct Metering {
    http_client: AppConfigHttpClient,
    usages: Mutex<HashMap<UsageKey, UsageCounter>>,
    interval: Duration,
    batch_limit: usize,
    // serializes the posts of split batches
    send_lock: tokio::sync::Mutex<()>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Metering {
    pub fn new(
        http_client: AppConfigHttpClient,
        interval: Option<Duration>,
        batch_limit: Option<usize>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            http_client,
            usages: Mutex::new(HashMap::new()),
            interval: interval.unwrap_or(DEFAULT_METERING_INTERVAL),
            batch_limit: batch_limit.unwrap_or(DEFAULT_USAGE_LIMIT),
            send_lock: tokio::sync::Mutex::new(()),
            stop_tx,
            stop_rx,
        }
    }

    /// Counts one evaluation. Ignored once metering is stopped.
    pub fn record(
        &self,
        context: &UsageContext,
        subject: UsageSubject,
        entity_id: &str,
        segment_id: Option<&str>,
    ) {
        if self.is_stopped() {
            return;
        }
        let key = UsageKey {
            instance_id: context.instance_id.clone(),
            environment_id: context.environment_id.clone(),
            collection_id: context.collection_id.clone(),
            subject,
            entity_id: entity_id.to_string(),
            segment_id: segment_id.map(str::to_string),
        };
        let now = Utc::now();
        let mut usages = self.usages.lock().unwrap_or_else(PoisonError::into_inner);
        usages
            .entry(key)
            .and_modify(|c| {
                c.count += 1;
                c.last_evaluation_time = now;
            })
            .or_insert(UsageCounter {
                count: 1,
                last_evaluation_time: now,
            });
    }

    /// Number of distinct keys counted since the last flush.
    pub fn pending(&self) -> usize {
        self.usages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Swaps the counters for an empty store and groups what was taken into
    /// batches keyed by instance id.
    pub fn drain(&self) -> BTreeMap<String, Vec<UsageBatch>> {
        let usages = {
            let mut usages = self.usages.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *usages)
        };

        let mut sorted: Vec<(UsageKey, UsageCounter)> = usages.into_iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut grouped: BTreeMap<String, BTreeMap<(String, String), Vec<UsageEntry>>> =
            BTreeMap::new();
        for (key, counter) in sorted {
            let (feature_id, property_id) = match key.subject {
                UsageSubject::Feature(id) => (Some(id), None),
                UsageSubject::Property(id) => (None, Some(id)),
            };
            grouped
                .entry(key.instance_id)
                .or_default()
                .entry((key.environment_id, key.collection_id))
                .or_default()
                .push(UsageEntry {
                    feature_id,
                    property_id,
                    entity_id: key.entity_id,
                    segment_id: key.segment_id,
                    evaluation_time: counter.last_evaluation_time,
                    count: counter.count,
                });
        }

        grouped
            .into_iter()
            .map(|(instance_id, collections)| {
                let batches = collections
                    .into_iter()
                    .map(|((environment_id, collection_id), usages)| UsageBatch {
                        collection_id,
                        environment_id,
                        usages,
                    })
                    .collect();
                (instance_id, batches)
            })
            .collect()
    }

    /// Sends everything counted so far. Returns once every post, including
    /// those of split batches, has completed.
    pub async fn flush(self: &Arc<Self>) {
        let batches = self.drain();
        if batches.is_empty() {
            return;
        }

        let mut split_sends: Vec<JoinHandle<()>> = vec![];
        for (instance_id, batches) in batches {
            for batch in batches {
                if batch.usages.len() > self.batch_limit {
                    split_sends.push(tokio::spawn(
                        self.clone().send_split(instance_id.clone(), batch),
                    ));
                } else {
                    self.send(&instance_id, &batch).await;
                }
            }
        }

        for handle in split_sends {
            if let Err(e) = handle.await {
                event!(Level::ERROR, "Usage send task failed: {}", e);
            }
        }
    }

    /// Starts the periodic flush. The task flushes one last time after `stop`.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().background_flush())
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn background_flush(self: Arc<Self>) {
        let mut stop_rx = self.stop_rx.clone();
        let mut interval = time::interval_at(Instant::now() + self.interval, self.interval);
        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    event!(Level::DEBUG, "Flushing usage data");
                    self.flush().await;
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.flush().await;
    }

    async fn send_split(self: Arc<Self>, instance_id: String, batch: UsageBatch) {
        let batches = split_batch(batch, self.batch_limit);
        event!(
            Level::DEBUG,
            "Sending usage in {} batches of at most {}",
            batches.len(),
            self.batch_limit
        );
        for batch in batches {
            let _guard = self.send_lock.lock().await;
            self.send(&instance_id, &batch).await;
        }
    }

    async fn send(&self, instance_id: &str, batch: &UsageBatch) {
        match self.http_client.post_usage(instance_id, batch).await {
            Ok(_) => event!(
                Level::DEBUG,
                "Pushed {} usages for collection {}",
                batch.usages.len(),
                batch.collection_id
            ),
            Err(e) => event!(Level::ERROR, "Failed to send usage data: {}", e),
        }
    }
}
