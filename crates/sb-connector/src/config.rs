//! Resolved per-channel configuration
//!
//! Values arrive already resolved by the host (file/env loading is the
//! host's concern). Each config is created once at channel construction,
//! validated eagerly, and never mutated afterwards.

use chrono::{DateTime, Utc};
use sb_broker::{
    BackPressure, MissingResourcesPolicy, PublisherSpec, QueueSpec, ReceiverSpec, ReplaySpec,
};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ConnectorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueType {
    #[default]
    DurableNonExclusive,
    DurableExclusive,
    NonDurableExclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingResourceStrategy {
    #[default]
    CreateOnStart,
    DoNotCreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayStrategyKind {
    AllMessages,
    TimeBased,
    ReplicationGroupMessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackPressureStrategy {
    Reject,
    Wait,
    #[default]
    Elastic,
}

/// Configuration for one incoming (broker -> application) channel
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IncomingChannelConfig {
    pub channel: String,

    /// Defer receiver activation to first downstream demand
    #[serde(default)]
    pub lazy_start: bool,

    /// Comma-separated topic subscriptions, the channel name if empty
    #[serde(default)]
    pub subscriptions: Option<String>,

    #[serde(default)]
    pub queue_type: QueueType,

    /// Queue name, the channel name if empty (ignored for non-durable
    /// queues without a name)
    #[serde(default)]
    pub queue_name: Option<String>,

    #[serde(default)]
    pub missing_resource_strategy: MissingResourceStrategy,

    #[serde(default)]
    pub selector_query: Option<String>,

    #[serde(default)]
    pub replay_strategy: Option<ReplayStrategyKind>,

    #[serde(default)]
    pub replay_timebased_start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub replay_replication_group_message_id: Option<String>,
}

impl IncomingChannelConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            lazy_start: false,
            subscriptions: None,
            queue_type: QueueType::default(),
            queue_name: None,
            missing_resource_strategy: MissingResourceStrategy::default(),
            selector_query: None,
            replay_strategy: None,
            replay_timebased_start_time: None,
            replay_replication_group_message_id: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(ConnectorError::Config("channel name must not be empty".into()));
        }
        match self.replay_strategy {
            Some(ReplayStrategyKind::TimeBased) if self.replay_timebased_start_time.is_none() => {
                Err(ConnectorError::Config(
                    "time-based replay requires replay-timebased-start-time".into(),
                ))
            }
            Some(ReplayStrategyKind::ReplicationGroupMessageId)
                if self.replay_replication_group_message_id.is_none() =>
            {
                Err(ConnectorError::Config(
                    "replication-group replay requires replay-replication-group-message-id".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// The comma-separated subscription list, the channel name when unset
    pub fn resolved_subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.channel)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn queue_spec(&self) -> QueueSpec {
        let named = || {
            self.queue_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| self.channel.clone())
        };
        match self.queue_type {
            QueueType::DurableNonExclusive => QueueSpec::DurableNonExclusive { name: named() },
            QueueType::DurableExclusive => QueueSpec::DurableExclusive { name: named() },
            QueueType::NonDurableExclusive => QueueSpec::NonDurableExclusive {
                name: self.queue_name.clone().filter(|n| !n.is_empty()),
            },
        }
    }

    fn replay_spec(&self) -> Result<Option<ReplaySpec>> {
        self.validate()?;
        Ok(match self.replay_strategy {
            None => None,
            Some(ReplayStrategyKind::AllMessages) => Some(ReplaySpec::AllMessages),
            Some(ReplayStrategyKind::TimeBased) => Some(ReplaySpec::TimeBased {
                start: self.replay_timebased_start_time.unwrap(),
            }),
            Some(ReplayStrategyKind::ReplicationGroupMessageId) => {
                Some(ReplaySpec::ReplicationGroupMessageId {
                    id: self.replay_replication_group_message_id.clone().unwrap(),
                })
            }
        })
    }

    /// Resolve to a receiver spec, failing fast on invalid combinations
    pub fn receiver_spec(&self) -> Result<ReceiverSpec> {
        self.validate()?;
        Ok(ReceiverSpec {
            queue: self.queue_spec(),
            subscriptions: self.resolved_subscriptions(),
            selector: self.selector_query.clone().filter(|s| !s.is_empty()),
            replay: self.replay_spec()?,
            missing_resources: match self.missing_resource_strategy {
                MissingResourceStrategy::CreateOnStart => MissingResourcesPolicy::CreateOnStart,
                MissingResourceStrategy::DoNotCreate => MissingResourcesPolicy::DoNotCreate,
            },
        })
    }
}

fn default_max_inflight() -> usize {
    1024
}

fn default_wait_for_receipt() -> bool {
    true
}

fn default_buffer_capacity() -> usize {
    1024
}

/// Configuration for one outgoing (application -> broker) channel
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutgoingChannelConfig {
    pub channel: String,

    /// Defer publisher activation to first upstream item
    #[serde(default)]
    pub lazy_start: bool,

    /// Topic to publish to, the channel name if empty
    #[serde(default)]
    pub topic: Option<String>,

    /// Maximum published-but-unresolved messages; 0 removes the limit
    #[serde(default = "default_max_inflight")]
    pub max_inflight_messages: usize,

    /// Await the broker publish receipt before acknowledging upstream
    #[serde(default = "default_wait_for_receipt")]
    pub wait_for_publish_receipt: bool,

    /// Broker-side delivery ack timeout in milliseconds
    #[serde(default)]
    pub ack_timeout: Option<u64>,

    #[serde(default)]
    pub ack_window_size: Option<u32>,

    #[serde(default)]
    pub back_pressure_strategy: BackPressureStrategy,

    /// Ignored under the elastic strategy, which buffers without bound
    #[serde(default = "default_buffer_capacity")]
    pub back_pressure_buffer_capacity: usize,
}

impl OutgoingChannelConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            lazy_start: false,
            topic: None,
            max_inflight_messages: default_max_inflight(),
            wait_for_publish_receipt: default_wait_for_receipt(),
            ack_timeout: None,
            ack_window_size: None,
            back_pressure_strategy: BackPressureStrategy::default(),
            back_pressure_buffer_capacity: default_buffer_capacity(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(ConnectorError::Config("channel name must not be empty".into()));
        }
        if matches!(
            self.back_pressure_strategy,
            BackPressureStrategy::Reject | BackPressureStrategy::Wait
        ) && self.back_pressure_buffer_capacity == 0
        {
            return Err(ConnectorError::Config(
                "back-pressure-buffer-capacity must be positive for reject/wait".into(),
            ));
        }
        Ok(())
    }

    /// Explicitly configured topic, the channel name otherwise
    pub fn resolved_topic(&self) -> String {
        self.topic
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.channel.clone())
    }

    pub fn publisher_spec(&self) -> Result<PublisherSpec> {
        self.validate()?;
        Ok(PublisherSpec {
            back_pressure: match self.back_pressure_strategy {
                BackPressureStrategy::Reject => BackPressure::Reject {
                    capacity: self.back_pressure_buffer_capacity,
                },
                BackPressureStrategy::Wait => BackPressure::Wait {
                    capacity: self.back_pressure_buffer_capacity,
                },
                BackPressureStrategy::Elastic => BackPressure::Elastic,
            },
            ack_timeout: self.ack_timeout.map(Duration::from_millis),
            ack_window_size: self.ack_window_size,
        })
    }
}
