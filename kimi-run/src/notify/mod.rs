//! Completion fan-out.
//!
//! The pending-wake record is written first and synchronously; its failure is
//! the only fatal outcome. Network channels then run concurrently, each with
//! its own retry budget, and the whole set is bounded by one deadline.

pub mod fallback;
pub mod gateway;
pub mod telegram;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use kimi_common::limits::NotifyLimits;
use kimi_common::{RecordStore, RunId, TaskStatus};

use crate::config::HooksConfig;
use gateway::GatewayChannel;
use telegram::TelegramChannel;

/// Everything a channel needs to announce a finished run.
#[derive(Debug, Clone)]
pub struct CompletionNotice {
    pub run_id: RunId,
    pub session_id: String,
    pub task_name: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
    pub workdir: PathBuf,
    pub telegram_group: Option<String>,
    /// Result-sized output tail; channels cut it further as needed.
    pub output: String,
    pub result_file: PathBuf,
}

#[async_trait]
pub trait NotifyChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Some(reason)` when this notice is not for this channel.
    fn skip_reason(&self, _notice: &CompletionNotice) -> Option<String> {
        None
    }

    /// One delivery attempt.
    async fn deliver(&self, notice: &CompletionNotice) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Delivered { attempts: u32 },
    Skipped { reason: String },
    Failed { attempts: u32, error: String },
    /// Still in flight when the overall deadline passed.
    Abandoned,
}

impl ChannelOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, ChannelOutcome::Delivered { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FanoutReport {
    pub fallback_written: bool,
    pub channels: Vec<(String, ChannelOutcome)>,
}

impl FanoutReport {
    pub fn outcome(&self, channel: &str) -> Option<&ChannelOutcome> {
        self.channels
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, outcome)| outcome)
    }
}

pub struct NotificationFanout {
    store: Arc<dyn RecordStore>,
    channels: Vec<Arc<dyn NotifyChannel>>,
    /// Channels left out at construction, with the reason.
    disabled: Vec<(&'static str, String)>,
    limits: NotifyLimits,
}

impl NotificationFanout {
    pub fn new(store: Arc<dyn RecordStore>, limits: NotifyLimits) -> Self {
        Self {
            store,
            channels: Vec::new(),
            disabled: Vec::new(),
            limits,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn NotifyChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn with_disabled(mut self, name: &'static str, reason: impl Into<String>) -> Self {
        self.disabled.push((name, reason.into()));
        self
    }

    /// Gateway when a token is configured, Telegram when a bot token is.
    pub fn from_config(store: Arc<dyn RecordStore>, config: &HooksConfig) -> Result<Self> {
        let limits = config.notify.clone();
        let client = reqwest::Client::builder()
            .connect_timeout(limits.connect_timeout())
            .timeout(limits.request_timeout())
            .build()
            .context("failed to build HTTP client")?;

        let mut fanout = Self::new(store, limits);
        fanout = match &config.gateway.token {
            Some(token) => fanout.with_channel(Arc::new(GatewayChannel::new(
                client.clone(),
                &config.gateway.url,
                token.clone(),
            ))),
            None => fanout.with_disabled("gateway", "no gateway token configured"),
        };
        fanout = match &config.telegram.bot_token {
            Some(token) => fanout.with_channel(Arc::new(TelegramChannel::new(
                client,
                &config.telegram.api_base,
                token.clone(),
            ))),
            None => fanout.with_disabled("telegram", "no telegram bot token configured"),
        };
        Ok(fanout)
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Fallback first, then every network channel. Errors only when the
    /// fallback record could not be written.
    pub async fn notify(&self, notice: &CompletionNotice) -> Result<FanoutReport> {
        fallback::record_completion(self.store.as_ref(), notice)
            .with_context(|| format!("fallback notification failed for {}", notice.run_id))?;
        debug!(run_id = %notice.run_id, "Fallback record written");

        let deadline = Instant::now() + self.limits.overall_timeout();
        let mut channels: Vec<(String, ChannelOutcome)> = self
            .disabled
            .iter()
            .map(|(name, reason)| {
                (
                    name.to_string(),
                    ChannelOutcome::Skipped {
                        reason: reason.clone(),
                    },
                )
            })
            .collect();

        let deliveries = self.channels.iter().map(|channel| {
            let channel = Arc::clone(channel);
            let limits = self.limits.clone();
            async move {
                let name = channel.name().to_string();
                if let Some(reason) = channel.skip_reason(notice) {
                    debug!(channel = %name, %reason, "Channel skipped");
                    return (name, ChannelOutcome::Skipped { reason });
                }
                let outcome =
                    match time::timeout_at(deadline, deliver_with_retry(channel.as_ref(), notice, &limits))
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!(channel = %name, run_id = %notice.run_id, "Channel abandoned at fan-out deadline");
                            ChannelOutcome::Abandoned
                        }
                    };
                (name, outcome)
            }
        });
        channels.extend(join_all(deliveries).await);

        let delivered = channels.iter().filter(|(_, o)| o.is_delivered()).count();
        info!(
            run_id = %notice.run_id,
            status = %notice.status,
            delivered,
            channels = channels.len(),
            "Completion fan-out finished"
        );
        Ok(FanoutReport {
            fallback_written: true,
            channels,
        })
    }
}

/// Up to `max_attempts` tries with a fixed backoff in between.
pub async fn deliver_with_retry(
    channel: &dyn NotifyChannel,
    notice: &CompletionNotice,
    limits: &NotifyLimits,
) -> ChannelOutcome {
    let max_attempts = limits.max_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        match channel.deliver(notice).await {
            Ok(()) => return ChannelOutcome::Delivered { attempts: attempt },
            Err(err) => {
                last_error = format!("{err:#}");
                warn!(
                    channel = channel.name(),
                    attempt,
                    max_attempts,
                    error = %last_error,
                    "Notification attempt failed"
                );
                if attempt < max_attempts {
                    time::sleep(limits.retry_backoff()).await;
                }
            }
        }
    }
    ChannelOutcome::Failed {
        attempts: max_attempts,
        error: last_error,
    }
}
