use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use kimi_common::{WakeEvent, WakeEventPayload};

use super::{CompletionNotice, NotifyChannel};

pub const WAKE_PATH: &str = "/hooks/wake";

/// Authenticated wake call to the local agent gateway.
pub struct GatewayChannel {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl GatewayChannel {
    pub fn new(client: reqwest::Client, base_url: &str, token: String) -> Self {
        Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), WAKE_PATH),
            token,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn event_for(notice: &CompletionNotice) -> WakeEvent {
        WakeEvent::new(WakeEventPayload {
            session_id: notice.session_id.clone(),
            task_name: notice.task_name.clone(),
            status: notice.status,
            timestamp: notice.timestamp,
        })
    }
}

#[async_trait]
impl NotifyChannel for GatewayChannel {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn deliver(&self, notice: &CompletionNotice) -> Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&Self::event_for(notice))
            .send()
            .await
            .context("gateway wake request failed")?;

        if resp.status().is_success() {
            info!(session_id = %notice.session_id, "Gateway wake delivered");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("gateway returned {status}: {body}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::tests::sample_notice;
    use kimi_common::TaskStatus;

    #[test]
    fn endpoint_joins_base_and_path() {
        let channel = GatewayChannel::new(
            reqwest::Client::new(),
            "http://127.0.0.1:18789/",
            "t".into(),
        );
        assert_eq!(channel.endpoint(), "http://127.0.0.1:18789/hooks/wake");
    }

    #[test]
    fn wake_body_shape() {
        let notice = sample_notice(TaskStatus::Done);
        let value = serde_json::to_value(GatewayChannel::event_for(&notice)).unwrap();
        assert_eq!(value["type"], "kimi-task-complete");
        assert_eq!(value["payload"]["session_id"], notice.session_id.as_str());
        assert_eq!(value["payload"]["task_name"], "nightly-build");
        assert_eq!(value["payload"]["status"], "done");
        assert!(value["payload"]["timestamp"].is_string());
    }
}
