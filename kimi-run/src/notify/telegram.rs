use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use kimi_common::limits::{tail, CHAT_OUTPUT_BUDGET};
use kimi_common::TaskStatus;

use super::{CompletionNotice, NotifyChannel};

/// Chat target parsed from `<chat_id>` or `<chat_id>:<thread_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramTarget {
    pub chat_id: String,
    pub thread_id: Option<i64>,
}

impl TelegramTarget {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (chat, thread) = match raw.split_once(':') {
            Some((chat, thread)) => (chat.trim(), Some(thread.trim().parse::<i64>().ok()?)),
            None => (raw, None),
        };
        if chat.is_empty() {
            return None;
        }
        Some(Self {
            chat_id: chat.to_string(),
            thread_id: thread,
        })
    }
}

/// Bot API `sendMessage` to the task's chat group.
pub struct TelegramChannel {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramChannel {
    pub fn new(client: reqwest::Client, api_base: &str, bot_token: String) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.bot_token)
    }

    pub fn form_for(target: &TelegramTarget, notice: &CompletionNotice) -> Vec<(&'static str, String)> {
        let mut form = vec![("chat_id", target.chat_id.clone())];
        if let Some(thread) = target.thread_id {
            form.push(("message_thread_id", thread.to_string()));
        }
        form.push(("parse_mode", "HTML".to_string()));
        form.push(("text", format_message(notice)));
        form
    }
}

#[async_trait]
impl NotifyChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn skip_reason(&self, notice: &CompletionNotice) -> Option<String> {
        match notice.telegram_group.as_deref() {
            None => Some("no telegram group for this task".to_string()),
            Some(raw) if TelegramTarget::parse(raw).is_none() => {
                Some(format!("invalid telegram group '{}'", raw))
            }
            Some(_) => None,
        }
    }

    async fn deliver(&self, notice: &CompletionNotice) -> Result<()> {
        let target = notice
            .telegram_group
            .as_deref()
            .and_then(TelegramTarget::parse)
            .context("no usable telegram group")?;

        let resp = self
            .client
            .post(self.endpoint())
            .form(&Self::form_for(&target, notice))
            .send()
            .await
            .context("telegram request failed")?;

        if resp.status().is_success() {
            info!(chat_id = %target.chat_id, session_id = %notice.session_id, "Telegram notification sent");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("telegram API error {status}: {body}")
        }
    }
}

fn status_emoji(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Done => "✅",
        TaskStatus::Failed => "❌",
        TaskStatus::Interrupted => "⚠️",
        TaskStatus::Running => "⏳",
    }
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// HTML message body. The output excerpt is cut to the chat budget before
/// escaping so markup never gets split.
pub fn format_message(notice: &CompletionNotice) -> String {
    let exit_code = notice
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "-".to_string());
    let excerpt = tail(notice.output.trim_end(), CHAT_OUTPUT_BUDGET);

    format!(
        "{} <b>Kimi task {}</b>\n<b>Task:</b> {}\n<b>Exit code:</b> {}\n<b>Workdir:</b> <code>{}</code>\n<b>Finished:</b> {}\n\n<pre>{}</pre>",
        status_emoji(notice.status),
        notice.status,
        escape_html(&notice.task_name),
        exit_code,
        escape_html(&notice.workdir.to_string_lossy()),
        notice.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        escape_html(excerpt),
    )
}
