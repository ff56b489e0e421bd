//! Chat notifier for failure and recovery alerts.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::events::{Event, EventBus, EventKind, StatusChange};

const TELEGRAM_API: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat API rejected message ({status}): {body}")]
    Api { status: u16, body: String },
}

/// Destination for rendered alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), NotifyError>;
}

/// Telegram Bot API `sendMessage` sink.
pub struct TelegramSink {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

impl TelegramSink {
    pub fn new(token: &str) -> Result<Self, NotifyError> {
        Self::with_base_url(token, TELEGRAM_API)
    }

    pub fn with_base_url(token: &str, base_url: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let response = self
            .client
            .post(&url)
            .json(&SendMessage {
                chat_id,
                text,
                parse_mode: "HTML",
                disable_web_page_preview: true,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Forwards failure and recovery events to a fixed list of chats.
pub struct Notifier {
    sink: Arc<dyn AlertSink>,
    recipients: Vec<i64>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn AlertSink>, recipients: Vec<i64>) -> Self {
        Self { sink, recipients }
    }

    /// HTML alert text for events worth a notification.
    pub fn render(event: &Event) -> Option<String> {
        match &event.kind {
            EventKind::Failure(change) => Some(format!(
                "🔴 <b>Device unreachable</b>\n{}\n<b>Time:</b> {}",
                describe(change),
                alert_time(change)
            )),
            EventKind::Recovery(change) => {
                let latency = change
                    .response_time
                    .map(|ms| format!("\n<b>Latency:</b> {:.1} ms", ms))
                    .unwrap_or_default();
                Some(format!(
                    "🟢 <b>Device back online</b>\n{}{}\n<b>Time:</b> {}",
                    describe(change),
                    latency,
                    alert_time(change)
                ))
            }
            _ => None,
        }
    }

    /// Send `text` to every recipient. A failed recipient does not stop the
    /// others. Returns the number of successful sends.
    pub async fn dispatch(&self, text: &str) -> usize {
        let mut delivered = 0;
        for chat_id in &self.recipients {
            match self.sink.send(*chat_id, text).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::error!("Failed to notify chat {}: {}", chat_id, e),
            }
        }
        delivered
    }

    /// Subscribe to the bus and forward alerts until the bus closes.
    ///
    /// History replayed on subscribe predates the notifier and is skipped.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let subscription = bus.subscribe();
        let since = Utc::now();
        tracing::info!(
            "Notifier subscribed ({}, {} recipients)",
            subscription.id(),
            self.recipients.len()
        );

        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if event.timestamp < since {
                    continue;
                }
                if let Some(text) = Self::render(&event) {
                    let delivered = self.dispatch(&text).await;
                    tracing::debug!(
                        "{} alert delivered to {}/{} chats",
                        event.type_name(),
                        delivered,
                        self.recipients.len()
                    );
                }
            }
            tracing::info!("Notifier stopped");
        })
    }
}

fn describe(change: &StatusChange) -> String {
    format!(
        "<b>Device:</b> <code>{}</code>\n<b>Address:</b> <code>{}</code>\n<b>Status:</b> {} → {}",
        escape_html(&change.device_id),
        escape_html(&change.ip),
        change.old_status,
        change.new_status
    )
}

fn alert_time(change: &StatusChange) -> String {
    change.changed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CycleCompleted, CycleSummary, PhaseTimings};
    use crate::scheduler::HealthStatus;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(i64, String)>>,
        failing: Vec<i64>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
            if self.failing.contains(&chat_id) {
                return Err(NotifyError::Api {
                    status: 403,
                    body: "bot was blocked by the user".to_string(),
                });
            }
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    fn change(from: HealthStatus, to: HealthStatus) -> StatusChange {
        StatusChange {
            device_id: "T001".to_string(),
            ip: "10.2.98.112".to_string(),
            old_status: from,
            new_status: to,
            response_time: (to == HealthStatus::Online).then_some(20.0),
            changed_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_failure_and_recovery_only() {
        let failure = Event::new(EventKind::Failure(change(
            HealthStatus::Online,
            HealthStatus::Offline,
        )));
        let text = Notifier::render(&failure).unwrap();
        assert!(text.contains("Device unreachable"));
        assert!(text.contains("<code>T001</code>"));
        assert!(text.contains("<code>10.2.98.112</code>"));
        assert!(text.contains("online → offline"));

        let recovery = Event::new(EventKind::Recovery(change(
            HealthStatus::Offline,
            HealthStatus::Online,
        )));
        let text = Notifier::render(&recovery).unwrap();
        assert!(text.contains("back online"));
        assert!(text.contains("20.0 ms"));

        let changed = Event::new(EventKind::StatusChanged(change(
            HealthStatus::Offline,
            HealthStatus::Error,
        )));
        assert!(Notifier::render(&changed).is_none());

        let cycle = Event::new(EventKind::CycleCompleted(CycleCompleted {
            summary: CycleSummary::tally(std::iter::empty(), PhaseTimings::default()),
            results: Vec::new(),
        }));
        assert!(Notifier::render(&cycle).is_none());
    }

    #[test]
    fn test_render_uses_probe_time() {
        let mut c = change(HealthStatus::Online, HealthStatus::Offline);
        c.changed_at = Utc.with_ymd_and_hms(2026, 3, 14, 8, 30, 5).unwrap();
        let event = Event::new(EventKind::Failure(c));

        let text = Notifier::render(&event).unwrap();
        assert!(text.contains("2026-03-14 08:30:05 UTC"));
    }

    #[test]
    fn test_render_escapes_html() {
        let mut c = change(HealthStatus::Online, HealthStatus::Offline);
        c.device_id = "<gate&1>".to_string();
        let text = Notifier::render(&Event::new(EventKind::Failure(c))).unwrap();
        assert!(text.contains("&lt;gate&amp;1&gt;"));
    }

    #[tokio::test]
    async fn test_dispatch_isolates_recipient_failures() {
        let sink = Arc::new(RecordingSink {
            failing: vec![2],
            ..Default::default()
        });
        let notifier = Notifier::new(sink.clone(), vec![1, 2, 3]);

        assert_eq!(notifier.dispatch("hello").await, 2);
        let recipients: Vec<_> = sink.sent.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(recipients, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_spawned_notifier_forwards_live_alerts() {
        let bus = EventBus::new();
        // Published before the notifier exists, replayed on subscribe
        bus.publish(Event::new(EventKind::Failure(change(
            HealthStatus::Online,
            HealthStatus::Offline,
        ))));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sink = Arc::new(RecordingSink::default());
        let handle = Notifier::new(sink.clone(), vec![10, 20]).spawn(&bus);

        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.publish(Event::new(EventKind::Recovery(change(
            HealthStatus::Offline,
            HealthStatus::Online,
        ))));
        bus.heartbeat();

        bus.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("notifier exits when the bus closes")
            .unwrap();

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, text)| text.contains("back online")));
    }
}
