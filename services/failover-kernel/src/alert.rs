use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::server::{ServerState, ServerUrl};

const ALERT_QUEUE: usize = 64;

/// A server state change worth telling an operator about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAlert {
    pub cluster: String,
    pub server: ServerUrl,
    pub from: ServerState,
    pub to: ServerState,
    pub at: DateTime<Utc>,
}

/// Dispatches alerts to the log and, when configured, to a JSON webhook.
/// Webhook delivery happens on a background task so a slow endpoint never
/// stalls a monitoring tick. Alerts beyond the queue capacity are dropped.
#[derive(Clone)]
pub struct AlertNotifier {
    sender: Option<mpsc::Sender<StateAlert>>,
}

impl AlertNotifier {
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Must be called from within a tokio runtime when `webhook` is set.
    pub fn new(webhook: Option<String>) -> Self {
        Self::with_capacity(webhook, ALERT_QUEUE)
    }

    pub(crate) fn with_capacity(webhook: Option<String>, capacity: usize) -> Self {
        let Some(url) = webhook.filter(|url| !url.trim().is_empty()) else {
            return Self::disabled();
        };
        let (sender, mut receiver) = mpsc::channel::<StateAlert>(capacity.max(1));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        tokio::spawn(async move {
            while let Some(alert) = receiver.recv().await {
                match client.post(&url).json(&alert).send().await {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        warn!(status = %response.status(), server = %alert.server, "alert webhook rejected notification")
                    }
                    Err(error) => warn!(%error, server = %alert.server, "could not deliver alert"),
                }
            }
        });
        Self {
            sender: Some(sender),
        }
    }

    /// Logs the alert and queues it for the webhook. Returns false when the
    /// webhook queue was full and the alert was dropped.
    pub fn notify(&self, alert: StateAlert) -> bool {
        info!(
            cluster = %alert.cluster,
            server = %alert.server,
            from = %alert.from,
            to = %alert.to,
            "ALERT : server state changed"
        );
        let Some(sender) = &self.sender else {
            return true;
        };
        match sender.try_send(alert) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(alert)) => {
                warn!(server = %alert.server, "alert queue full, dropping notification");
                false
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                warn!(server = %alert.server, "alert dispatcher stopped, dropping notification");
                false
            }
        }
    }
}

impl Default for AlertNotifier {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn posts_alerts_to_webhook() {
        let received: Arc<Mutex<Vec<StateAlert>>> = Arc::default();
        let app = Router::new()
            .route(
                "/alerts",
                post(
                    |State(store): State<Arc<Mutex<Vec<StateAlert>>>>, Json(alert): Json<StateAlert>| async move {
                        store.lock().expect("lock").push(alert);
                    },
                ),
            )
            .with_state(received.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });

        let notifier = AlertNotifier::new(Some(format!("http://{addr}/alerts")));
        notifier.notify(StateAlert {
            cluster: "east".into(),
            server: ServerUrl::new("db1", 3306),
            from: ServerState::Master,
            to: ServerState::Failed,
            at: Utc::now(),
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if !received.lock().expect("lock").is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "alert never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let alerts = received.lock().expect("lock");
        assert_eq!(alerts[0].to, ServerState::Failed);
        assert_eq!(alerts[0].server.host, "db1");
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        // accepts connections but never answers, so the dispatcher stays busy
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let notifier = AlertNotifier::with_capacity(Some(format!("http://{addr}/alerts")), 1);
        let queued: Vec<bool> = (0..4)
            .map(|_| {
                notifier.notify(StateAlert {
                    cluster: "east".into(),
                    server: ServerUrl::new("db2", 3306),
                    from: ServerState::Slave,
                    to: ServerState::Suspect,
                    at: Utc::now(),
                })
            })
            .collect();
        assert!(queued[0]);
        assert!(queued.iter().any(|queued| !queued));
        drop(listener);
    }

    #[test]
    fn disabled_notifier_only_logs() {
        let notifier = AlertNotifier::disabled();
        assert!(notifier.notify(StateAlert {
            cluster: "east".into(),
            server: ServerUrl::new("db1", 3306),
            from: ServerState::Master,
            to: ServerState::Failed,
            at: Utc::now(),
        }));
    }
}
