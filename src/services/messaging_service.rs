// src/services/messaging_service.rs
use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::messages::{LocalizedText, Recipient, RideNotice},
};

#[derive(Debug, Clone)]
pub struct FcmConfig {
    pub fcm_server_key: String,
    pub fcm_url: String,
}

impl FcmConfig {
    pub fn with_server_key(server_key: impl Into<String>) -> Self {
        Self {
            fcm_server_key: server_key.into(),
            fcm_url: "https://fcm.googleapis.com/fcm/send".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    pub title: LocalizedText,
    pub body: LocalizedText,
    pub data: Option<serde_json::Value>,
    pub priority: NotificationPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum NotificationPriority {
    Normal,
    #[default]
    High,    // Will wake sleeping devices
}

impl NotificationMessage {
    pub fn new(title: LocalizedText, body: LocalizedText) -> Self {
        Self {
            title,
            body,
            data: None,
            priority: NotificationPriority::default(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn from_notice(notice: RideNotice, ride_id: &str) -> Self {
        // Status updates nobody has to act on
        let priority = match notice.kind {
            "ride_requested" | "ride_completed" => NotificationPriority::Normal,
            _ => NotificationPriority::High,
        };
        Self::new(notice.title, notice.body)
            .with_data(json!({
                "type": notice.kind,
                "ride_id": ride_id,
            }))
            .with_priority(priority)
    }
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send_to_user(&self, user_id: &str, message: NotificationMessage) -> DispatchResult<()>;
    async fn send_to_driver(&self, driver_id: &str, message: NotificationMessage) -> DispatchResult<()>;

    async fn send(&self, recipient: Recipient, id: &str, message: NotificationMessage) -> DispatchResult<()> {
        match recipient {
            Recipient::Client => self.send_to_user(id, message).await,
            Recipient::Driver => self.send_to_driver(id, message).await,
        }
    }
}

/// FCM push. Devices subscribe to a per-account topic, so no token lookup is needed here.
pub struct FcmNotificationService {
    config: FcmConfig,
    client: reqwest::Client,
}

impl FcmNotificationService {
    pub fn new(config: FcmConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn topic_for(kind: &str, id: &str) -> String {
        format!("/topics/{}_{}", kind, id)
    }

    async fn send_to_topic(&self, topic: &str, message: NotificationMessage) -> DispatchResult<()> {
        tracing::info!("Sending FCM notification to {}", topic);

        let mut data = message.data.unwrap_or_else(|| json!({}));
        data["title_ar"] = json!(message.title.ar);
        data["body_ar"] = json!(message.body.ar);

        let fcm_message = json!({
            "to": topic,
            "notification": {
                "title": message.title.en,
                "body": message.body.en,
                "sound": "default"
            },
            "data": data,
            "priority": match message.priority {
                NotificationPriority::High => "high",
                NotificationPriority::Normal => "normal",
            }
        });

        let response = self.client
            .post(&self.config.fcm_url)
            .header("Authorization", format!("key={}", self.config.fcm_server_key))
            .json(&fcm_message)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("FCM request failed: {}", error_text);
            return Err(DispatchError::FcmDelivery(error_text));
        }

        tracing::debug!("FCM notification sent successfully");
        Ok(())
    }
}

#[async_trait]
impl NotificationService for FcmNotificationService {
    async fn send_to_user(&self, user_id: &str, message: NotificationMessage) -> DispatchResult<()> {
        self.send_to_topic(&Self::topic_for("client", user_id), message).await
    }

    async fn send_to_driver(&self, driver_id: &str, message: NotificationMessage) -> DispatchResult<()> {
        self.send_to_topic(&Self::topic_for("driver", driver_id), message).await
    }
}

// Mock service for development and testing
#[derive(Debug, Default)]
pub struct MockNotificationService {
    sent: Mutex<Vec<(Recipient, String, NotificationMessage)>>,
}

impl MockNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Recipient, String, NotificationMessage)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, recipient: Recipient, id: &str, message: NotificationMessage) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((recipient, id.to_string(), message));
        }
    }
}

#[async_trait]
impl NotificationService for MockNotificationService {
    async fn send_to_user(&self, user_id: &str, message: NotificationMessage) -> DispatchResult<()> {
        tracing::info!("[MOCK] Would send to user {}: {}", user_id, message.title.en);
        self.record(Recipient::Client, user_id, message);
        Ok(())
    }

    async fn send_to_driver(&self, driver_id: &str, message: NotificationMessage) -> DispatchResult<()> {
        tracing::info!("[MOCK] Would send to driver {}: {}", driver_id, message.title.en);
        self.record(Recipient::Driver, driver_id, message);
        Ok(())
    }
}
