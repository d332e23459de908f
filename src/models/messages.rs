// src/models/messages.rs
use serde::{Deserialize, Serialize};

use crate::models::events::RideEvent;

/// English text with its Arabic counterpart.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LocalizedText {
    pub en: String,
    pub ar: String,
}

impl LocalizedText {
    pub fn new(en: impl Into<String>, ar: impl Into<String>) -> Self {
        Self { en: en.into(), ar: ar.into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Client,
    Driver,
}

pub struct RideNotice {
    pub recipient: Recipient,
    pub kind: &'static str,
    pub title: LocalizedText,
    pub body: LocalizedText,
}

// Push copy per lifecycle event
impl RideNotice {
    pub fn for_event(event: &RideEvent) -> Option<Self> {
        let notice = match event {
            RideEvent::RideRequested { .. } => RideNotice {
                recipient: Recipient::Client,
                kind: "ride_requested",
                title: LocalizedText::new("Finding your driver", "جارٍ البحث عن سائق"),
                body: LocalizedText::new(
                    "We are looking for a driver near you",
                    "نبحث عن سائق بالقرب منك",
                ),
            },
            RideEvent::RideAccepted { .. } => RideNotice {
                recipient: Recipient::Client,
                kind: "ride_accepted",
                title: LocalizedText::new("Driver found", "تم العثور على سائق"),
                body: LocalizedText::new("A driver accepted your ride", "قبل سائق رحلتك"),
            },
            RideEvent::DriverArriving { .. } => RideNotice {
                recipient: Recipient::Client,
                kind: "driver_arriving",
                title: LocalizedText::new("Driver on the way", "السائق في الطريق"),
                body: LocalizedText::new(
                    "Your driver is heading to the pickup point",
                    "سائقك متجه إلى نقطة الالتقاء",
                ),
            },
            RideEvent::DriverArrived { .. } => RideNotice {
                recipient: Recipient::Client,
                kind: "driver_arrived",
                title: LocalizedText::new("Driver arrived", "وصل السائق"),
                body: LocalizedText::new(
                    "Your driver is waiting at the pickup point",
                    "سائقك ينتظرك في نقطة الالتقاء",
                ),
            },
            RideEvent::RideStarted { .. } => RideNotice {
                recipient: Recipient::Client,
                kind: "ride_started",
                title: LocalizedText::new("Ride started", "بدأت الرحلة"),
                body: LocalizedText::new("Enjoy your ride", "نتمنى لك رحلة سعيدة"),
            },
            RideEvent::RideCompleted { actual_fare, currency, .. } => RideNotice {
                recipient: Recipient::Client,
                kind: "ride_completed",
                title: LocalizedText::new("Ride completed", "اكتملت الرحلة"),
                body: LocalizedText::new(
                    format!("Your fare is {} {}", actual_fare, currency),
                    format!("أجرة رحلتك {} {}", actual_fare, currency),
                ),
            },
            RideEvent::RideCancelled { cancelled_by, .. } => {
                let recipient = match cancelled_by {
                    crate::models::ride::Party::Client => Recipient::Driver,
                    crate::models::ride::Party::Driver => Recipient::Client,
                };
                RideNotice {
                    recipient,
                    kind: "ride_cancelled",
                    title: LocalizedText::new("Ride cancelled", "تم إلغاء الرحلة"),
                    body: LocalizedText::new(
                        "The ride has been cancelled",
                        "تم إلغاء الرحلة من قبل الطرف الآخر",
                    ),
                }
            }
            _ => return None,
        };
        Some(notice)
    }

    pub fn ride_request(pickup_address: &str, fare: i64, currency: &str) -> Self {
        RideNotice {
            recipient: Recipient::Driver,
            kind: "ride_request",
            title: LocalizedText::new("New ride request", "طلب رحلة جديد"),
            body: LocalizedText::new(
                format!("Pickup at {} - {} {}", pickup_address, fare, currency),
                format!("الالتقاء في {} - {} {}", pickup_address, fare, currency),
            ),
        }
    }
}
