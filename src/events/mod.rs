use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    /// Used on paths where event delivery is not worth failing the request.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event.clone()).await {
            warn!("Dropping event {:?}: {}", event, e);
        }
    }
}

// The events that can occur in the storefront.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated(Uuid),
    CartItemAdded {
        cart_id: Uuid,
        course_id: Uuid,
    },
    CartItemRemoved {
        cart_id: Uuid,
        course_id: Uuid,
    },
    CartCleared(Uuid),
    CartConverted(Uuid),

    // Checkout events
    CheckoutStarted {
        cart_id: Uuid,
        preference_id: String,
    },

    // Payment events
    PaymentApproved {
        payment_id: String,
    },
    PaymentIgnored {
        payment_id: String,
        status: String,
    },

    // Entitlement events
    EntitlementGranted {
        course_id: Uuid,
        payment_id: String,
    },
}

// Processes incoming events. At this scale the consumer is a structured log
// sink; anything that needs to fan out further (mail, analytics) hooks in here.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::CartCreated(cart_id) => {
                debug!(cart_id = %cart_id, "cart created");
            }
            Event::CartItemAdded { cart_id, course_id } => {
                debug!(cart_id = %cart_id, course_id = %course_id, "cart item added");
            }
            Event::CartItemRemoved { cart_id, course_id } => {
                debug!(cart_id = %cart_id, course_id = %course_id, "cart item removed");
            }
            Event::CartCleared(cart_id) => {
                debug!(cart_id = %cart_id, "cart cleared");
            }
            Event::CartConverted(cart_id) => {
                info!(cart_id = %cart_id, "cart converted by confirmed payment");
            }
            Event::CheckoutStarted {
                cart_id,
                preference_id,
            } => {
                info!(cart_id = %cart_id, preference_id = %preference_id, "checkout started");
            }
            Event::PaymentApproved { payment_id } => {
                info!(payment_id = %payment_id, "payment approved");
            }
            Event::PaymentIgnored { payment_id, status } => {
                debug!(payment_id = %payment_id, status = %status, "payment notification ignored");
            }
            Event::EntitlementGranted {
                course_id,
                payment_id,
            } => {
                info!(course_id = %course_id, payment_id = %payment_id, "entitlement granted");
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_event_to_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);

        let cart_id = Uuid::new_v4();
        sender.send(Event::CartCreated(cart_id)).await.unwrap();

        match rx.recv().await {
            Some(Event::CartCreated(id)) => assert_eq!(id, cart_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_or_log_swallows_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        // Must not panic or error out
        sender
            .send_or_log(Event::PaymentApproved {
                payment_id: "123".into(),
            })
            .await;
    }

    #[test]
    fn events_serialize_round_trip() {
        let event = Event::EntitlementGranted {
            course_id: Uuid::new_v4(),
            payment_id: "987".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        match back {
            Event::EntitlementGranted { payment_id, .. } => assert_eq!(payment_id, "987"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
