//! Fan-out of inserted and updated commands to matching subscriptions.

use crate::error::DeliveryError;
use crate::subscriptions::{Delivery, HubEvent, SubscriptionRegistry};
use crate::types::{Command, ConnectionId, SubscriptionId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Counts from one dispatch pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Subscriptions (and update watchers) that matched.
    pub matched: usize,
    /// Events enqueued on a connection.
    pub delivered: usize,
    /// Events dropped on a full or closed connection.
    pub dropped: usize,
}

impl DispatchOutcome {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Sent => self.delivered += 1,
            Delivery::Failed(_) => self.dropped += 1,
            Delivery::Skipped => {}
        }
    }
}

/// Routes commands to every subscription live at publish time.
///
/// Sends never block: each event goes on the owning connection's bounded
/// queue with `try_send`, so a slow connection only loses its own events.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver a newly inserted command.
    pub fn publish(&self, command: &Command) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        self.registry.for_each_matching(command, |entry| {
            outcome.matched += 1;
            let delivery = entry.deliver_live(command);
            if let Delivery::Failed(error) = delivery {
                log_failure(entry.owner, Some(entry.id), command, error);
            }
            outcome.record(delivery);
        });

        debug!(
            command_id = %command.id,
            device_id = %command.device_id,
            matched = outcome.matched,
            delivered = outcome.delivered,
            "command dispatched"
        );
        outcome
    }

    /// Deliver an updated command to subscriptions and to its update watchers.
    pub fn publish_update(&self, command: &Command) -> DispatchOutcome {
        let mut outcome = self.publish(command);

        self.registry
            .for_each_update_watcher(command, |connection_id, outbound| {
                outcome.matched += 1;
                let event = HubEvent::CommandUpdate {
                    command: command.clone(),
                };
                let delivery = match outbound.try_send(event) {
                    Ok(()) => Delivery::Sent,
                    Err(e) => {
                        let error = DeliveryError::from(e);
                        log_failure(connection_id, None, command, error);
                        Delivery::Failed(error)
                    }
                };
                outcome.record(delivery);
            });

        outcome
    }
}

fn log_failure(
    connection_id: ConnectionId,
    subscription_id: Option<SubscriptionId>,
    command: &Command,
    error: DeliveryError,
) {
    match error {
        DeliveryError::ConnectionFull => warn!(
            connection_id = %connection_id,
            subscription_id = ?subscription_id,
            command_id = %command.id,
            "delivery dropped: {}", error
        ),
        DeliveryError::ConnectionClosed => debug!(
            connection_id = %connection_id,
            subscription_id = ?subscription_id,
            command_id = %command.id,
            "delivery dropped: {}", error
        ),
    }
}
