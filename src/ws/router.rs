//! Routing of decoded sub-messages.
//!
//! [`MessageRouter`] classifies every [`DecodedMessage`] by reference id:
//! ids starting with `_` are decoded into a [`ControlMessage`] and handed
//! back to the session, everything else goes to the channel of the
//! subscription registered under that id.
//!
//! The router is synchronous and owns no I/O. REST calls for creating and
//! recreating subscriptions are issued by the session; the router only keeps
//! the bookkeeping that decides which messages are current:
//!
//! - a subscription receives data only while it is *active*; messages that
//!   arrive while its creation or recreation is in flight are stale and are
//!   dropped,
//! - each recreation bumps the subscription's epoch, and REST completions
//!   carrying an older epoch are ignored,
//! - a reset requested while one is already in flight is queued, so there is
//!   never more than one REST pipeline per reference id.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::control::ControlMessage;
use crate::types::subscription::SubscriptionSpec;
use crate::ws::frame::DecodedMessage;

// ---------------------------------------------------------------------------
// Updates delivered to subscribers
// ---------------------------------------------------------------------------

/// What a subscriber receives on its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionUpdate {
    /// Full state from the REST create call. Always precedes `Data`, and is
    /// sent again after every successful reset.
    Snapshot(Value),
    /// A streamed delta.
    Data(DecodedMessage),
    /// The server asked for this subscription to be recreated; a new
    /// `Snapshot` follows once that is done.
    Reset,
    /// No further updates will arrive.
    Closed {
        /// Why the subscription ended.
        reason: String,
    },
}

/// Sending half of a subscriber channel.
pub type UpdateSender = mpsc::UnboundedSender<SubscriptionUpdate>;

// ---------------------------------------------------------------------------
// Subscription state
// ---------------------------------------------------------------------------

/// Last delivered message id per application reference id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionState {
    last_ids: HashMap<String, u64>,
}

impl SubscriptionState {
    /// Last message id delivered for `reference_id`.
    pub fn get(&self, reference_id: &str) -> Option<u64> {
        self.last_ids.get(reference_id).copied()
    }

    /// Number of tracked reference ids.
    pub fn len(&self) -> usize {
        self.last_ids.len()
    }

    /// Whether nothing has been delivered yet.
    pub fn is_empty(&self) -> bool {
        self.last_ids.is_empty()
    }

    /// Iterate over `(reference id, last message id)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.last_ids.iter().map(|(k, v)| (k.as_str(), *v))
    }

    fn record(&mut self, reference_id: &str, message_id: u64) {
        match self.last_ids.get_mut(reference_id) {
            Some(id) => *id = message_id,
            None => {
                self.last_ids.insert(reference_id.to_owned(), message_id);
            }
        }
    }

    fn forget(&mut self, reference_id: &str) {
        self.last_ids.remove(reference_id);
    }
}

// ---------------------------------------------------------------------------
// Routing outcomes
// ---------------------------------------------------------------------------

/// Why an application message was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Nothing is registered under the reference id.
    Unregistered,
    /// The subscription's create call has not completed yet.
    Pending,
    /// The subscription is being recreated after a reset.
    Resubscribing,
    /// The subscriber dropped its receiver.
    SubscriberGone,
}

/// Outcome of routing one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Delivered to the subscriber.
    Delivered {
        /// Subscription the message went to.
        reference_id: String,
        /// Id of the delivered message.
        message_id: u64,
    },
    /// A control message for the session to act on.
    Control {
        /// Id of the control message.
        message_id: u64,
        /// The decoded control payload.
        control: ControlMessage,
    },
    /// A known control id whose payload did not have the expected shape.
    InvalidControl {
        /// The control reference id.
        reference_id: String,
        /// Id of the control message.
        message_id: u64,
        /// Decoder error text.
        reason: String,
    },
    /// An application message that was not delivered.
    Dropped {
        /// The message's reference id.
        reference_id: String,
        /// Id of the dropped message.
        message_id: u64,
        /// Why it was dropped.
        reason: DropReason,
    },
}

/// Next step after [`MessageRouter::begin_reset`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResetStep {
    /// Tear down and recreate now, tagging the REST calls with `epoch`.
    Start {
        /// Epoch of the recreation.
        epoch: u64,
        /// How to recreate the subscription.
        spec: SubscriptionSpec,
    },
    /// A REST pipeline is already running for this id; another pass will
    /// follow when it completes.
    Queued,
    /// Nothing is registered under the id.
    Unknown,
}

/// Next step after [`MessageRouter::finish`].
#[derive(Debug, Clone, PartialEq)]
pub enum FinishStep {
    /// The subscription is active and its snapshot was delivered.
    Done,
    /// A reset was queued meanwhile; run the pipeline again with `epoch`.
    Again {
        /// Epoch of the new pass.
        epoch: u64,
        /// How to recreate the subscription.
        spec: SubscriptionSpec,
    },
    /// The REST call failed; the subscription was removed and its
    /// subscriber told.
    Failed,
    /// The completion belongs to an older epoch or a removed subscription.
    Stale,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Creating { queued_reset: bool },
    Resubscribing { queued_reset: bool },
    Active,
}

#[derive(Debug)]
struct Route {
    spec: SubscriptionSpec,
    sender: UpdateSender,
    status: Status,
    epoch: u64,
}

/// Dispatches decoded messages to control handling or subscribers.
#[derive(Debug, Default)]
pub struct MessageRouter {
    routes: HashMap<String, Route>,
    state: SubscriptionState,
    next_epoch: u64,
}

impl MessageRouter {
    /// An empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last delivered message ids.
    pub fn state(&self) -> &SubscriptionState {
        &self.state
    }

    /// Register a subscription whose create call is about to be issued.
    ///
    /// Messages for it are dropped until [`finish`](Self::finish) reports
    /// success. Returns the epoch to pass to `finish`.
    pub fn register(
        &mut self,
        reference_id: impl Into<String>,
        spec: SubscriptionSpec,
        sender: UpdateSender,
    ) -> u64 {
        let epoch = self.bump_epoch();
        self.routes.insert(
            reference_id.into(),
            Route {
                spec,
                sender,
                status: Status::Creating {
                    queued_reset: false,
                },
                epoch,
            },
        );
        epoch
    }

    /// Register a subscription that is already live server side.
    pub fn register_active(
        &mut self,
        reference_id: impl Into<String>,
        spec: SubscriptionSpec,
        sender: UpdateSender,
    ) {
        let epoch = self.bump_epoch();
        self.routes.insert(
            reference_id.into(),
            Route {
                spec,
                sender,
                status: Status::Active,
                epoch,
            },
        );
    }

    /// Remove a subscription. Its subscriber receives `Closed`.
    pub fn remove(&mut self, reference_id: &str, reason: &str) -> Option<SubscriptionSpec> {
        self.state.forget(reference_id);
        let route = self.routes.remove(reference_id)?;
        let _ = route.sender.send(SubscriptionUpdate::Closed {
            reason: reason.to_owned(),
        });
        Some(route.spec)
    }

    /// Whether `reference_id` is registered in any state.
    pub fn contains(&self, reference_id: &str) -> bool {
        self.routes.contains_key(reference_id)
    }

    /// Whether `reference_id` is registered and receiving data.
    pub fn is_active(&self, reference_id: &str) -> bool {
        self.routes
            .get(reference_id)
            .is_some_and(|r| r.status == Status::Active)
    }

    /// All registered reference ids.
    pub fn reference_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no subscriptions are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Route one decoded message.
    pub fn route(&mut self, msg: DecodedMessage) -> Routed {
        if msg.is_control() {
            return match ControlMessage::parse(&msg.reference_id, &msg.payload) {
                Ok(control) => Routed::Control {
                    message_id: msg.message_id,
                    control,
                },
                Err(e) => Routed::InvalidControl {
                    reference_id: msg.reference_id,
                    message_id: msg.message_id,
                    reason: e.to_string(),
                },
            };
        }

        let message_id = msg.message_id;
        let Some(route) = self.routes.get(&msg.reference_id) else {
            return Routed::Dropped {
                reference_id: msg.reference_id,
                message_id,
                reason: DropReason::Unregistered,
            };
        };

        let reason = match route.status {
            Status::Active => None,
            Status::Creating { .. } => Some(DropReason::Pending),
            Status::Resubscribing { .. } => Some(DropReason::Resubscribing),
        };
        if let Some(reason) = reason {
            return Routed::Dropped {
                reference_id: msg.reference_id,
                message_id,
                reason,
            };
        }

        let reference_id = msg.reference_id.clone();
        if route.sender.send(SubscriptionUpdate::Data(msg)).is_err() {
            return Routed::Dropped {
                reference_id,
                message_id,
                reason: DropReason::SubscriberGone,
            };
        }

        self.state.record(&reference_id, message_id);
        Routed::Delivered {
            reference_id,
            message_id,
        }
    }

    /// Start recreating `reference_id` after a reset request.
    ///
    /// Calling this again before the pipeline finishes does not start a
    /// second one; the reset is queued and [`finish`](Self::finish) returns
    /// [`FinishStep::Again`].
    pub fn begin_reset(&mut self, reference_id: &str) -> ResetStep {
        let next_epoch = self.next_epoch + 1;
        let Some(route) = self.routes.get_mut(reference_id) else {
            return ResetStep::Unknown;
        };

        if let Status::Creating { queued_reset } | Status::Resubscribing { queued_reset } =
            &mut route.status
        {
            *queued_reset = true;
            return ResetStep::Queued;
        }

        route.status = Status::Resubscribing {
            queued_reset: false,
        };
        route.epoch = next_epoch;
        let _ = route.sender.send(SubscriptionUpdate::Reset);
        let spec = route.spec.clone();
        self.next_epoch = next_epoch;
        ResetStep::Start {
            epoch: next_epoch,
            spec,
        }
    }

    /// Record the outcome of a create or recreate call tagged with `epoch`.
    ///
    /// On success the snapshot (if any) is sent to the subscriber and the
    /// subscription becomes active.
    pub fn finish(
        &mut self,
        reference_id: &str,
        epoch: u64,
        result: Result<Option<Value>, String>,
    ) -> FinishStep {
        let next_epoch = self.next_epoch + 1;
        let Some(route) = self.routes.get_mut(reference_id) else {
            return FinishStep::Stale;
        };
        if route.epoch != epoch {
            return FinishStep::Stale;
        }

        let queued = match route.status {
            Status::Creating { queued_reset } | Status::Resubscribing { queued_reset } => {
                queued_reset
            }
            Status::Active => return FinishStep::Stale,
        };

        if queued {
            route.status = Status::Resubscribing {
                queued_reset: false,
            };
            route.epoch = next_epoch;
            self.next_epoch = next_epoch;
            let _ = route.sender.send(SubscriptionUpdate::Reset);
            return FinishStep::Again {
                epoch: next_epoch,
                spec: route.spec.clone(),
            };
        }

        match result {
            Ok(snapshot) => {
                route.status = Status::Active;
                if let Some(snapshot) = snapshot {
                    let _ = route.sender.send(SubscriptionUpdate::Snapshot(snapshot));
                }
                FinishStep::Done
            }
            Err(reason) => {
                self.remove(reference_id, &reason);
                FinishStep::Failed
            }
        }
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}
