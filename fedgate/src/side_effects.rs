// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of fedgate.
//
// fedgate is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// fedgate is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with fedgate.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Side effects
//!
//! ## Introduction
//!
//! Everything that follows from an inbound activity, beyond recording it (notifying the recipient,
//! fanning a status out to timelines, dereferencing a forwarded note from its origin), happens
//! asynchronously. The dispatcher's part is to describe that work in a [FromFederator] message &
//! hand it off through [Enqueue] without waiting on it.
//!
//! ## Back-pressure
//!
//! The queue is bounded. When it's full, [BoundedQueue::enqueue] fails with [Error::QueueFull]
//! rather than blocking the inbound request; the dispatcher surfaces that as a failure of the
//! activity (so the remote server will retry) rather than silently dropping the work.
//!
//! ## Consumption
//!
//! The worker pool that actually executes side effects lives elsewhere. [drain] is a minimal
//! consumer that logs & discards each message; the daemon runs it so the queue never fills.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Notify,
    },
    task::JoinHandle,
};
use tracing::{debug, info};
use url::Url;

use crate::{
    ap_entities::{Type, WireObject},
    counter_add, gauge_setu,
    entities::{Account, Block, FollowRequest, Report, Status, StatusFave},
    metrics::{self, Instruments, Sort},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("The side-effect queue is full ({capacity} messages)"))]
    QueueFull { capacity: usize, backtrace: Backtrace },
    #[snafu(display("The side-effect queue has been closed"))]
    QueueClosed { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Messages                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An internal record produced by the dispatcher
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Model {
    Block(Block),
    FollowRequest(FollowRequest),
    Report(Report),
    Status(Status),
    StatusFave(StatusFave),
}

/// What a side-effect message carries: the converted internal model (full, trusted content), the
/// original wire object (partial content), or only the object's identifier (nothing we're prepared
/// to trust; dereference it)
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    Iri(Url),
    /// None of the inbound handlers produce this today: each either converts fully or defers to
    /// dereferencing. It's here for producers holding an object they can neither convert nor
    /// dereference, so that consumers already handle all three cases.
    Wire(WireObject),
    Model(Model),
}

/// A unit of asynchronous work resulting from an inbound activity
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FromFederator {
    pub object_type: Type,
    pub activity_type: Type,
    /// The local account to which the activity was delivered
    pub receiving_account: Account,
    pub payload: Payload,
}

impl FromFederator {
    /// Describe the creation of `model`
    pub fn create(object_type: Type, receiving_account: &Account, model: Model) -> FromFederator {
        FromFederator {
            object_type,
            activity_type: Type::Create,
            receiving_account: receiving_account.clone(),
            payload: Payload::Model(model),
        }
    }
    /// Request that the object at `iri` be fetched from its origin & processed
    pub fn dereference(object_type: Type, receiving_account: &Account, iri: Url) -> FromFederator {
        FromFederator {
            object_type,
            activity_type: Type::Create,
            receiving_account: receiving_account.clone(),
            payload: Payload::Iri(iri),
        }
    }
    pub fn iri(&self) -> Option<&Url> {
        match &self.payload {
            Payload::Iri(iri) => Some(iri),
            _ => None,
        }
    }
    pub fn wire_object(&self) -> Option<&WireObject> {
        match &self.payload {
            Payload::Wire(wire) => Some(wire),
            _ => None,
        }
    }
    pub fn model(&self) -> Option<&Model> {
        match &self.payload {
            Payload::Model(model) => Some(model),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Queue                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Hand a message off for asynchronous processing, without waiting
pub trait Enqueue {
    fn enqueue(&self, msg: FromFederator) -> Result<()>;
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// The maximum number of messages awaiting processing
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue_capacity: 1024,
        }
    }
}

inventory::submit! { metrics::Registration::new("side_effects.enqueued", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("side_effects.rejected", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("side_effects.drained", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("side_effects.depth", Sort::IntegralGauge) }

/// An [Enqueue] implementation over a bounded `tokio` channel
#[derive(Clone)]
pub struct BoundedQueue {
    sender: mpsc::Sender<FromFederator>,
    capacity: usize,
    instruments: Arc<Instruments>,
}

impl BoundedQueue {
    /// Create a queue & the receiver from which its messages may be taken
    pub fn new(
        config: &Config,
        instruments: Arc<Instruments>,
    ) -> (BoundedQueue, mpsc::Receiver<FromFederator>) {
        // `mpsc::channel` panics on a zero capacity
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        (
            BoundedQueue {
                sender,
                capacity,
                instruments,
            },
            receiver,
        )
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Enqueue for BoundedQueue {
    fn enqueue(&self, msg: FromFederator) -> Result<()> {
        match self.sender.try_send(msg) {
            Ok(()) => {
                counter_add!(self.instruments, "side_effects.enqueued", 1, &[]);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                counter_add!(self.instruments, "side_effects.rejected", 1, &[]);
                QueueFullSnafu {
                    capacity: self.capacity,
                }
                .fail()
            }
            Err(TrySendError::Closed(_)) => {
                counter_add!(self.instruments, "side_effects.rejected", 1, &[]);
                QueueClosedSnafu.fail()
            }
        }
    }
}

/// Consume side-effect messages, logging each, until `shutdown` is notified or every sender has
/// been dropped
pub fn drain(
    mut receiver: mpsc::Receiver<FromFederator>,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = receiver.recv() => {
                    match msg {
                        Some(msg) => {
                            debug!(
                                "Side effect: {} {} for {} ({:?})",
                                msg.activity_type, msg.object_type, msg.receiving_account.uri, msg.payload
                            );
                            counter_add!(instruments, "side_effects.drained", 1, &[]);
                            gauge_setu!(instruments, "side_effects.depth", receiver.len() as u64, &[]);
                        }
                        None => break,
                    }
                },
                _ = shutdown.notified() => break,
            }
        }
        info!("Side-effect drain exiting.");
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::entities::AccountId;

    fn bob() -> Account {
        Account {
            id: AccountId::new(),
            username: "bob".to_owned(),
            domain: None,
            uri: Url::parse("https://local.example/users/bob").unwrap(),
        }
    }

    fn msg(n: usize) -> FromFederator {
        FromFederator::dereference(
            Type::Note,
            &bob(),
            Url::parse(&format!("https://remote.example/notes/{}", n)).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_full_queue() {
        let (queue, mut receiver) = BoundedQueue::new(
            &Config { queue_capacity: 2 },
            Arc::new(Instruments::default()),
        );
        queue.enqueue(msg(1)).unwrap();
        queue.enqueue(msg(2)).unwrap();
        assert!(matches!(queue.enqueue(msg(3)), Err(Error::QueueFull { capacity: 2, .. })));

        let first = receiver.recv().await.unwrap();
        assert_eq!(
            first.iri().unwrap().as_str(),
            "https://remote.example/notes/1"
        );
        assert!(first.model().is_none() && first.wire_object().is_none());
        // Room again
        queue.enqueue(msg(3)).unwrap();

        drop(receiver);
        assert!(matches!(queue.enqueue(msg(4)), Err(Error::QueueClosed { .. })));
    }

    #[tokio::test]
    async fn test_drain() {
        let instruments = Arc::new(Instruments::default());
        let (queue, receiver) = BoundedQueue::new(&Config::default(), instruments.clone());
        let shutdown = Arc::new(Notify::new());
        let handle = drain(receiver, shutdown.clone(), instruments);
        for n in 0..8 {
            queue.enqueue(msg(n)).unwrap();
        }
        // Dropping the last sender ends the drain once it has caught up
        drop(queue);
        handle.await.unwrap();
    }
}
