// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Correlation
//!
//! Pending RPC calls by correlation id. A slot is `Pending` until it is either
//! completed with a response or cancelled with an error, both of which remove
//! it atomically: whoever removes the slot first wins, the loser gets
//! [`MessagingError::InvalidAskAttempt`].

use crate::errors::{AskError, MessagingError};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{any::Any, sync::Arc};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Type-erased response value, downcast by the waiting caller.
pub type AskValue = Box<dyn Any + Send>;

pub type AskOutcome = Result<AskValue, AskError>;

struct Slot {
    sender: oneshot::Sender<AskOutcome>,
    receiver: Arc<Mutex<Option<oneshot::Receiver<AskOutcome>>>>,
}

/// Awaits the outcome of one pending call.
pub struct AskHandle {
    key: String,
    receiver: Arc<Mutex<Option<oneshot::Receiver<AskOutcome>>>>,
}

impl AskHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits for the answer or the cancellation of the slot.
    ///
    /// Only one handle of a slot receives the outcome, the other ones get
    /// [`AskError::InvalidAskAttempt`].
    pub async fn wait(self) -> AskOutcome {
        let receiver = self.receiver.lock().await.take();
        match receiver {
            Some(receiver) => receiver.await.unwrap_or(Err(AskError::Cancelled)),
            None => Err(AskError::InvalidAskAttempt(format!(
                "the answer for '{}' is already awaited",
                self.key
            ))),
        }
    }
}

#[derive(Default)]
pub struct AskManager {
    slots: DashMap<String, Slot>,
}

impl AskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the slot for `key`, or joins it when it already exists.
    pub fn get_create_ask(&self, key: &str) -> Result<AskHandle, MessagingError> {
        if key.trim().is_empty() {
            return Err(MessagingError::InvalidAskAttempt(
                "correlation id must not be empty".to_owned(),
            ));
        }

        let receiver = match self.slots.entry(key.to_owned()) {
            Entry::Occupied(slot) => slot.get().receiver.clone(),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = oneshot::channel();
                let receiver = Arc::new(Mutex::new(Some(receiver)));
                vacant.insert(Slot {
                    sender,
                    receiver: receiver.clone(),
                });
                receiver
            }
        };

        Ok(AskHandle {
            key: key.to_owned(),
            receiver,
        })
    }

    /// Completes the slot with the response value.
    pub fn set_answer(&self, key: &str, value: AskValue) -> Result<(), MessagingError> {
        self.resolve(key, Ok(value))
    }

    /// Fails the slot with `error`.
    pub fn cancel(&self, key: &str, error: AskError) -> Result<(), MessagingError> {
        self.resolve(key, Err(error))
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    fn resolve(&self, key: &str, outcome: AskOutcome) -> Result<(), MessagingError> {
        let Some((_, slot)) = self.slots.remove(key) else {
            return Err(MessagingError::InvalidAskAttempt(format!(
                "no pending request with correlation id '{}'",
                key
            )));
        };

        if slot.sender.send(outcome).is_err() {
            debug!(correlation_id = key, "the caller stopped waiting for the answer");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn answer_completes_the_pending_call() {
        let asks = AskManager::new();
        let handle = asks.get_create_ask("abc").unwrap();

        asks.set_answer("abc", Box::new(12_u32)).unwrap();

        let value = handle.wait().await.unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 12);
        assert_eq!(asks.pending(), 0);
    }

    #[tokio::test]
    async fn second_answer_is_invalid() {
        let asks = AskManager::new();
        let _handle = asks.get_create_ask("abc").unwrap();

        asks.set_answer("abc", Box::new(1_u32)).unwrap();
        assert!(matches!(
            asks.set_answer("abc", Box::new(2_u32)),
            Err(MessagingError::InvalidAskAttempt(msg)) if msg.contains("abc")
        ));
    }

    #[tokio::test]
    async fn cancel_fails_the_call_and_removes_the_slot() {
        let asks = AskManager::new();
        let handle = asks.get_create_ask("abc").unwrap();

        asks.cancel("abc", AskError::Timeout(Duration::from_secs(1)))
            .unwrap();

        assert!(matches!(handle.wait().await, Err(AskError::Timeout(_))));
        assert!(!asks.is_pending("abc"));
        assert!(asks.set_answer("abc", Box::new(())).is_err());
        assert!(asks.cancel("abc", AskError::Cancelled).is_err());
    }

    #[tokio::test]
    async fn reentry_joins_the_same_slot() {
        let asks = AskManager::new();
        let first = asks.get_create_ask("abc").unwrap();
        let second = asks.get_create_ask("abc").unwrap();
        assert_eq!(asks.pending(), 1);

        asks.set_answer("abc", Box::new("pong")).unwrap();

        assert!(first.wait().await.is_ok());
        assert!(matches!(
            second.wait().await,
            Err(AskError::InvalidAskAttempt(_))
        ));
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(AskManager::new().get_create_ask(" ").is_err());
    }
}
