//! # Event State
//!
//! Events are created, activated and closed by the admin side. The vote pipeline only
//! asks two questions before touching any lock: is the event live, and are votes still
//! accepted.
use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;

use crate::store::StoreError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventStatus {
    pub is_active: bool,
    pub votes_closed: bool,
}

#[async_trait]
pub trait EventState: Send + Sync {
    async fn is_active(&self, event_id: i64) -> Result<bool, StoreError>;

    async fn is_voting_open(&self, event_id: i64) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct MemoryEventState {
    events: RwLock<HashMap<i64, EventStatus>>,
}

impl MemoryEventState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, event_id: i64, status: EventStatus) -> Result<(), StoreError> {
        self.events
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(event_id, status);
        Ok(())
    }

    fn status(&self, event_id: i64) -> Result<EventStatus, StoreError> {
        Ok(self
            .events
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(&event_id)
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventState for MemoryEventState {
    async fn is_active(&self, event_id: i64) -> Result<bool, StoreError> {
        Ok(self.status(event_id)?.is_active)
    }

    async fn is_voting_open(&self, event_id: i64) -> Result<bool, StoreError> {
        let status = self.status(event_id)?;
        Ok(status.is_active && !status.votes_closed)
    }
}
