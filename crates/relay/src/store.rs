//! Persistence the relay relies on, plus an in-memory implementation.

use std::{collections::HashMap, sync::Mutex};

use {anyhow::Result, async_trait::async_trait};

use crate::types::{DeliveryMapping, LogicalMessage};

/// Persistence for delivery mappings, provisioned endpoints and messages.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert or replace the mapping for `(guild, channel, token)`.
    async fn upsert_delivery_mapping(&self, mapping: &DeliveryMapping) -> Result<()>;

    async fn mapping_by_token(
        &self,
        guild_id: &str,
        channel_id: &str,
        token: &str,
    ) -> Result<Option<DeliveryMapping>>;

    async fn mapping_by_local_id(
        &self,
        channel_id: &str,
        local_message_id: &str,
    ) -> Result<Option<DeliveryMapping>>;

    async fn mapping_by_remote_id(
        &self,
        remote_message_id: &str,
    ) -> Result<Option<DeliveryMapping>>;

    async fn delete_delivery_mapping(
        &self,
        channel_id: &str,
        local_message_id: &str,
    ) -> Result<bool>;

    async fn load_endpoint(&self, channel_id: &str) -> Result<Option<String>>;

    async fn save_endpoint(&self, channel_id: &str, url: &str) -> Result<()>;

    async fn clear_endpoint(&self, channel_id: &str) -> Result<()>;

    async fn save_message(&self, message: &LogicalMessage) -> Result<()>;

    async fn load_message(
        &self,
        channel_id: &str,
        local_id: &str,
    ) -> Result<Option<LogicalMessage>>;

    async fn delete_message(&self, channel_id: &str, local_id: &str) -> Result<bool>;
}

#[derive(Default)]
struct MemoryState {
    mappings: Vec<DeliveryMapping>,
    endpoints: HashMap<String, String>,
    messages: HashMap<(String, String), LogicalMessage>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryDeliveryStore {
    state: Mutex<MemoryState>,
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mapping_count(&self) -> usize {
        self.lock().mappings.len()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DeliveryStore for MemoryDeliveryStore {
    async fn upsert_delivery_mapping(&self, mapping: &DeliveryMapping) -> Result<()> {
        let mut state = self.lock();
        state.mappings.retain(|m| {
            !(m.guild_id == mapping.guild_id
                && m.channel_id == mapping.channel_id
                && m.correlation_token == mapping.correlation_token)
                && m.remote_message_id != mapping.remote_message_id
        });
        state.mappings.push(mapping.clone());
        Ok(())
    }

    async fn mapping_by_token(
        &self,
        guild_id: &str,
        channel_id: &str,
        token: &str,
    ) -> Result<Option<DeliveryMapping>> {
        Ok(self
            .lock()
            .mappings
            .iter()
            .find(|m| {
                m.guild_id == guild_id && m.channel_id == channel_id && m.correlation_token == token
            })
            .cloned())
    }

    async fn mapping_by_local_id(
        &self,
        channel_id: &str,
        local_message_id: &str,
    ) -> Result<Option<DeliveryMapping>> {
        Ok(self
            .lock()
            .mappings
            .iter()
            .find(|m| m.channel_id == channel_id && m.local_message_id == local_message_id)
            .cloned())
    }

    async fn mapping_by_remote_id(
        &self,
        remote_message_id: &str,
    ) -> Result<Option<DeliveryMapping>> {
        Ok(self
            .lock()
            .mappings
            .iter()
            .find(|m| m.remote_message_id == remote_message_id)
            .cloned())
    }

    async fn delete_delivery_mapping(
        &self,
        channel_id: &str,
        local_message_id: &str,
    ) -> Result<bool> {
        let mut state = self.lock();
        let before = state.mappings.len();
        state
            .mappings
            .retain(|m| !(m.channel_id == channel_id && m.local_message_id == local_message_id));
        Ok(state.mappings.len() != before)
    }

    async fn load_endpoint(&self, channel_id: &str) -> Result<Option<String>> {
        Ok(self.lock().endpoints.get(channel_id).cloned())
    }

    async fn save_endpoint(&self, channel_id: &str, url: &str) -> Result<()> {
        self.lock()
            .endpoints
            .insert(channel_id.to_string(), url.to_string());
        Ok(())
    }

    async fn clear_endpoint(&self, channel_id: &str) -> Result<()> {
        self.lock().endpoints.remove(channel_id);
        Ok(())
    }

    async fn save_message(&self, message: &LogicalMessage) -> Result<()> {
        self.lock().messages.insert(
            (message.channel_id.clone(), message.local_id.clone()),
            message.clone(),
        );
        Ok(())
    }

    async fn load_message(
        &self,
        channel_id: &str,
        local_id: &str,
    ) -> Result<Option<LogicalMessage>> {
        Ok(self
            .lock()
            .messages
            .get(&(channel_id.to_string(), local_id.to_string()))
            .cloned())
    }

    async fn delete_message(&self, channel_id: &str, local_id: &str) -> Result<bool> {
        Ok(self
            .lock()
            .messages
            .remove(&(channel_id.to_string(), local_id.to_string()))
            .is_some())
    }
}
