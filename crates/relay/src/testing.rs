//! Scripted platform double shared by the relay's unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    formatter::FormattedMessage,
    platform::{
        ChannelInfo, ChannelKind, Endpoint, PlatformClient, PlatformError, PlatformResult, Route,
        SentMessage,
    },
};

/// Scripted outcome for the next call of a kind. Unscripted calls succeed.
#[derive(Debug, Clone)]
pub enum Step {
    Fail(PlatformError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub route: Route,
    pub message: FormattedMessage,
}

#[derive(Default)]
struct MockState {
    channels: HashMap<String, ChannelInfo>,
    create_script: VecDeque<Step>,
    send_script: VecDeque<Step>,
    edit_script: VecDeque<Step>,
    delete_script: VecDeque<Step>,
    endpoints_created: usize,
    send_attempts: usize,
    sent: Vec<SentRecord>,
    edits: Vec<(String, FormattedMessage)>,
    deletes: Vec<String>,
    next_id: u64,
    delay: Option<Duration>,
    active: usize,
    max_active: usize,
}

#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_channel(&self, info: ChannelInfo) {
        self.lock().channels.insert(info.id.clone(), info);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    pub fn push_create_endpoint(&self, step: Step) {
        self.lock().create_script.push_back(step);
    }

    pub fn push_send(&self, step: Step) {
        self.lock().send_script.push_back(step);
    }

    pub fn push_edit(&self, step: Step) {
        self.lock().edit_script.push_back(step);
    }

    pub fn push_delete(&self, step: Step) {
        self.lock().delete_script.push_back(step);
    }

    pub fn endpoints_created(&self) -> usize {
        self.lock().endpoints_created
    }

    pub fn send_attempts(&self) -> usize {
        self.lock().send_attempts
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.lock().sent.clone()
    }

    pub fn edits(&self) -> Vec<(String, FormattedMessage)> {
        self.lock().edits.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.lock().deletes.clone()
    }

    pub fn max_concurrent_sends(&self) -> usize {
        self.lock().max_active
    }

    async fn send(&self, route: Route, message: &FormattedMessage) -> PlatformResult<SentMessage> {
        let delay = {
            let mut state = self.lock();
            state.send_attempts += 1;
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.active -= 1;
        if let Some(Step::Fail(e)) = state.send_script.pop_front() {
            return Err(e);
        }
        state.next_id += 1;
        let remote_id = format!("r{}", state.next_id);
        state.sent.push(SentRecord {
            route,
            message: message.clone(),
        });
        Ok(SentMessage { remote_id })
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn resolve_channel(&self, channel_id: &str) -> PlatformResult<ChannelInfo> {
        Ok(self
            .lock()
            .channels
            .get(channel_id)
            .cloned()
            .unwrap_or_else(|| ChannelInfo {
                id: channel_id.to_string(),
                guild_id: Some("g1".into()),
                kind: ChannelKind::Text,
            }))
    }

    async fn create_endpoint(&self, channel_id: &str) -> PlatformResult<String> {
        let mut state = self.lock();
        if let Some(Step::Fail(e)) = state.create_script.pop_front() {
            return Err(e);
        }
        state.endpoints_created += 1;
        Ok(format!(
            "https://hooks.test/{channel_id}/{}",
            state.endpoints_created
        ))
    }

    async fn send_via_endpoint(
        &self,
        endpoint: &Endpoint,
        message: &FormattedMessage,
    ) -> PlatformResult<SentMessage> {
        self.send(Route::Endpoint(endpoint.clone()), message).await
    }

    async fn send_direct(
        &self,
        channel_id: &str,
        message: &FormattedMessage,
    ) -> PlatformResult<SentMessage> {
        self.send(
            Route::Direct {
                channel_id: channel_id.to_string(),
            },
            message,
        )
        .await
    }

    async fn edit_message(
        &self,
        _route: &Route,
        remote_id: &str,
        message: &FormattedMessage,
    ) -> PlatformResult<SentMessage> {
        let mut state = self.lock();
        if let Some(Step::Fail(e)) = state.edit_script.pop_front() {
            return Err(e);
        }
        state.edits.push((remote_id.to_string(), message.clone()));
        Ok(SentMessage {
            remote_id: remote_id.to_string(),
        })
    }

    async fn delete_message(&self, _route: &Route, remote_id: &str) -> PlatformResult<()> {
        let mut state = self.lock();
        if let Some(Step::Fail(e)) = state.delete_script.pop_front() {
            return Err(e);
        }
        state.deletes.push(remote_id.to_string());
        Ok(())
    }
}
