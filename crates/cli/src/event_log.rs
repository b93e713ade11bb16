//! `event-log` hook: appends every relay event to a JSONL file.

use std::{io::Write, path::PathBuf, sync::Mutex};

use {anyhow::Result, async_trait::async_trait};

use guildrelay_common::hooks::{HookEvent, HookHandler, HookPayload};

pub struct EventLogHook {
    log_path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl EventLogHook {
    pub fn new(log_path: PathBuf) -> Self {
        Self {
            log_path,
            file: Mutex::new(None),
        }
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            if let Some(parent) = self.log_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)?;
            *guard = Some(file);
        }
        if let Some(ref mut f) = *guard {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[async_trait]
impl HookHandler for EventLogHook {
    fn name(&self) -> &str {
        "event-log"
    }

    fn events(&self) -> &[HookEvent] {
        HookEvent::ALL
    }

    async fn handle(&self, payload: &HookPayload) -> Result<()> {
        let mut entry = serde_json::to_value(payload)?;
        if let Some(obj) = entry.as_object_mut() {
            obj.insert(
                "ts".into(),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
                    .into(),
            );
        }
        self.append(&entry.to_string())
    }
}
