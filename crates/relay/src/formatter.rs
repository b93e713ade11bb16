//! Platform-native rendering of outgoing messages.
//!
//! A message becomes a plain-text preview plus a run of rich blocks carrying
//! the full content. The correlation token rides in the last block's footer
//! behind a fixed marker so the mirror feed can recognize the echo.

use {
    guildrelay_config::FormatterConfig,
    guildrelay_protocol::AttachmentRef,
    uuid::Uuid,
};

use crate::types::LogicalMessage;

/// Accent for channels that require a role to read.
pub const RESTRICTED_COLOR: u32 = 0x00E6_7E22;
pub const DEFAULT_COLOR: u32 = 0x0058_65F2;

/// Longest display name the platform accepts for an endpoint post.
pub const MAX_USERNAME_CHARS: usize = 80;

const ELLIPSIS: char = '…';

/// One rich block (an embed on Discord-style platforms).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RichBlock {
    pub description: String,
    pub color: u32,
    pub footer: Option<String>,
}

/// A file the platform should fetch and attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDescriptor {
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
}

impl From<&AttachmentRef> for UploadDescriptor {
    fn from(a: &AttachmentRef) -> Self {
        Self {
            filename: a.filename.clone(),
            url: a.url.clone(),
            content_type: a.content_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedMessage {
    pub username: String,
    pub primary_text: String,
    pub blocks: Vec<RichBlock>,
    pub uploads: Vec<UploadDescriptor>,
    pub correlation_token: String,
}

impl FormattedMessage {
    /// Characters counted against the platform's aggregate cap.
    pub fn aggregate_chars(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| {
                b.description.chars().count()
                    + b.footer.as_deref().map_or(0, |f| f.chars().count())
            })
            .sum()
    }
}

/// Mint a fresh correlation token.
pub fn mint_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Pull a correlation token out of `text`, if `marker` appears in it.
pub fn parse_token<'a>(marker: &str, text: &'a str) -> Option<&'a str> {
    let start = text.find(marker)? + marker.len();
    let rest = text[start..].trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

#[derive(Debug, Clone)]
pub struct Formatter {
    config: FormatterConfig,
}

impl Formatter {
    pub fn new(config: FormatterConfig) -> Self {
        Self { config }
    }

    /// Render `message`, reusing its correlation token or minting one.
    pub fn format(&self, message: &LogicalMessage) -> FormattedMessage {
        let token = message
            .correlation_token
            .clone()
            .unwrap_or_else(mint_token);
        let footer = format!("{}{}", self.config.token_marker, token);
        let budget = self
            .config
            .aggregate_cap
            .saturating_sub(footer.chars().count());
        let color = if message.is_restricted {
            RESTRICTED_COLOR
        } else {
            DEFAULT_COLOR
        };

        let mut blocks: Vec<RichBlock> = self
            .split_blocks(&message.content, budget)
            .into_iter()
            .map(|description| RichBlock {
                description,
                color,
                footer: None,
            })
            .collect();
        match blocks.last_mut() {
            Some(last) => last.footer = Some(footer),
            None => blocks.push(RichBlock {
                description: String::new(),
                color,
                footer: Some(footer),
            }),
        }

        FormattedMessage {
            username: self.username(message),
            primary_text: message.content.chars().take(self.config.text_cap).collect(),
            blocks,
            uploads: message.attachments.iter().map(Into::into).collect(),
            correlation_token: token,
        }
    }

    fn username(&self, message: &LogicalMessage) -> String {
        let name = message.author.display_name.trim();
        let name = if name.is_empty() {
            message.author.id.as_str()
        } else {
            name
        };
        name.chars().take(MAX_USERNAME_CHARS).collect()
    }

    /// Split `content` into blocks of at most `block_cap` characters, stopping
    /// at `max_blocks` or once `budget` characters are used. Content that does
    /// not fit ends the last block with an ellipsis.
    fn split_blocks(&self, content: &str, budget: usize) -> Vec<String> {
        let mut blocks = Vec::new();
        let mut remaining = content;
        let mut used = 0;

        while !remaining.is_empty() && blocks.len() < self.config.max_blocks && used < budget {
            let room = self.config.block_cap.min(budget - used);
            let window_end = byte_offset(remaining, room);
            if window_end == remaining.len() {
                blocks.push(remaining.to_string());
                remaining = "";
                break;
            }

            // Prefer a line break, then a word break.
            let window = &remaining[..window_end];
            let split_at = window
                .rfind('\n')
                .or_else(|| window.rfind(' '))
                .filter(|&i| i > 0)
                .unwrap_or(window_end);

            let block = &remaining[..split_at];
            used += block.chars().count();
            blocks.push(block.to_string());

            let rest = &remaining[split_at..];
            remaining = rest
                .strip_prefix('\n')
                .or_else(|| rest.strip_prefix(' '))
                .unwrap_or(rest);
        }

        if !remaining.is_empty()
            && let Some(last) = blocks.last_mut()
        {
            last.pop();
            last.push(ELLIPSIS);
        }
        blocks
    }
}

/// Byte offset just past the first `chars` characters of `s`.
fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}
