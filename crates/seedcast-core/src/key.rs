//! Keys naming the media streams that flow through the pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Longest sanitized content id embedded in a file name.
const MAX_STEM_LEN: usize = 48;

/// Identifies one logical media stream: a content id (e.g. an info hash)
/// plus the index of the file or stream inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub content_id: String,
    pub stream_index: u32,
}

impl ResourceKey {
    pub fn new(content_id: impl Into<String>, stream_index: u32) -> Self {
        Self {
            content_id: content_id.into(),
            stream_index,
        }
    }

    /// A file-name-safe rendering of this key.
    ///
    /// Characters outside `[A-Za-z0-9_-]` are replaced, so two distinct keys
    /// may sanitize to the same text. A digest of the raw key is appended to
    /// keep the mapping collision-free.
    pub fn file_stem(&self) -> String {
        let mut stem: String = self
            .content_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .take(MAX_STEM_LEN)
            .collect();
        if stem.is_empty() {
            stem.push('_');
        }

        let mut hasher = Sha256::new();
        hasher.update(self.content_id.as_bytes());
        hasher.update([0]);
        hasher.update(self.stream_index.to_le_bytes());
        let digest = hex::encode(hasher.finalize());

        format!("{stem}-{}-{}", self.stream_index, &digest[..12])
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.content_id, self.stream_index)
    }
}

/// Which transcode pipeline is applied to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Re-encode video and audio, bounded resolution and bitrate.
    Full,
    /// Copy video untouched, re-encode audio only.
    AudioRemux,
}

impl Variant {
    /// Suffix appended to temp file stems so both variants of one key can
    /// coexist on disk.
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Variant::Full => "",
            Variant::AudioRemux => "-remux",
        }
    }

    /// Content type of the container written to the output stream.
    pub fn content_type(&self) -> &'static str {
        // Both variants emit fragmented MP4.
        "video/mp4"
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Full => write!(f, "full"),
            Variant::AudioRemux => write!(f, "audio_remux"),
        }
    }
}

impl FromStr for Variant {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Variant::Full),
            "audio" | "audio_remux" | "remux" => Ok(Variant::AudioRemux),
            other => Err(crate::Error::Validation(format!(
                "unknown pipeline variant '{other}' (expected full or audio)"
            ))),
        }
    }
}

/// Registry key: a resource key together with the pipeline variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineKey {
    pub resource: ResourceKey,
    pub variant: Variant,
}

impl PipelineKey {
    pub fn new(resource: ResourceKey, variant: Variant) -> Self {
        Self { resource, variant }
    }

    /// File stem for this key's temp file, including the variant suffix.
    pub fn file_stem(&self) -> String {
        format!("{}{}", self.resource.file_stem(), self.variant.file_suffix())
    }
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.variant)
    }
}
