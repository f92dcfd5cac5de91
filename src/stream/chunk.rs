use serde::{Serialize, Serializer};

/// What a chunk carries. The numeric codes are part of the delivery wire
/// format (`{"t": <code>, "c": <string>}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    UnknownTool,
    Content,
    Reasoning,
    Error,
    FinishReason,
}

impl ChunkKind {
    pub fn code(&self) -> u8 {
        match self {
            ChunkKind::UnknownTool => 0,
            ChunkKind::Content => 1,
            ChunkKind::Reasoning => 2,
            ChunkKind::Error => 3,
            ChunkKind::FinishReason => 4,
        }
    }
}

impl Serialize for ChunkKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// One broadcastable unit of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    #[serde(rename = "t")]
    pub kind: ChunkKind,
    #[serde(rename = "c")]
    pub content: String,
}

impl Chunk {
    pub fn new(kind: ChunkKind, content: impl Into<String>) -> Self {
        Self { kind, content: content.into() }
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self::new(ChunkKind::Content, text)
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::new(ChunkKind::Reasoning, text)
    }
}
