//! Lineage resolution: turns a message tree into the ordered transcript the
//! upstream provider sees.
//!
//! Replies, edits and regenerations are siblings in a per-thread tree, so the
//! prompt for any message is the chain of ancestors from the thread root down
//! to it, never the flat list of everything in the thread.

use std::collections::HashSet;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::{BlobStore, ChatStore};
use crate::errors::AppError;
use crate::models::{Message, MessageRole};

// ── Transcript ────────────────────────────────────────────────────────────────

/// One role-tagged entry of a transcript. Serialises as an OpenAI chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub role: MessageRole,
    pub content: EntryContent,
}

impl TranscriptEntry {
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self { role, content: EntryContent::Text(text.into()) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntryContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    File { file: FileData },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileData {
    pub filename: String,
    pub file_data: String,
}

// ── Attachments ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachmentKind {
    Image,
    File,
}

/// Supported attachment types, keyed by file extension.
fn attachment_mime(file_name: &str) -> Result<(&'static str, AttachmentKind), AppError> {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => Ok(("image/jpeg", AttachmentKind::Image)),
        "png" => Ok(("image/png", AttachmentKind::Image)),
        "pdf" => Ok(("application/pdf", AttachmentKind::File)),
        _ => Err(AppError::UnsupportedAttachment { file_name: file_name.to_string() }),
    }
}

// ── Resolver ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LineageResolver {
    store: Arc<dyn ChatStore>,
    blobs: Arc<dyn BlobStore>,
    attachment_base_path: String,
    max_depth: usize,
}

impl LineageResolver {
    pub fn new(
        store: Arc<dyn ChatStore>,
        blobs: Arc<dyn BlobStore>,
        attachment_base_path: impl Into<String>,
        max_depth: usize,
    ) -> Self {
        Self {
            store,
            blobs,
            attachment_base_path: attachment_base_path.into(),
            max_depth,
        }
    }

    /// Ancestor chain of `leaf_message_id`, root first.
    ///
    /// Fails with `MessageNotFound`/`Forbidden` when the leaf is missing or not
    /// owned by the caller, `DanglingParent` when a parent pointer leads
    /// nowhere, `LineageCycle` when a pointer revisits a message and
    /// `LineageTooDeep` when the chain outgrows the configured depth.
    pub async fn lineage(&self, owner_user_id: &str, leaf_message_id: &str) -> Result<Vec<Message>, AppError> {
        let leaf = self
            .store
            .find_message(leaf_message_id)
            .await?
            .ok_or_else(|| AppError::message_not_found(leaf_message_id))?;
        if leaf.owner_user_id != owner_user_id {
            return Err(AppError::forbidden("message", leaf_message_id));
        }

        let mut seen = HashSet::from([leaf.id.clone()]);
        let mut chain = vec![leaf];

        loop {
            let Some(current) = chain.last() else {
                break;
            };
            let Some(parent_id) = current.parent_message_id.clone() else {
                break;
            };
            if !seen.insert(parent_id.clone()) {
                warn!("Lineage of {leaf_message_id} revisits {parent_id}");
                return Err(AppError::LineageCycle {
                    leaf_id: leaf_message_id.to_string(),
                    repeated_id: parent_id,
                });
            }
            if chain.len() >= self.max_depth {
                warn!("Lineage of {leaf_message_id} exceeds {} messages", self.max_depth);
                return Err(AppError::LineageTooDeep {
                    leaf_id: leaf_message_id.to_string(),
                    max_depth: self.max_depth,
                });
            }

            let parent = self.store.find_message(&parent_id).await?.ok_or_else(|| {
                AppError::DanglingParent { message_id: current.id.clone(), parent_id: parent_id.clone() }
            })?;
            if parent.owner_user_id != owner_user_id {
                return Err(AppError::forbidden("message", parent.id));
            }
            chain.push(parent);
        }

        chain.reverse();
        Ok(chain)
    }

    /// Ordered transcript ending at `leaf_message_id`, with attachments inlined.
    pub async fn build_transcript(
        &self,
        owner_user_id: &str,
        leaf_message_id: &str,
    ) -> Result<Vec<TranscriptEntry>, AppError> {
        let lineage = self.lineage(owner_user_id, leaf_message_id).await?;

        let mut transcript = Vec::with_capacity(lineage.len());
        for message in &lineage {
            transcript.push(self.entry_for(message).await?);
        }

        debug!(
            "Built transcript of {} entries for leaf {leaf_message_id}",
            transcript.len()
        );
        Ok(transcript)
    }

    /// Prompt context for (re)generating `message_id`: the transcript up to its
    /// parent, or empty for a root. The message itself is never included.
    pub async fn context_for_regeneration(
        &self,
        owner_user_id: &str,
        message_id: &str,
    ) -> Result<Vec<TranscriptEntry>, AppError> {
        let message = self
            .store
            .find_message(message_id)
            .await?
            .ok_or_else(|| AppError::message_not_found(message_id))?;
        if message.owner_user_id != owner_user_id {
            return Err(AppError::forbidden("message", message_id));
        }

        match message.parent_message_id.as_deref() {
            Some(parent_id) => self.build_transcript(owner_user_id, parent_id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn entry_for(&self, message: &Message) -> Result<TranscriptEntry, AppError> {
        if message.role != MessageRole::User || message.attachments.is_empty() {
            return Ok(TranscriptEntry::text(message.role, message.parts.content.clone()));
        }

        if message.meta.edited && message.meta.original_message_id.as_deref().unwrap_or("").is_empty() {
            warn!(
                "Edited message {} has no original message id, reading attachments under its own id",
                message.id
            );
        }
        let owner_id = message.attachment_owner_id();

        let mut parts = Vec::with_capacity(message.attachments.len() + 1);
        parts.push(ContentPart::Text { text: message.parts.content.clone() });

        for file_name in &message.attachments {
            let (mime, kind) = attachment_mime(file_name)?;
            let bytes = self
                .blobs
                .read(&self.attachment_base_path, owner_id, file_name)
                .await?;
            let data_url = format!("data:{mime};base64,{}", BASE64.encode(&bytes));

            parts.push(match kind {
                AttachmentKind::Image => ContentPart::ImageUrl { image_url: ImageUrl { url: data_url } },
                AttachmentKind::File => ContentPart::File {
                    file: FileData { filename: file_name.clone(), file_data: data_url },
                },
            });
        }

        Ok(TranscriptEntry { role: message.role, content: EntryContent::Parts(parts) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageParts, MessageStatus};
    use crate::testing::{MemoryBlobStore, MemoryStore};

    const OWNER: &str = "user-1";

    fn message(id: &str, parent: Option<&str>, role: MessageRole, content: &str) -> Message {
        let mut m = Message::new(
            "thread-1".into(),
            parent.map(str::to_owned),
            OWNER.into(),
            role,
            MessageStatus::Completed,
            MessageParts::text(content),
        );
        m.id = id.into();
        m
    }

    fn resolver(store: &Arc<MemoryStore>, blobs: &Arc<MemoryBlobStore>) -> LineageResolver {
        LineageResolver::new(store.clone(), blobs.clone(), "messages", 100)
    }

    #[tokio::test]
    async fn edited_message_reads_attachments_from_original() {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());

        let mut m1 = message("m1", None, MessageRole::User, "look at this");
        m1.attachments = vec!["a.png".into()];
        let mut m2 = message("m2", Some("m1"), MessageRole::User, "look again");
        m2.attachments = vec!["a.png".into()];
        m2.meta.edited = true;
        m2.meta.original_message_id = Some("m1".into());
        let m3 = message("m3", Some("m2"), MessageRole::Assistant, "a cat");
        store.put_messages([m1, m2, m3]);
        blobs.put("messages", "m1", "a.png", b"\x89PNG");

        let transcript = resolver(&store, &blobs).build_transcript(OWNER, "m3").await.unwrap();

        assert_eq!(transcript.len(), 3);
        let EntryContent::Parts(parts) = &transcript[1].content else {
            panic!("edited entry should carry parts");
        };
        assert_eq!(parts[0], ContentPart::Text { text: "look again".into() });
        assert_eq!(
            parts[1],
            ContentPart::ImageUrl {
                image_url: ImageUrl { url: format!("data:image/png;base64,{}", BASE64.encode(b"\x89PNG")) }
            }
        );
        assert_eq!(transcript[2], TranscriptEntry::text(MessageRole::Assistant, "a cat"));
        assert_eq!(blobs.reads(), vec!["messages/m1/a.png".to_string(); 2]);
    }

    #[tokio::test]
    async fn pdf_attachments_are_inlined_as_files() {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let mut m1 = message("m1", None, MessageRole::User, "summarise");
        m1.attachments = vec!["report.pdf".into()];
        store.put_messages([m1]);
        blobs.put("messages", "m1", "report.pdf", b"%PDF");

        let transcript = resolver(&store, &blobs).build_transcript(OWNER, "m1").await.unwrap();
        let json = serde_json::to_value(&transcript[0]).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "file");
        assert_eq!(json["content"][1]["file"]["filename"], "report.pdf");
        assert!(json["content"][1]["file"]["file_data"]
            .as_str()
            .unwrap()
            .starts_with("data:application/pdf;base64,"));
    }

    #[tokio::test]
    async fn unsupported_attachment_aborts_transcript() {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let mut m1 = message("m1", None, MessageRole::User, "run this");
        m1.attachments = vec!["script.exe".into()];
        store.put_messages([m1]);

        let err = resolver(&store, &blobs).build_transcript(OWNER, "m1").await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedAttachment { .. }));
    }

    #[tokio::test]
    async fn missing_blob_aborts_transcript() {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let mut m1 = message("m1", None, MessageRole::User, "see");
        m1.attachments = vec!["gone.jpg".into()];
        store.put_messages([m1]);

        let err = resolver(&store, &blobs).build_transcript(OWNER, "m1").await.unwrap_err();
        assert!(matches!(err, AppError::MissingAttachment { .. }));
    }

    #[tokio::test]
    async fn cycle_is_rejected() {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        store.put_messages([
            message("a", Some("c"), MessageRole::User, "a"),
            message("b", Some("a"), MessageRole::Assistant, "b"),
            message("c", Some("b"), MessageRole::User, "c"),
        ]);

        let err = resolver(&store, &blobs).build_transcript(OWNER, "c").await.unwrap_err();
        assert!(matches!(err, AppError::LineageCycle { .. }));
    }

    #[tokio::test]
    async fn deep_acyclic_chain_hits_depth_cap() {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        store.put_messages([
            message("a", None, MessageRole::User, "a"),
            message("b", Some("a"), MessageRole::Assistant, "b"),
            message("c", Some("b"), MessageRole::User, "c"),
        ]);
        let shallow = LineageResolver::new(store.clone(), blobs.clone(), "messages", 2);

        let err = shallow.build_transcript(OWNER, "c").await.unwrap_err();
        assert!(matches!(err, AppError::LineageTooDeep { max_depth: 2, .. }));
        assert!(err.is_lineage());

        let exact = LineageResolver::new(store.clone(), blobs.clone(), "messages", 3);
        assert_eq!(exact.lineage(OWNER, "c").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn dangling_parent_is_rejected() {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        store.put_messages([message("b", Some("missing"), MessageRole::User, "b")]);

        let err = resolver(&store, &blobs).build_transcript(OWNER, "b").await.unwrap_err();
        assert!(matches!(err, AppError::DanglingParent { .. }));
        assert!(err.is_lineage());
    }

    #[tokio::test]
    async fn leaf_access_is_owner_checked() {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        store.put_messages([message("m1", None, MessageRole::User, "hi")]);
        let resolver = resolver(&store, &blobs);

        assert!(resolver.build_transcript("someone-else", "m1").await.unwrap_err().is_forbidden());
        assert!(resolver.build_transcript(OWNER, "nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn regeneration_context_excludes_the_message_itself() {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        store.put_messages([
            message("sys", None, MessageRole::System, "be brief"),
            message("m1", Some("sys"), MessageRole::User, "hello"),
            message("m2", Some("m1"), MessageRole::Assistant, "stale answer"),
        ]);
        let resolver = resolver(&store, &blobs);

        let context = resolver.context_for_regeneration(OWNER, "m2").await.unwrap();
        assert_eq!(
            context,
            vec![
                TranscriptEntry::text(MessageRole::System, "be brief"),
                TranscriptEntry::text(MessageRole::User, "hello"),
            ]
        );
        assert!(resolver.context_for_regeneration(OWNER, "sys").await.unwrap().is_empty());
    }
}
