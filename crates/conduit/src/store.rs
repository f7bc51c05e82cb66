//! Persistence of what a conversation turn produced.

use async_trait::async_trait;

use crate::context::ConversationContext;
use crate::tag_parser::CapturedDocument;

/// The caller's conversation storage. The loop only ever appends to it.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn save_document(
        &self,
        context: &ConversationContext,
        document: &CapturedDocument,
    ) -> anyhow::Result<()>;

    /// Assistant text produced before the turn was cancelled.
    async fn save_partial_response(
        &self,
        context: &ConversationContext,
        text: &str,
    ) -> anyhow::Result<()>;
}

pub struct NoopConversationStore;

#[async_trait]
impl ConversationStore for NoopConversationStore {
    async fn save_document(
        &self,
        _context: &ConversationContext,
        _document: &CapturedDocument,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save_partial_response(
        &self,
        _context: &ConversationContext,
        _text: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
