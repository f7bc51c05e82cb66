use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifies who a conversation turn runs for. Passed explicitly to every
/// collaborator call; nothing about the request lives in process-wide state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub conversation_id: Option<String>,
}

impl ConversationContext {
    pub fn new<U, P, C>(user_id: U, project_id: P, conversation_id: C) -> Self
    where
        U: Into<String>,
        P: Into<String>,
        C: Into<String>,
    {
        Self {
            user_id: Some(user_id.into()),
            project_id: Some(project_id.into()),
            conversation_id: Some(conversation_id.into()),
        }
    }
}

/// Cooperative cancellation shared between the consumer of a reply stream and
/// the loop producing it. Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
