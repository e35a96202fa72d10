use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    auth::Caller,
    chat::{MessageRecord, NewMessage, ThreadMessages, ThreadSummary},
    error::{AppError, AppResult},
    store::Store,
};

/// Direct messaging between marketplace clients and providers.
#[derive(Clone, Debug)]
pub struct Messenger {
    store: Store,
    max_content_chars: usize,
}

impl Messenger {
    pub fn new(store: Store, max_content_chars: usize) -> Self {
        Self {
            store,
            max_content_chars,
        }
    }

    /// Validate and persist a message from `caller`.
    ///
    /// Without an idempotency key every call appends a new message, so a
    /// client retry produces a duplicate.
    pub async fn create_message(
        &self,
        caller: Caller,
        body: NewMessage,
        idempotency_key: Option<String>,
    ) -> AppResult<MessageRecord> {
        let outgoing = body.validate(caller.user_id, self.max_content_chars)?;

        if !self.store.user_exists(outgoing.receiver_id).await? {
            return Err(AppError::not_found(format!(
                "receiver {} does not exist",
                outgoing.receiver_id
            )));
        }

        let record = self
            .store
            .create_message(&outgoing, idempotency_key.as_deref())
            .await?;

        if record.receiver_id != outgoing.receiver_id || record.content != outgoing.content {
            return Err(AppError::conflict(
                "Idempotency-Key was already used for a different message",
            ));
        }

        info!(
            message_id = %record.id,
            sender_id = %record.sender_id,
            receiver_id = %record.receiver_id,
            "message stored"
        );

        Ok(record)
    }

    pub async fn list_threads(&self, caller: Caller) -> AppResult<Vec<ThreadSummary>> {
        let threads = self.store.list_threads(caller.user_id).await?;
        debug!(user_id = %caller.user_id, count = threads.len(), "listed threads");
        Ok(threads)
    }

    pub async fn list_thread_messages(
        &self,
        caller: Caller,
        other_user_id: Uuid,
        limit: Option<u32>,
    ) -> AppResult<ThreadMessages> {
        if other_user_id == caller.user_id {
            return Err(AppError::validation("otherUserId must differ from the caller"));
        }

        let (messages, total) = self
            .store
            .conversation(caller.user_id, other_user_id, limit)
            .await?;

        Ok(ThreadMessages { messages, total })
    }
}
