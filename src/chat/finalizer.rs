use super::models::FinalizeOutcome;
use super::store::ChatStateGateway;
use crate::future_jobs::{Job, JobHandler};
use crate::user::UserId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Action type of the idle-timeout job armed for every chat session.
pub const CHAT_JOB_TYPE: &str = "chat";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeParams {
    pub user_id: UserId,
    pub conversation_id: String,
}

/// Marks a chat session finished once its idle timer fires.
pub struct SessionFinalizer {
    store: Arc<dyn ChatStateGateway>,
}

impl SessionFinalizer {
    pub fn new(store: Arc<dyn ChatStateGateway>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for SessionFinalizer {
    async fn handle(&self, job: &Job) -> Result<()> {
        let params: FinalizeParams = job
            .params()
            .with_context(|| format!("Invalid params for job {}", job.id))?;

        let outcome = self
            .store
            .finalize_if_active(params.user_id, &params.conversation_id)
            .with_context(|| format!("Failed to finalize chat {}", params.conversation_id))?;

        match outcome {
            FinalizeOutcome::Finalized => {
                info!("Chat {} finished after idling", params.conversation_id)
            }
            FinalizeOutcome::AlreadyFinished | FinalizeOutcome::AlreadyArchived => debug!(
                "Chat {} was already {:?}",
                params.conversation_id, outcome
            ),
        }
        Ok(())
    }
}
