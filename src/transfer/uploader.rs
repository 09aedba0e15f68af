use log::debug;
use std::net::SocketAddr;
use tokio::time::Instant;

use crate::core::node::NodeContext;
use crate::core::protocol::{Body, FileId, PeerId, Role};
use crate::utils::Result;

/// Answers chunk requests from the local chunk store.
#[derive(Clone)]
pub struct Uploader {
    ctx: NodeContext,
}

impl Uploader {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx }
    }

    /// Sources always serve; consumers only when redistribution is on.
    pub fn serves(&self) -> bool {
        self.ctx.identity.role == Role::Source || self.ctx.config.redistribute
    }

    /// Reply with the stored encrypted chunk. A chunk we do not hold is not
    /// an error: broadcast requests reach every peer and only holders answer.
    pub async fn handle_chunk_request(
        &self,
        peer_id: PeerId,
        reply_to: SocketAddr,
        file_id: FileId,
        chunk_index: u32,
    ) -> Result<bool> {
        if !self.serves() {
            return Ok(false);
        }

        let record = self.ctx.store.read().await.get(&file_id, chunk_index).cloned();
        let Some(record) = record else {
            debug!(
                "Not holding {}#{} requested by {}",
                file_id,
                chunk_index,
                peer_id.short()
            );
            return Ok(false);
        };

        let payload = record.chunk.into_payload(file_id.clone(), chunk_index);
        self.ctx
            .messenger
            .send_to(reply_to, Body::ChunkResponse(payload))
            .await?;
        self.ctx.metrics.record_chunk_uploaded().await;

        // Consumers redistributing a file they are still fetching stay in
        // their own session state.
        if let Err(e) = self
            .ctx
            .sessions
            .write()
            .await
            .mark_served(&file_id, Instant::now())
        {
            debug!("No session to credit for {}: {}", file_id, e);
        }

        debug!("Sent chunk {}#{} to peer {}", file_id, chunk_index, peer_id.short());
        Ok(true)
    }
}
