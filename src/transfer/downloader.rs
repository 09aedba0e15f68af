use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::events::NodeEvent;
use crate::core::node::NodeContext;
use crate::core::protocol::{Advertisement, Body, ChunkPayload, FileId, PeerId, Role};
use crate::storage::{ChunkRecord, EncryptedChunk, FileDescriptor, FileSink, HashUtils};
use crate::transfer::scheduler::{ChunkScheduler, DownloadState, RequestTarget};
use crate::transfer::session::SessionState;
use crate::utils::{Result, ShareError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub file_id: FileId,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub in_flight: usize,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
}

struct ActiveDownload {
    state: DownloadState,
    total_bytes: u64,
    cancel: CancellationToken,
}

enum RequestStep {
    Sent,
    /// Every missing chunk is already in flight.
    Waiting,
    /// Nothing left to request, or the download is gone.
    Done,
}

enum CompletionStep {
    Complete(DownloadState),
    Expired(DownloadState),
    Announce(Vec<u32>),
    Pending,
}

/// Consumer side of the distribution: one request loop and one completion
/// loop per active download.
#[derive(Clone)]
pub struct Downloader {
    ctx: NodeContext,
    sink: Arc<dyn FileSink>,
    active_downloads: Arc<Mutex<HashMap<FileId, ActiveDownload>>>,
}

impl Downloader {
    pub fn new(ctx: NodeContext, sink: Arc<dyn FileSink>) -> Self {
        Self {
            ctx,
            sink,
            active_downloads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handle an advertisement from the trusted source.
    pub async fn on_advertise(&self, ad: Advertisement) -> Result<()> {
        let registered = self
            .ctx
            .store
            .write()
            .await
            .register(FileDescriptor::from_advertisement(&ad));
        if !registered {
            return Ok(());
        }

        info!(
            "File available: {} ({} bytes, {} chunks) as {}",
            ad.name, ad.size, ad.total_chunks, ad.file_id
        );
        self.ctx
            .sessions
            .write()
            .await
            .announce(&ad.file_id, Role::Consumer, Instant::now());
        self.ctx.events.emit(NodeEvent::FileAvailable {
            file_id: ad.file_id.clone(),
            name: ad.name.clone(),
            size: ad.size,
        });

        if self.ctx.config.auto_download {
            self.start(&ad.file_id).await?;
        }
        Ok(())
    }

    /// Begin fetching an advertised file. Starting a download that is
    /// already running or already complete does nothing.
    pub async fn start(&self, file_id: &FileId) -> Result<()> {
        if self.ctx.sessions.read().await.state(file_id) == Some(SessionState::Complete) {
            debug!("{} was already downloaded", file_id);
            return Ok(());
        }

        let (total_chunks, total_bytes, held) = {
            let store = self.ctx.store.read().await;
            let descriptor = store
                .descriptor(file_id)
                .ok_or_else(|| ShareError::FileNotFound(file_id.to_string()))?;
            if descriptor.is_complete() && descriptor.total_chunks > 0 {
                debug!("{} is already complete", file_id);
                return Ok(());
            }
            (
                descriptor.total_chunks,
                descriptor.size,
                store.held_indices(file_id),
            )
        };

        let now = Instant::now();
        {
            let mut sessions = self.ctx.sessions.write().await;
            sessions.announce(file_id, Role::Consumer, now);
            sessions.transition(file_id, SessionState::Distributing, now)?;
        }

        let cancel = {
            let mut downloads = self.active_downloads.lock().await;
            if downloads.contains_key(file_id) {
                return Ok(());
            }

            let mut state = DownloadState::new(
                file_id.clone(),
                total_chunks,
                self.ctx.config.download_timeout(),
                now,
            );
            state.received.extend(held);
            let cancel = self.ctx.cancel.child_token();
            downloads.insert(
                file_id.clone(),
                ActiveDownload {
                    state,
                    total_bytes,
                    cancel: cancel.clone(),
                },
            );
            cancel
        };

        info!("Starting download: {} ({} chunks)", file_id, total_chunks);
        self.spawn_request_loop(file_id.clone(), cancel.clone());
        self.spawn_completion_loop(file_id.clone(), cancel);
        Ok(())
    }

    /// Stop a download. Its timers are cancelled under the same lock that
    /// removes its state.
    pub async fn cancel(&self, file_id: &FileId) -> bool {
        let mut downloads = self.active_downloads.lock().await;
        match downloads.remove(file_id) {
            Some(active) => {
                active.cancel.cancel();
                info!("Download cancelled: {}", file_id);
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let mut downloads = self.active_downloads.lock().await;
        for (_, active) in downloads.drain() {
            active.cancel.cancel();
        }
    }

    pub async fn get_download_progress(&self, file_id: &FileId) -> Option<DownloadProgress> {
        let downloads = self.active_downloads.lock().await;
        downloads.get(file_id).map(Self::progress)
    }

    pub async fn active_downloads(&self) -> Vec<DownloadProgress> {
        let downloads = self.active_downloads.lock().await;
        downloads.values().map(Self::progress).collect()
    }

    fn progress(active: &ActiveDownload) -> DownloadProgress {
        DownloadProgress {
            file_id: active.state.file_id.clone(),
            total_chunks: active.state.total_chunks,
            completed_chunks: active.state.received.len() as u32,
            in_flight: active.state.in_flight.len(),
            bytes_downloaded: active.state.bytes_received,
            total_bytes: active.total_bytes,
        }
    }

    /// Validate and store a chunk response. Responses for unknown downloads
    /// and already received chunks are ignored.
    pub async fn accept_chunk(&self, from: PeerId, payload: ChunkPayload) -> Result<()> {
        let file_id = payload.file_id.clone();
        let index = payload.chunk_index;

        {
            let downloads = self.active_downloads.lock().await;
            match downloads.get(&file_id) {
                None => {
                    debug!("Unsolicited chunk {}#{} from {}", file_id, index, from.short());
                    return Ok(());
                }
                Some(active) if active.state.received.contains(&index) => {
                    debug!("Duplicate chunk {}#{} from {}", file_id, index, from.short());
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let cipher = self
            .ctx
            .trust
            .read()
            .await
            .cipher()
            .cloned()
            .ok_or_else(|| ShareError::CryptoError("no session key yet".into()))?;

        let chunk = EncryptedChunk::from_payload(&payload);
        let plaintext = match cipher.decrypt(&file_id, index, &chunk) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("Rejecting chunk from {}: {}", from.short(), e);
                self.ctx.metrics.record_integrity_failure().await;
                self.ctx.directory.write().await.record_outcome(&from, false);
                if let Some(active) = self.active_downloads.lock().await.get_mut(&file_id) {
                    active.state.mark_failed(index, from);
                }
                return Ok(());
            }
        };

        let record = ChunkRecord {
            file_id: file_id.clone(),
            index,
            chunk,
            content_hash: HashUtils::hash_data(&plaintext),
        };
        match self.ctx.store.write().await.put(record) {
            Ok(_) => {}
            // The download ended between the duplicate check and here.
            Err(ShareError::FileNotFound(_)) => {
                debug!("Dropping chunk {}#{}: download already ended", file_id, index);
                return Ok(());
            }
            Err(e) => {
                self.ctx.directory.write().await.record_outcome(&from, false);
                return Err(e);
            }
        }

        let (received, total) = {
            let mut downloads = self.active_downloads.lock().await;
            let Some(active) = downloads.get_mut(&file_id) else {
                return Ok(());
            };
            if !active.state.mark_received(index, plaintext.len()) {
                return Ok(());
            }
            (active.state.received.len() as u32, active.state.total_chunks)
        };

        {
            let mut directory = self.ctx.directory.write().await;
            directory.record_outcome(&from, true);
            directory.record_holds(from, &file_id, &[index]);
        }
        self.ctx.metrics.record_chunk_downloaded().await;
        debug!(
            "Chunk {}#{} from {} ({}/{})",
            file_id,
            index,
            from.short(),
            received,
            total
        );
        self.ctx.events.emit(NodeEvent::DownloadProgress {
            file_id,
            received,
            total,
        });
        Ok(())
    }

    fn spawn_request_loop(&self, file_id: FileId, cancel: CancellationToken) {
        let downloader = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(downloader.ctx.config.request_tick());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match downloader.request_next(&file_id).await {
                            Ok(RequestStep::Sent) | Ok(RequestStep::Waiting) => {}
                            Ok(RequestStep::Done) => break,
                            Err(e) if e.is_terminal() => {
                                debug!("Request loop for {} ends: {}", file_id, e);
                                break;
                            }
                            Err(e) => warn!("Chunk request for {} failed: {}", file_id, e),
                        }
                    }
                }
            }
            debug!("Request loop for {} stopped", file_id);
        });
    }

    fn spawn_completion_loop(&self, file_id: FileId, cancel: CancellationToken) {
        let downloader = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(downloader.ctx.config.completion_tick());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if downloader.check_completion(&file_id).await {
                            break;
                        }
                    }
                }
            }
            debug!("Completion loop for {} stopped", file_id);
        });
    }

    /// One request tick: expire stale requests, pick the next chunk and a
    /// source for it, and send the request.
    async fn request_next(&self, file_id: &FileId) -> Result<RequestStep> {
        let now = Instant::now();
        let (excluded, expired, tried) = {
            let mut downloads = self.active_downloads.lock().await;
            let Some(active) = downloads.get_mut(file_id) else {
                return Ok(RequestStep::Done);
            };
            if active.state.is_complete() {
                return Ok(RequestStep::Done);
            }
            let expired = active
                .state
                .expire_requests(now, self.ctx.config.request_timeout());
            let mut excluded = active.state.received.clone();
            excluded.extend(active.state.in_flight.keys().copied());
            (excluded, expired, active.state.tried.clone())
        };

        if !expired.is_empty() {
            let mut directory = self.ctx.directory.write().await;
            for peer_id in &expired {
                debug!("Request to {} timed out", peer_id.short());
                directory.record_outcome(peer_id, false);
            }
        }

        let index = {
            let mut store = self.ctx.store.write().await;
            let descriptor = store
                .descriptor_mut(file_id)
                .ok_or_else(|| ShareError::FileNotFound(file_id.to_string()))?;
            match ChunkScheduler::next_chunk(descriptor, &excluded) {
                Some(index) => {
                    ChunkScheduler::deprioritize(descriptor, index);
                    index
                }
                None => return Ok(RequestStep::Waiting),
            }
        };

        let target = {
            let directory = self.ctx.directory.read().await;
            let avoid = tried.get(&index).cloned().unwrap_or_default();
            ChunkScheduler::pick_source(&directory, file_id, index, &avoid)
        };
        let addressed = match target {
            RequestTarget::Peer { peer_id, .. } => Some(peer_id),
            RequestTarget::Broadcast => None,
        };

        {
            let mut downloads = self.active_downloads.lock().await;
            let Some(active) = downloads.get_mut(file_id) else {
                return Ok(RequestStep::Done);
            };
            active.state.mark_requested(index, addressed, now);
        }

        let body = Body::ChunkRequest {
            file_id: file_id.clone(),
            chunk_index: index,
        };
        match target {
            RequestTarget::Peer { peer_id, address } => {
                debug!("Requesting {}#{} from {}", file_id, index, peer_id.short());
                self.ctx.messenger.send_to(address, body).await?;
            }
            RequestTarget::Broadcast => {
                debug!("Requesting {}#{} from everyone", file_id, index);
                self.ctx.messenger.broadcast(body).await?;
            }
        }
        Ok(RequestStep::Sent)
    }

    /// One completion tick. Returns `true` once the download is finished
    /// either way and the loop should stop.
    async fn check_completion(&self, file_id: &FileId) -> bool {
        let now = Instant::now();
        let step = {
            let mut downloads = self.active_downloads.lock().await;
            let Some(active) = downloads.get_mut(file_id) else {
                return true;
            };

            if active.state.is_complete() || now >= active.state.deadline {
                let complete = active.state.is_complete();
                match downloads.remove(file_id) {
                    Some(active) => {
                        active.cancel.cancel();
                        if complete {
                            CompletionStep::Complete(active.state)
                        } else {
                            CompletionStep::Expired(active.state)
                        }
                    }
                    None => return true,
                }
            } else if self.ctx.config.redistribute
                && active.state.received.len() > active.state.announced
            {
                active.state.announced = active.state.received.len();
                CompletionStep::Announce(active.state.received.iter().copied().collect())
            } else {
                CompletionStep::Pending
            }
        };

        match step {
            CompletionStep::Complete(state) => {
                if let Err(e) = self.finish(file_id, &state).await {
                    error!("Download of {} could not be finished: {}", file_id, e);
                    self.fail(file_id, e.to_string()).await;
                }
                true
            }
            CompletionStep::Expired(state) => {
                let reason = ShareError::DownloadTimeout(format!(
                    "{} after {:?} with {}/{} chunks",
                    file_id,
                    now.duration_since(state.started_at),
                    state.received.len(),
                    state.total_chunks
                ));
                warn!("{}", reason);
                self.fail(file_id, reason.to_string()).await;
                true
            }
            CompletionStep::Announce(chunks) => {
                self.announce_chunks(file_id, chunks).await;
                false
            }
            CompletionStep::Pending => false,
        }
    }

    async fn finish(&self, file_id: &FileId, state: &DownloadState) -> Result<()> {
        let cipher = self
            .ctx
            .trust
            .read()
            .await
            .cipher()
            .cloned()
            .ok_or_else(|| ShareError::CryptoError("no session key".into()))?;

        let (bytes, name, file_hash) = {
            let store = self.ctx.store.read().await;
            let descriptor = store
                .descriptor(file_id)
                .ok_or_else(|| ShareError::FileNotFound(file_id.to_string()))?;
            (
                store.assemble(file_id, &cipher)?,
                descriptor.name.clone(),
                descriptor.file_hash.clone(),
            )
        };

        if !HashUtils::verify_data(&bytes, &file_hash) {
            return Err(ShareError::CryptoError(format!(
                "assembled {} does not match the advertised hash",
                file_id
            )));
        }

        let location: PathBuf = self
            .sink
            .write_assembled_file(file_id, &name, &bytes)
            .await?;

        self.ctx.sessions.write().await.transition(
            file_id,
            SessionState::Complete,
            Instant::now(),
        )?;
        self.ctx.metrics.record_file_downloaded().await;
        info!(
            "Download completed: {} -> {:?} ({} bytes in {:?})",
            file_id,
            location,
            bytes.len(),
            state.started_at.elapsed()
        );
        self.ctx.events.emit(NodeEvent::DownloadComplete {
            file_id: file_id.clone(),
            location,
        });

        if self.ctx.config.redistribute && state.total_chunks > 0 {
            self.announce_chunks(file_id, state.received.iter().copied().collect())
                .await;
        }
        Ok(())
    }

    async fn fail(&self, file_id: &FileId, reason: String) {
        if let Err(e) = self.ctx.sessions.write().await.transition(
            file_id,
            SessionState::Failed,
            Instant::now(),
        ) {
            debug!("Session for {} not failed: {}", file_id, e);
        }
        self.ctx.store.write().await.remove_file(file_id);
        self.ctx.directory.write().await.forget_file(file_id);
        self.ctx.events.emit(NodeEvent::DownloadFailed {
            file_id: file_id.clone(),
            reason,
        });
    }

    async fn announce_chunks(&self, file_id: &FileId, chunks: Vec<u32>) {
        debug!("Announcing {} chunk(s) of {}", chunks.len(), file_id);
        let body = Body::ChunkAvailable {
            file_id: file_id.clone(),
            chunks,
        };
        if let Err(e) = self.ctx.messenger.broadcast(body).await {
            warn!("Chunk announcement for {} failed: {}", file_id, e);
        }
    }
}
