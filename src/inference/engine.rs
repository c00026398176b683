//! Session implementation
//!
//! A session owns one loaded model, one execution context and the prompt
//! cache for a single conversation.
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaModel`, `LlamaContext`) contain raw pointers that
//! are not `Send`, and the context borrows the model. Both therefore live on
//! a dedicated worker thread; the caller talks to it through channels. The
//! worker handles one command at a time, which serializes every mutation of
//! the batch, sampler and prompt cache.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use uuid::Uuid;

use crate::cache::{CacheEntry, KvCache, PromptCache};
use crate::config::SessionConfig;
use crate::error::{InferenceError, Result};
use crate::inference::context::ExecutionContext;
use crate::inference::model::{EngineHandle, ModelInfo};
use crate::inference::streaming::{StopCheck, StopMatcher, StreamToken, TokenStream, Utf8Buffer};
use crate::logging;
use crate::types::MessageChunk;

/// Commands sent to the worker thread
enum WorkerCommand {
    Submit {
        chunks: Vec<MessageChunk>,
        token_tx: Sender<StreamToken>,
        stop_signal: Arc<AtomicBool>,
    },
    Reset {
        response_tx: Sender<Result<()>>,
    },
    Snapshot {
        response_tx: Sender<Vec<CacheEntry>>,
    },
    Shutdown,
}

/// A conversation bound to one model and context
pub struct Session {
    id: Uuid,
    command_tx: Option<Sender<WorkerCommand>>,
    worker_handle: Option<JoinHandle<()>>,
    model_info: ModelInfo,
    config: SessionConfig,
}

impl Session {
    /// Loads the model and builds the execution context.
    ///
    /// Settings are validated first; an invalid value fails without loading
    /// anything.
    pub fn create<P: AsRef<Path>>(model_path: P, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let id = Uuid::new_v4();
        let path = model_path.as_ref().to_path_buf();
        logging::route_engine_logs(config.verbose);

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<ModelInfo>>();

        let worker_config = config.clone();
        let handle = thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || worker_thread_main(id, path, worker_config, ready_tx, command_rx))
            .map_err(|e| InferenceError::Worker(e.to_string()))?;

        let model_info = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(e) => {
                let _ = handle.join();
                return Err(InferenceError::Worker(e.to_string()));
            }
        };

        tracing::info!("Session {id} started");
        Ok(Self {
            id,
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            model_info,
            config,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Information about the loaded model
    pub fn model_info(&self) -> &ModelInfo {
        &self.model_info
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Submits the full conversation and streams the reply.
    ///
    /// Previously processed chunks are reused; only the differing suffix is
    /// evaluated. Image and video chunks fail with
    /// [`InferenceError::VisionUnsupported`] and leave the session untouched.
    pub fn submit(&self, chunks: Vec<MessageChunk>) -> Result<TokenStream> {
        check_request(&chunks)?;

        let (token_tx, token_rx) = mpsc::channel();
        let stop_signal = Arc::new(AtomicBool::new(false));
        self.send(WorkerCommand::Submit {
            chunks,
            token_tx,
            stop_signal: stop_signal.clone(),
        })?;
        Ok(TokenStream::new(token_rx, stop_signal))
    }

    /// Forgets all cached chunks and clears the engine's occupied range
    pub fn reset(&self) -> Result<()> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::Reset { response_tx })?;
        response_rx
            .recv()
            .map_err(|e| InferenceError::Worker(e.to_string()))?
    }

    /// Copy of the prompt cache as the worker currently sees it
    pub fn cached_entries(&self) -> Result<Vec<CacheEntry>> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::Snapshot { response_tx })?;
        response_rx
            .recv()
            .map_err(|e| InferenceError::Worker(e.to_string()))
    }

    fn send(&self, command: WorkerCommand) -> Result<()> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| InferenceError::Worker("session is shut down".into()))?
            .send(command)
            .map_err(|_| InferenceError::Worker("session worker has stopped".into()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Rejects requests this backend cannot evaluate
fn check_request(chunks: &[MessageChunk]) -> Result<()> {
    if chunks.iter().any(MessageChunk::is_media) {
        return Err(InferenceError::VisionUnsupported);
    }
    if chunks.iter().all(MessageChunk::is_empty_text) {
        return Err(InferenceError::InvalidParameter(
            "request contains no content".into(),
        ));
    }
    Ok(())
}

/// Worker thread main loop
///
/// Owns the engine and context; exits on shutdown, on a closed channel, or
/// after an invariant violation.
fn worker_thread_main(
    id: Uuid,
    path: PathBuf,
    config: SessionConfig,
    ready_tx: Sender<Result<ModelInfo>>,
    command_rx: Receiver<WorkerCommand>,
) {
    let span = tracing::info_span!("session", %id);
    let _guard = span.enter();

    let engine = match EngineHandle::load(&path, config.gpu_layers) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("{e}");
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let ctx = match engine.allocate_context(&config) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("{e}");
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(engine.info().clone()));

    let mut worker = Worker {
        ctx,
        cache: PromptCache::new(),
        config,
    };

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Submit {
                chunks,
                token_tx,
                stop_signal,
            }) => match worker.submit(&chunks, &token_tx, &stop_signal) {
                Ok(()) => {
                    let _ = token_tx.send(StreamToken::Done);
                }
                Err(e) => {
                    let fatal = e.is_fatal();
                    tracing::error!("Request failed: {e}");
                    let _ = token_tx.send(StreamToken::Error(e));
                    if fatal {
                        tracing::error!("Session state is inconsistent, stopping worker");
                        break;
                    }
                }
            },
            Ok(WorkerCommand::Reset { response_tx }) => {
                let _ = response_tx.send(worker.reset());
            }
            Ok(WorkerCommand::Snapshot { response_tx }) => {
                let _ = response_tx.send(worker.cache.entries().to_vec());
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

struct Worker<'m> {
    ctx: ExecutionContext<'m>,
    cache: PromptCache,
    config: SessionConfig,
}

impl Worker<'_> {
    fn submit(
        &mut self,
        chunks: &[MessageChunk],
        tx: &Sender<StreamToken>,
        stop_signal: &AtomicBool,
    ) -> Result<()> {
        self.ctx.reset_sampler();
        let pending = self.cache.prepare(&mut self.ctx, chunks)?;
        self.bookkeeping(&format!(
            "{} cached entries reused, resuming at position {}",
            self.cache.len(),
            self.ctx.current_position()
        ));

        let mut record = true;
        let mut decoded = 0;
        for chunk in pending {
            match chunk {
                MessageChunk::Text(text) => {
                    let (count, compacted) = self.evaluate_text(&text)?;
                    decoded += count;
                    record &= !compacted;
                    if record {
                        let position = self.ctx.current_position();
                        self.cache.record_append(MessageChunk::Text(text), position);
                    }
                }
                MessageChunk::Images(_) | MessageChunk::Videos(_) => {
                    return Err(InferenceError::VisionUnsupported);
                }
            }
        }
        // The logits left by the previous request belong to removed state
        if decoded == 0 {
            return Err(InferenceError::Tokenization(
                "request produced no tokens to evaluate".into(),
            ));
        }

        self.generate(tx, stop_signal)
    }

    /// Evaluates text in pieces. Returns the token count and whether
    /// compaction ran.
    fn evaluate_text(&mut self, text: &str) -> Result<(usize, bool)> {
        let tokens = self.ctx.tokenize(text)?;
        let mut compacted = false;
        for piece in tokens.chunks(self.ctx.piece_len()) {
            compacted |= self.make_room(piece.len() as u32)?;
            self.ctx.decode(piece)?;
        }
        Ok((tokens.len(), compacted))
    }

    fn make_room(&mut self, incoming: u32) -> Result<bool> {
        let window =
            self.ctx
                .make_room(incoming, self.config.keep_head, self.config.target_usage)?;
        match window {
            Some(window) => {
                self.cache.retain_through(window.start);
                self.bookkeeping(&format!(
                    "Compacted [{}, {}), {} cache entries survive",
                    window.start,
                    window.end,
                    self.cache.len()
                ));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn generate(&mut self, tx: &Sender<StreamToken>, stop_signal: &AtomicBool) -> Result<()> {
        let mut utf8 = Utf8Buffer::default();
        let mut stops = StopMatcher::new(&self.config.stop_sequences);

        if self.config.verbose {
            let top = self.ctx.top_candidates(5);
            tracing::info!("Top candidates for first token: {top:?}");
        }

        for _ in 0..self.config.max_tokens {
            if stop_signal.load(Ordering::Relaxed) {
                tracing::debug!("Generation stopped by caller");
                return Ok(());
            }

            let token = self.ctx.sample();
            if self.ctx.is_end_of_generation(token) {
                tracing::debug!("End of generation token encountered");
                break;
            }

            let text = utf8.push(&self.ctx.token_bytes(token)?);
            match stops.push(&text) {
                StopCheck::Continue(emit) => {
                    if !emit.is_empty() && tx.send(StreamToken::Token(emit)).is_err() {
                        tracing::debug!("Receiver dropped, stopping generation");
                        return Ok(());
                    }
                }
                StopCheck::Stop(emit) => {
                    if !emit.is_empty() {
                        let _ = tx.send(StreamToken::Token(emit));
                    }
                    tracing::debug!("Stop sequence reached");
                    return Ok(());
                }
            }

            self.make_room(1)?;
            self.ctx.decode(&[token])?;
        }

        let tail = utf8.flush();
        let rest = match stops.push(&tail) {
            StopCheck::Continue(emit) => emit + &stops.finish(),
            StopCheck::Stop(emit) => emit,
        };
        if !rest.is_empty() {
            let _ = tx.send(StreamToken::Token(rest));
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.cache.clear();
        self.ctx.clear();
        if self.ctx.occupied_range().is_some() {
            return Err(InferenceError::InvariantViolation(
                "engine still holds state after a full reset".into(),
            ));
        }
        self.bookkeeping("Session reset");
        Ok(())
    }

    /// Cache bookkeeping is logged at info for verbose sessions, debug otherwise
    fn bookkeeping(&self, message: &str) {
        if self.config.verbose {
            tracing::info!("{message}");
        } else {
            tracing::debug!("{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_invalid_config_fails_before_loading() {
        // The path does not exist; validation must fail first
        let config = SessionConfig {
            top_p: 2.0,
            ..Default::default()
        };
        let result = Session::create("/definitely/missing/model.gguf", config);
        assert!(matches!(result, Err(InferenceError::InvalidParameter(_))));
    }

    #[test]
    fn test_missing_model_fails_to_load() {
        let result = Session::create("/definitely/missing/model.gguf", SessionConfig::default());
        match result {
            Err(InferenceError::FailedToLoad(reason)) => assert!(reason.contains("does not exist")),
            Err(other) => panic!("expected FailedToLoad, got {other}"),
            Ok(_) => panic!("expected FailedToLoad"),
        }
    }

    #[test]
    fn test_non_gguf_file_fails_to_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789abcdef0123456789abcdef").unwrap();
        file.flush().unwrap();
        let result = Session::create(file.path(), SessionConfig::default());
        assert!(matches!(result, Err(InferenceError::FailedToLoad(_))));
    }

    #[test]
    fn test_request_checks() {
        assert_eq!(check_request(&[MessageChunk::text("hi")]), Ok(()));
        assert_eq!(
            check_request(&[MessageChunk::text("hi"), MessageChunk::Videos(vec![])]),
            Err(InferenceError::VisionUnsupported)
        );
        assert!(matches!(check_request(&[]), Err(InferenceError::InvalidParameter(_))));
        assert!(matches!(
            check_request(&[MessageChunk::text(""), MessageChunk::text("")]),
            Err(InferenceError::InvalidParameter(_))
        ));
    }
}
