//! Execution context
//!
//! Owns one native llama.cpp context, its reusable batch, the sampler chain
//! and a candidate buffer. Every resource is released by `Drop`, including
//! when construction fails halfway.

use std::ops::Range;

use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::{AddBos, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::data::LlamaTokenData;
use llama_cpp_2::token::LlamaToken;

use crate::cache::kv::{self, KvCache, Position};
use crate::config::SessionConfig;
use crate::error::{InferenceError, Result};
use crate::inference::model::EngineHandle;
use crate::inference::sampler::SamplerPlan;

/// Only one sequence is ever used
const SEQ_ID: i32 = 0;

pub struct ExecutionContext<'m> {
    engine: &'m EngineHandle,
    ctx: LlamaContext<'m>,
    batch: LlamaBatch,
    batch_size: usize,
    context_size: u32,
    sampler: LlamaSampler,
    plan: SamplerPlan,
    candidates: Vec<LlamaTokenData>,
    /// Batch index of the token whose logits are sampled next
    logits_index: i32,
}

impl<'m> ExecutionContext<'m> {
    /// Validates settings, then allocates the sampler, native context and batch.
    ///
    /// Nothing native is allocated if validation fails.
    pub fn create(engine: &'m EngineHandle, config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        if engine.vocab_size() <= 0 {
            return Err(InferenceError::InvalidParameter(format!(
                "model reports vocabulary size {}",
                engine.vocab_size()
            )));
        }

        let plan = SamplerPlan::from_config(config);
        let sampler = plan.build(engine.model())?;
        let ctx = engine.new_native_context(config)?;

        let batch_size = config.batch_size as usize;
        let batch = LlamaBatch::new(batch_size, 1);
        let candidates = Vec::with_capacity(engine.vocab_size() as usize);

        tracing::info!(
            "Execution context ready: ctx {}, batch {}, threads {}, {} sampler stages",
            config.context_size,
            batch_size,
            config.resolved_threads(),
            plan.stages().len()
        );

        Ok(Self {
            engine,
            ctx,
            batch,
            batch_size,
            context_size: config.context_size,
            sampler,
            plan,
            candidates,
            logits_index: 0,
        })
    }

    pub fn engine(&self) -> &'m EngineHandle {
        self.engine
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn sampler_plan(&self) -> &SamplerPlan {
        &self.plan
    }

    /// Tokenizes text, adding BOS only at the start of an empty sequence
    pub fn tokenize(&self, text: &str) -> Result<Vec<LlamaToken>> {
        let add_bos = if self.current_position() == 0 {
            AddBos::Always
        } else {
            AddBos::Never
        };
        self.engine
            .model()
            .str_to_token(text, add_bos)
            .map_err(|e| InferenceError::Tokenization(e.to_string()))
    }

    /// Decodes up to one batch of tokens at the current end of the sequence
    pub fn decode(&mut self, tokens: &[LlamaToken]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        if tokens.len() > self.batch_size {
            return Err(InferenceError::Decode(format!(
                "{} tokens exceed batch capacity {}",
                tokens.len(),
                self.batch_size
            )));
        }

        let start = self.current_position() as i32;
        self.batch.clear();
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            self.batch
                .add(*token, start + i as i32, &[SEQ_ID], i == last)
                .map_err(|e| InferenceError::Decode(format!("failed to add token to batch: {e}")))?;
        }

        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| InferenceError::Decode(e.to_string()))?;
        self.logits_index = self.batch.n_tokens() - 1;
        Ok(())
    }

    /// Samples the next token from the most recent logits
    pub fn sample(&mut self) -> LlamaToken {
        self.sampler.sample(&self.ctx, self.logits_index)
    }

    /// Clears per-request sampler state (penalty history, grammar progress)
    pub fn reset_sampler(&mut self) {
        self.sampler.reset();
    }

    pub fn is_end_of_generation(&self, token: LlamaToken) -> bool {
        self.engine.model().is_eog_token(token)
    }

    pub fn token_bytes(&self, token: LlamaToken) -> Result<Vec<u8>> {
        self.engine
            .model()
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| InferenceError::Tokenization(e.to_string()))
    }

    /// Highest-logit candidates for the pending position
    pub fn top_candidates(&mut self, n: usize) -> Vec<(LlamaToken, f32)> {
        self.candidates.clear();
        self.candidates
            .extend(self.ctx.candidates_ith(self.logits_index));
        self.candidates
            .sort_unstable_by(|a, b| b.logit().total_cmp(&a.logit()));
        self.candidates
            .iter()
            .take(n)
            .map(|c| (c.id(), c.logit()))
            .collect()
    }

    /// Compacts ahead of `incoming` positions; see [`kv::make_room`]
    pub fn make_room(
        &mut self,
        incoming: u32,
        keep_head: u32,
        target_usage: f32,
    ) -> Result<Option<Range<Position>>> {
        kv::make_room(self, incoming, keep_head, target_usage)
    }

    /// Tokens decoded per piece so compaction can always run in between
    pub fn piece_len(&self) -> usize {
        kv::piece_len(self.batch_size, self.context_size)
    }

    /// Drops the whole occupied range
    pub fn clear(&mut self) {
        self.ctx.clear_kv_cache();
        self.logits_index = 0;
    }
}

impl KvCache for ExecutionContext<'_> {
    fn occupied_range(&self) -> Option<(Position, Position)> {
        let max = self.ctx.kv_cache_seq_pos_max(SEQ_ID);
        if max < 0 {
            return None;
        }
        // llama-cpp-2 exposes no per-sequence minimum query. Removals only
        // truncate the tail or drop a window past the head, so the sequence
        // always starts at position 0.
        Some((0, max as Position))
    }

    fn remove_range(&mut self, start: Position, end: Option<Position>) -> bool {
        match self.ctx.clear_kv_cache_seq(Some(SEQ_ID as u32), Some(start), end) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!("Invalid cache removal [{start}, {end:?}): {e}");
                false
            }
        }
    }

    fn shift_range(&mut self, start: Position, end: Option<Position>, delta: i32) {
        if let Err(e) = self.ctx.kv_cache_seq_add(SEQ_ID, Some(start), end, delta) {
            tracing::error!("Invalid cache shift [{start}, {end:?}) by {delta}: {e}");
        }
    }

    fn capacity(&self) -> u32 {
        self.context_size
    }
}
