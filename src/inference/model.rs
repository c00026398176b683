//! Model management
//!
//! Validates model files, loads them through llama.cpp, and explains context
//! allocation failures.

use std::fs::File;
use std::io::Read;
use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::LlamaModel;
use once_cell::sync::OnceCell;

use crate::config::SessionConfig;
use crate::error::{InferenceError, Result};
use crate::inference::context::ExecutionContext;
use crate::system::available_memory_bytes;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Bytes per cached element (f16 keys and values)
pub const KV_ELEMENT_SIZE: u64 = 2;

/// Template used when the model ships without one (ChatML)
pub const DEFAULT_CHAT_TEMPLATE: &str = "{% for message in messages %}\
{{ '<|im_start|>' + message['role'] + '\\n' + message['content'] + '<|im_end|>' + '\\n' }}\
{% endfor %}\
{% if add_generation_prompt %}{{ '<|im_start|>assistant\\n' }}{% endif %}";

static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

/// Process-wide llama.cpp backend, initialised on first use
pub fn backend() -> Result<&'static LlamaBackend> {
    BACKEND.get_or_try_init(|| {
        LlamaBackend::init().map_err(|e| {
            InferenceError::FailedToLoad(format!("failed to initialize backend: {e}"))
        })
    })
}

/// Metadata captured when a model is loaded
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Embedding dimension
    pub embedding_width: i32,
    /// Training context length
    pub trained_context: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
    /// Jinja chat template, or [`DEFAULT_CHAT_TEMPLATE`]
    pub chat_template: String,
}

/// Header fields of a GGUF file
#[derive(Debug, Clone, PartialEq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Runs the file checks that must pass before the native loader is invoked.
///
/// Order: exists, regular file, readable, non-empty. Returns the file size.
pub fn validate_model_file<P: AsRef<Path>>(path: P) -> Result<u64> {
    let path = path.as_ref();
    let fail = |reason: &str| InferenceError::FailedToLoad(format!("{}: {reason}", path.display()));

    if !path.exists() {
        return Err(fail("file does not exist"));
    }
    let metadata = std::fs::metadata(path).map_err(|e| fail(&e.to_string()))?;
    if !metadata.is_file() {
        return Err(fail("not a regular file"));
    }
    File::open(path).map_err(|e| fail(&format!("file is not readable ({e})")))?;
    if metadata.len() == 0 {
        return Err(fail("file is empty"));
    }
    Ok(metadata.len())
}

/// Reads and checks the GGUF header (magic and version 2 or 3)
pub fn read_gguf_header<P: AsRef<Path>>(path: P) -> Result<GgufHeader> {
    let path = path.as_ref();
    let fail = |reason: String| InferenceError::FailedToLoad(format!("{}: {reason}", path.display()));

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let mut header = [0u8; 24];
    let mut file = File::open(path).map_err(|e| fail(e.to_string()))?;
    file.read_exact(&mut header)
        .map_err(|_| fail("file too small to be valid GGUF".to_string()))?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != GGUF_MAGIC {
        return Err(fail(format!(
            "invalid GGUF magic (expected 0x{GGUF_MAGIC:08X}, got 0x{magic:08X})"
        )));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !(2..=3).contains(&version) {
        return Err(fail(format!("unsupported GGUF version {version}")));
    }

    let mut tensor_count = [0u8; 8];
    tensor_count.copy_from_slice(&header[8..16]);
    let mut metadata_kv_count = [0u8; 8];
    metadata_kv_count.copy_from_slice(&header[16..24]);

    Ok(GgufHeader {
        version,
        tensor_count: u64::from_le_bytes(tensor_count),
        metadata_kv_count: u64::from_le_bytes(metadata_kv_count),
    })
}

/// Explains why a context allocation may have failed.
///
/// Every matching cause is listed; an opaque message is returned if none match.
pub fn diagnose_allocation_failure(
    context_size: u32,
    threads: i32,
    trained_context: u32,
    embedding_width: i32,
    available_memory: Option<u64>,
) -> String {
    let mut causes = Vec::new();
    if context_size > trained_context {
        causes.push(format!(
            "context size {context_size} exceeds the model's trained maximum {trained_context}"
        ));
    }
    if threads <= 0 {
        causes.push(format!("thread count must be positive, got {threads}"));
    }
    if let Some(available) = available_memory {
        let estimate = context_size as u64 * embedding_width.max(0) as u64 * KV_ELEMENT_SIZE;
        if estimate > available {
            causes.push(format!(
                "estimated cache size {} MB exceeds available memory {} MB",
                estimate / (1024 * 1024),
                available / (1024 * 1024)
            ));
        }
    }
    if causes.is_empty() {
        "context allocation failed for an unknown reason".to_string()
    } else {
        causes.join("; ")
    }
}

/// A loaded model. Contexts borrow it and cannot outlive it.
pub struct EngineHandle {
    model: LlamaModel,
    info: ModelInfo,
}

impl EngineHandle {
    /// Validates the file and loads the model
    ///
    /// # Arguments
    /// * `path` - Path to the GGUF model file
    /// * `gpu_layers` - Number of layers to offload to GPU (0 = CPU only)
    pub fn load<P: AsRef<Path>>(path: P, gpu_layers: u32) -> Result<Self> {
        let path = path.as_ref();
        let size = validate_model_file(path)?;
        let header = read_gguf_header(path)?;
        tracing::debug!(
            "GGUF v{} header ok: {} tensors, {} metadata entries, {} bytes",
            header.version,
            header.tensor_count,
            header.metadata_kv_count,
            size
        );

        let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        let model = LlamaModel::load_from_file(backend()?, path, &params)
            .map_err(|e| InferenceError::FailedToLoad(format!("{}: {e}", path.display())))?;

        let chat_template = match model.meta_val_str("tokenizer.chat_template") {
            Ok(template) if !template.trim().is_empty() => template,
            _ => {
                tracing::warn!("Model has no chat template, using built-in default");
                DEFAULT_CHAT_TEMPLATE.to_string()
            }
        };

        let info = ModelInfo {
            path: path.to_string_lossy().to_string(),
            vocab_size: model.n_vocab(),
            embedding_width: model.n_embd(),
            trained_context: model.n_ctx_train(),
            param_count: model.n_params() as u64,
            size_bytes: model.size() as u64,
            chat_template,
        };

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx)",
            info.path,
            info.param_count,
            info.vocab_size,
            info.trained_context
        );

        Ok(Self { model, info })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    pub fn vocab_size(&self) -> i32 {
        self.info.vocab_size
    }

    pub fn embedding_width(&self) -> i32 {
        self.info.embedding_width
    }

    pub fn trained_context(&self) -> u32 {
        self.info.trained_context
    }

    pub fn chat_template(&self) -> &str {
        &self.info.chat_template
    }

    /// Builds a validated execution context bound to this model
    pub fn allocate_context(&self, config: &SessionConfig) -> Result<ExecutionContext<'_>> {
        ExecutionContext::create(self, config)
    }

    /// Allocates the native context, translating failure into a diagnosis
    pub(crate) fn new_native_context(&self, config: &SessionConfig) -> Result<LlamaContext<'_>> {
        let threads = config.resolved_threads();
        let context_size = NonZeroU32::new(config.context_size)
            .ok_or_else(|| InferenceError::InvalidParameter("context_size must be greater than 0".into()))?;

        let params = LlamaContextParams::default()
            .with_n_ctx(Some(context_size))
            .with_n_batch(config.batch_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        self.model.new_context(backend()?, params).map_err(|e| {
            let reason = diagnose_allocation_failure(
                config.context_size,
                threads,
                self.info.trained_context,
                self.info.embedding_width,
                available_memory_bytes(),
            );
            tracing::error!("Context allocation failed ({e}): {reason}");
            InferenceError::InvalidParameter(reason)
        })
    }
}
