//! Sampler pipeline
//!
//! The stage list is derived from validated settings once and never
//! reordered: temperature, distribution, top-k, top-p, min-p, typical-p,
//! penalties, then the optional grammar. The native chain draws last; see
//! [`SamplerPlan::native_order`].

use llama_cpp_2::model::LlamaModel;
use llama_cpp_2::sampling::LlamaSampler;

use crate::config::{SessionConfig, StructuredOutput};
use crate::error::{InferenceError, Result};

/// Seed value that asks llama.cpp to pick a random seed
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// GBNF grammar accepting any JSON value
pub const JSON_GRAMMAR: &str = r#"
root   ::= value
value  ::= object | array | string | number | ("true" | "false" | "null") ws

object ::=
  "{" ws (
            string ":" ws value
    ("," ws string ":" ws value)*
  )? "}" ws

array  ::=
  "[" ws (
            value
    ("," ws value)*
  )? "]" ws

string ::=
  "\"" (
    [^"\\\x7F\x00-\x1F] |
    "\\" (["\\bfnrt] | "u" [0-9a-fA-F]{4})
  )* "\"" ws

number ::= ("-"? ([0-9] | [1-9] [0-9]{0,15})) ("." [0-9]+)? ([eE] [-+]? [0-9] [1-9]{0,15})? ws

ws ::= | " " | "\n" [ \t]{0,20}
"#;

/// One token-selection stage
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerStage {
    Temperature(f32),
    Distribution { seed: u32 },
    TopK(i32),
    TopP { p: f32, min_keep: usize },
    MinP { p: f32, min_keep: usize },
    Typical { p: f32, min_keep: usize },
    Penalties { last_n: i32, repeat: f32 },
    Grammar { grammar: String, root: String },
}

/// Ordered, immutable list of sampler stages
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerPlan {
    stages: Vec<SamplerStage>,
}

impl SamplerPlan {
    /// Derives the stage list from settings that already passed validation
    pub fn from_config(config: &SessionConfig) -> Self {
        let mut stages = vec![
            SamplerStage::Temperature(config.temperature),
            SamplerStage::Distribution {
                seed: config.seed.unwrap_or(DEFAULT_SEED),
            },
            SamplerStage::TopK(config.top_k),
            SamplerStage::TopP {
                p: config.top_p,
                min_keep: 0,
            },
            SamplerStage::MinP {
                p: 1.0 - config.top_p,
                min_keep: 0,
            },
            SamplerStage::Typical {
                p: config.typical_p,
                min_keep: 0,
            },
            SamplerStage::Penalties {
                last_n: config.penalty_last_n,
                repeat: config.penalty_repeat,
            },
        ];

        match &config.structured_output {
            StructuredOutput::None => {}
            StructuredOutput::Json => stages.push(SamplerStage::Grammar {
                grammar: JSON_GRAMMAR.to_string(),
                root: "root".to_string(),
            }),
            StructuredOutput::Grammar { grammar, root } => stages.push(SamplerStage::Grammar {
                grammar: grammar.clone(),
                root: root.clone(),
            }),
        }

        Self { stages }
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    pub fn has_grammar(&self) -> bool {
        matches!(self.stages.last(), Some(SamplerStage::Grammar { .. }))
    }

    /// Stages in the order the native chain applies them.
    ///
    /// llama.cpp selects the token in the distribution stage and expects
    /// every later stage to leave that selection intact, so the draw moves
    /// behind all filters and the grammar. The relative order of the rest
    /// is unchanged.
    pub fn native_order(&self) -> Vec<&SamplerStage> {
        let (draws, mut stages): (Vec<_>, Vec<_>) = self
            .stages
            .iter()
            .partition(|s| matches!(s, SamplerStage::Distribution { .. }));
        stages.extend(draws);
        stages
    }

    /// Compiles the plan into a native sampler chain
    pub fn build(&self, model: &LlamaModel) -> Result<LlamaSampler> {
        let mut samplers = Vec::with_capacity(self.stages.len());
        for stage in self.native_order() {
            let sampler = match stage {
                SamplerStage::Temperature(t) => LlamaSampler::temp(*t),
                SamplerStage::Distribution { seed } => LlamaSampler::dist(*seed),
                SamplerStage::TopK(k) => LlamaSampler::top_k(*k),
                SamplerStage::TopP { p, min_keep } => LlamaSampler::top_p(*p, *min_keep),
                SamplerStage::MinP { p, min_keep } => LlamaSampler::min_p(*p, *min_keep),
                SamplerStage::Typical { p, min_keep } => LlamaSampler::typical(*p, *min_keep),
                SamplerStage::Penalties { last_n, repeat } => {
                    LlamaSampler::penalties(*last_n, *repeat, 0.0, 0.0)
                }
                SamplerStage::Grammar { grammar, root } => {
                    LlamaSampler::grammar(model, grammar, root).map_err(|e| {
                        InferenceError::InvalidParameter(format!(
                            "grammar with root '{root}' failed to compile: {e}"
                        ))
                    })?
                }
            };
            samplers.push(sampler);
        }
        Ok(LlamaSampler::chain_simple(samplers))
    }
}
