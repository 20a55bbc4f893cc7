use std::path::Path;

use anyhow::{anyhow, Result};
use ndarray::{concatenate, ArrayD, Axis, IxDyn};
use tokenizers::Tokenizer;

use crate::session::ModelSession;

pub const MAX_TOKENS: usize = 77;
const END_OF_TEXT: &str = "<|endoftext|>";

/// A CLIP tokenizer paired with its text encoder.
pub(crate) struct PromptEncoder {
    tokenizer: Tokenizer,
    session: ModelSession,
    pad_id: u32,
    eos_id: u32,
    hidden_output: String,
}

impl PromptEncoder {
    /// `pad_token` differs between the two SDXL tokenizers (`<|endoftext|>` and `!`).
    pub(crate) fn new(tokenizer_file: &Path, session: ModelSession, pad_token: &str) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(|e| anyhow!("failed to load tokenizer {}: {}", tokenizer_file.display(), e))?;
        let eos_id = tokenizer
            .token_to_id(END_OF_TEXT)
            .ok_or_else(|| anyhow!("tokenizer {} has no {} token", tokenizer_file.display(), END_OF_TEXT))?;
        let pad_id = tokenizer.token_to_id(pad_token).unwrap_or(eos_id);
        let hidden_output = penultimate_hidden_state(session.output_names())
            .ok_or_else(|| anyhow!("text encoder {} exposes no hidden_states.N outputs", tokenizer_file.display()))?;
        Ok(Self {
            tokenizer,
            session,
            pad_id,
            eos_id,
            hidden_output,
        })
    }

    pub(crate) fn token_ids(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("failed to tokenize prompt: {}", e))?;
        Ok(pad_or_truncate(encoding.get_ids(), self.pad_id, self.eos_id))
    }

    /// Returns the penultimate hidden state `[1, 77, dim]` and, when asked for, the pooled projection.
    pub(crate) fn encode(&self, prompt: &str, pooled_output: Option<&str>) -> Result<(ArrayD<f32>, Option<ArrayD<f32>>)> {
        let ids: Vec<f32> = self.token_ids(prompt)?.into_iter().map(|id| id as f32).collect();
        let ids = ArrayD::from_shape_vec(IxDyn(&[1, MAX_TOKENS]), ids)?;
        let inputs = vec![self.session.input("input_ids", ids)?];

        let mut wanted = vec![self.hidden_output.as_str()];
        if let Some(pooled) = pooled_output {
            wanted.push(pooled);
        }
        let mut outputs = self.session.run(inputs, &wanted)?.into_iter();
        let hidden = outputs.next().ok_or_else(|| anyhow!("text encoder returned no hidden state"))?;
        Ok((hidden, outputs.next()))
    }
}

/// CLIP token ids padded to 77 entries; long prompts are cut and keep their end-of-text token.
pub(crate) fn pad_or_truncate(ids: &[u32], pad_id: u32, eos_id: u32) -> Vec<u32> {
    let mut out: Vec<u32> = ids.iter().copied().take(MAX_TOKENS).collect();
    if ids.len() > MAX_TOKENS {
        out[MAX_TOKENS - 1] = eos_id;
    }
    out.resize(MAX_TOKENS, pad_id);
    out
}

/// `hidden_states.{N-1}` where `hidden_states.N` is the last layer the encoder exports.
pub(crate) fn penultimate_hidden_state(output_names: &[String]) -> Option<String> {
    let last = output_names
        .iter()
        .filter_map(|name| name.strip_prefix("hidden_states.")?.parse::<usize>().ok())
        .max()?;
    Some(format!("hidden_states.{}", last.checked_sub(1)?))
}

/// Both SDXL text encoders: their penultimate states are joined on the feature axis and the
/// second encoder's pooled projection conditions the UNet.
pub(crate) struct SdxlTextEncoders {
    pub(crate) first: PromptEncoder,
    pub(crate) second: PromptEncoder,
}

pub(crate) struct PromptEmbeddings {
    pub(crate) hidden: ArrayD<f32>,
    pub(crate) pooled: ArrayD<f32>,
}

impl SdxlTextEncoders {
    pub(crate) fn encode(&self, prompt: &str) -> Result<PromptEmbeddings> {
        let (first, _) = self.first.encode(prompt, None)?;
        let (second, pooled) = self.second.encode(prompt, Some("text_embeds"))?;
        let pooled = pooled.ok_or_else(|| anyhow!("second text encoder returned no text_embeds"))?;
        let hidden = concatenate(Axis(2), &[first.view(), second.view()])?;
        Ok(PromptEmbeddings { hidden, pooled })
    }
}
