// SPDX-License-Identifier: MIT OR Apache-2.0

//! Opaque-model boundary.
//!
//! [`AlignableBackend`] is the only thing an alignable model needs from
//! the network it instruments: metadata for resolving intervention points,
//! the module structure for ordering them, and hook-aware `forward` and
//! `generate` entry points.  The backend owns the computation; it merely
//! announces every named module call to the [`ModuleHooks`] it is given.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};

use crate::config::ModelDims;
use crate::error::{AlignError, Result};
use crate::hooks::ModuleHooks;

// ---------------------------------------------------------------------------
// AlignableBackend trait
// ---------------------------------------------------------------------------

/// Interface every instrumented model implements.
pub trait AlignableBackend {
    // --- Metadata --------------------------------------------------------

    /// Model family used to look up module mappings (`"gpt2"`, `"llama"`).
    fn family(&self) -> &str;

    /// Dimensions needed to resolve feature widths.
    fn dims(&self) -> &ModelDims;

    /// Device holding the model weights.
    fn device(&self) -> &Device;

    /// Named modules in depth-first structural order (pre-order).
    ///
    /// A module's children follow it immediately and share its path as a
    /// dot-separated prefix, e.g. `h.0`, `h.0.attn`, `h.0.attn.c_attn`.
    fn module_paths(&self) -> Vec<String>;

    // --- Computation -----------------------------------------------------

    /// One forward pass over named inputs.
    ///
    /// Every named module call must be announced through `hooks`, before
    /// and after it runs, and the backend must continue with whatever
    /// tensors the hooks leave in place.
    ///
    /// # Shapes
    /// - `inputs.input_ids()`: `[batch, seq]`
    /// - returns: [`ModelOutput`] with `logits` at `[batch, seq, vocab]`
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Model`] on tensor failures and propagates
    /// any hook error unchanged.
    fn forward(&self, inputs: &ModelInputs, hooks: &mut dyn ModuleHooks) -> Result<ModelOutput>;

    /// Autoregressive decoding from `input_ids`.
    ///
    /// The prompt is processed first; each further module call
    /// corresponds to one decode step.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - returns: `[batch, seq + generated]`
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward).
    fn generate(
        &self,
        input_ids: &Tensor,
        options: &GenerationOptions,
        hooks: &mut dyn ModuleHooks,
    ) -> Result<Tensor>;
}

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// Named input tensors of one model call.
#[derive(Debug, Clone, Default)]
pub struct ModelInputs {
    tensors: BTreeMap<String, Tensor>,
}

impl ModelInputs {
    /// Inputs holding only `input_ids`.
    #[must_use]
    pub fn from_input_ids(input_ids: Tensor) -> Self {
        Self::default().with("input_ids", input_ids)
    }

    /// Add or replace a named tensor.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.tensors.insert(name.into(), tensor);
        self
    }

    /// Named tensor, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// The `input_ids` tensor.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if the inputs carry no `input_ids`.
    pub fn input_ids(&self) -> Result<&Tensor> {
        self.get("input_ids")
            .ok_or_else(|| AlignError::Config("model inputs lack 'input_ids'".into()))
    }

    /// Batch size of `input_ids`.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if `input_ids` is missing or not rank 2.
    pub fn batch_size(&self) -> Result<usize> {
        let (batch, _) = self.input_ids()?.dims2().map_err(|_| {
            AlignError::Config("'input_ids' must be a [batch, seq] tensor".into())
        })?;
        Ok(batch)
    }

    /// Input names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

/// Output of one forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Primary output, `[batch, seq, vocab]`.
    pub logits: Tensor,
    /// Backend-specific extras (hidden states, attention maps, ...).
    pub extras: BTreeMap<String, Tensor>,
}

impl ModelOutput {
    /// Output with no extras.
    #[must_use]
    pub const fn new(logits: Tensor) -> Self {
        Self {
            logits,
            extras: BTreeMap::new(),
        }
    }

    /// Copy cut off from the autograd graph.
    #[must_use]
    pub fn detach(&self) -> Self {
        Self {
            logits: self.logits.detach(),
            extras: self
                .extras
                .iter()
                .map(|(k, v)| (k.clone(), v.detach()))
                .collect(),
        }
    }
}

/// Decoding options forwarded to [`AlignableBackend::generate`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    /// Tokens to produce after the prompt.
    pub max_new_tokens: usize,
    /// Sampling temperature; `<= 0.0` is greedy.
    pub temperature: f32,
    /// Stop once every row has produced this token.
    pub eos_token_id: Option<u32>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 16,
            temperature: 0.0,
            eos_token_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sampling helpers
// ---------------------------------------------------------------------------

/// Pick the next token of every row from the last position's logits.
///
/// Backends can use this to implement [`AlignableBackend::generate`].
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - returns: `[batch, 1]` of `u32`
///
/// # Errors
///
/// Returns [`AlignError::Location`] if the sequence is empty, and
/// [`AlignError::Model`] on shape or conversion failures.
pub fn next_tokens(logits: &Tensor, temperature: f32) -> Result<Tensor> {
    let (batch, seq, _vocab) = logits.dims3()?;
    let last_pos = seq.checked_sub(1).ok_or_else(|| {
        AlignError::Location("cannot pick a next token from an empty sequence".into())
    })?;
    let last = logits.narrow(1, last_pos, 1)?.squeeze(1)?;
    let mut picked = Vec::with_capacity(batch);
    for b in 0..batch {
        picked.push(sample_token(&last.get(b)?, temperature)?);
    }
    Ok(Tensor::from_vec(picked, (batch, 1), logits.device())?)
}

/// Sample a token from logits using the given temperature.
///
/// When `temperature <= 0.0`, performs greedy (argmax) decoding.
///
/// # Shapes
/// - `logits`: `[vocab_size]`
///
/// # Errors
///
/// Returns [`AlignError::Model`] if the logits tensor is empty or cannot
/// be converted to `f32`.
pub fn sample_token(logits: &Tensor, temperature: f32) -> Result<u32> {
    if temperature <= 0.0 {
        argmax(logits)
    } else {
        sample_with_temperature(logits, temperature)
    }
}

fn argmax(logits: &Tensor) -> Result<u32> {
    let values: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let (max_idx, _) = values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| AlignError::Model(candle_core::Error::Msg("empty logits".into())))?;

    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    Ok(max_idx as u32)
}

fn sample_with_temperature(logits: &Tensor, temperature: f32) -> Result<u32> {
    use rand::Rng;

    let values: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    if values.is_empty() {
        return Err(AlignError::Model(candle_core::Error::Msg("empty logits".into())));
    }
    let scaled: Vec<f32> = values.iter().map(|x| x / temperature).collect();
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let r: f32 = rand::thread_rng().r#gen::<f32>() * sum;
    let mut cumsum = 0.0;
    for (idx, &p) in exp_vals.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            return Ok(idx as u32);
        }
    }

    // Floating-point rounding can leave r just above the final cumsum.
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    Ok((exp_vals.len() - 1) as u32)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
