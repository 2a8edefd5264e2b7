// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared test fixture: a tiny randomly initialised GPT-2-style model that
//! fires hook events at every module the `gpt2` mapping knows about.

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::cast_possible_truncation,
    clippy::as_conversions,
    missing_docs
)]

use candle_align::{
    AlignableBackend, GenerationOptions, HookArgs, HookPhase, ModelDims, ModelInputs, ModelOutput,
    ModuleHooks, Result, hook_input, hook_output, next_tokens,
};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::{Embedding, Init, Linear, Module, VarBuilder, VarMap};

pub const VOCAB: usize = 32;
pub const HIDDEN: usize = 16;
pub const HEADS: usize = 4;
pub const LAYERS: usize = 4;
pub const MAX_POSITIONS: usize = 32;

// ---------------------------------------------------------------------------
// TinyGpt2
// ---------------------------------------------------------------------------

/// Layer norm built from plain tensor ops, so gradients flow through it.
/// `candle_nn::LayerNorm` and `softmax_last_dim` use fused kernels without
/// a backward pass.
struct Norm {
    weight: Tensor,
    bias: Tensor,
}

impl Norm {
    fn new(vb: VarBuilder<'_>) -> Self {
        Self {
            weight: vb.get_with_hints(HIDDEN, "weight", Init::Const(1.0)).unwrap(),
            bias: vb.get_with_hints(HIDDEN, "bias", Init::Const(0.0)).unwrap(),
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::ops::layer_norm_slow(x, &self.weight, &self.bias, 1e-5)?)
    }
}

struct Block {
    ln_1: Norm,
    c_attn: Linear,
    c_proj: Linear,
    ln_2: Norm,
    c_fc: Linear,
    mlp_proj: Linear,
}

pub struct TinyGpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: Norm,
    lm_head: Linear,
    dims: ModelDims,
    device: Device,
    varmap: VarMap,
}

impl TinyGpt2 {
    pub fn new() -> Self {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let intermediate = 4 * HIDDEN;

        let blocks = (0..LAYERS)
            .map(|i| {
                let vb = vb.pp(format!("h.{i}"));
                Block {
                    ln_1: Norm::new(vb.pp("ln_1")),
                    c_attn: candle_nn::linear(HIDDEN, 3 * HIDDEN, vb.pp("attn.c_attn")).unwrap(),
                    c_proj: candle_nn::linear(HIDDEN, HIDDEN, vb.pp("attn.c_proj")).unwrap(),
                    ln_2: Norm::new(vb.pp("ln_2")),
                    c_fc: candle_nn::linear(HIDDEN, intermediate, vb.pp("mlp.c_fc")).unwrap(),
                    mlp_proj: candle_nn::linear(intermediate, HIDDEN, vb.pp("mlp.c_proj"))
                        .unwrap(),
                }
            })
            .collect();

        Self {
            wte: candle_nn::embedding(VOCAB, HIDDEN, vb.pp("wte")).unwrap(),
            wpe: candle_nn::embedding(MAX_POSITIONS, HIDDEN, vb.pp("wpe")).unwrap(),
            blocks,
            ln_f: Norm::new(vb.pp("ln_f")),
            lm_head: candle_nn::linear(HIDDEN, VOCAB, vb.pp("lm_head")).unwrap(),
            dims: ModelDims {
                hidden_size: HIDDEN,
                num_layers: LAYERS,
                num_attention_heads: HEADS,
                num_kv_heads: HEADS,
                head_dim: HIDDEN / HEADS,
                intermediate_size: intermediate,
            },
            device,
            varmap,
        }
    }

    /// Model weights; the alignable model must never train these.
    pub fn weights(&self) -> Vec<candle_core::Var> {
        self.varmap.all_vars()
    }

    /// Logits for `[batch, seq]` token ids.
    pub fn logits(&self, input_ids: &Tensor, hooks: &mut dyn ModuleHooks) -> Result<Tensor> {
        let (_, seq) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, seq as u32, &self.device)?;
        let mut x = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?.unsqueeze(0)?)?;

        for (i, block) in self.blocks.iter().enumerate() {
            let name = format!("h.{i}");
            x = hook_input(hooks, &name, x)?;

            let h = block.ln_1.forward(&x)?;
            let h = hook_input(hooks, &format!("{name}.attn"), h)?;
            let qkv = hook_output(hooks, &format!("{name}.attn.c_attn"), block.c_attn.forward(&h)?)?;
            let ctx = causal_attention(&qkv)?;
            let ctx = hook_input(hooks, &format!("{name}.attn.c_proj"), ctx)?;
            let attn = hook_output(hooks, &format!("{name}.attn"), block.c_proj.forward(&ctx)?)?;
            x = (x + attn)?;

            let h = block.ln_2.forward(&x)?;
            let h = hook_input(hooks, &format!("{name}.mlp"), h)?;
            let act = hook_output(hooks, &format!("{name}.mlp.act"), block.c_fc.forward(&h)?.gelu()?)?;
            let mlp = hook_output(hooks, &format!("{name}.mlp"), block.mlp_proj.forward(&act)?)?;
            x = (x + mlp)?;

            x = hook_output(hooks, &name, x)?;
        }

        Ok(self.lm_head.forward(&self.ln_f.forward(&x)?)?)
    }
}

fn causal_attention(qkv: &Tensor) -> Result<Tensor> {
    let (b, s, _) = qkv.dims3()?;
    let head_dim = HIDDEN / HEADS;
    let split = |part: usize| -> Result<Tensor> {
        Ok(qkv
            .narrow(D::Minus1, part * HIDDEN, HIDDEN)?
            .contiguous()?
            .reshape((b, s, HEADS, head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    };
    let (q, k, v) = (split(0)?, split(1)?, split(2)?);

    let mask: Vec<f32> = (0..s)
        .flat_map(|i| (0..s).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    let mask = Tensor::from_vec(mask, (s, s), qkv.device())?;

    let scores = (q.matmul(&k.t()?.contiguous()?)? / (head_dim as f64).sqrt())?
        .broadcast_add(&mask)?;
    let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    Ok(weights
        .matmul(&v)?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b, s, HIDDEN))?)
}

impl AlignableBackend for TinyGpt2 {
    fn family(&self) -> &str {
        "gpt2"
    }

    fn dims(&self) -> &ModelDims {
        &self.dims
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn module_paths(&self) -> Vec<String> {
        let mut paths = vec!["wte".to_owned(), "wpe".to_owned()];
        for i in 0..LAYERS {
            for suffix in [
                "",
                ".ln_1",
                ".attn",
                ".attn.c_attn",
                ".attn.c_proj",
                ".ln_2",
                ".mlp",
                ".mlp.c_fc",
                ".mlp.act",
                ".mlp.c_proj",
            ] {
                paths.push(format!("h.{i}{suffix}"));
            }
        }
        paths.push("ln_f".to_owned());
        paths.push("lm_head".to_owned());
        paths
    }

    fn forward(&self, inputs: &ModelInputs, hooks: &mut dyn ModuleHooks) -> Result<ModelOutput> {
        Ok(ModelOutput::new(self.logits(inputs.input_ids()?, hooks)?))
    }

    fn generate(
        &self,
        input_ids: &Tensor,
        options: &GenerationOptions,
        hooks: &mut dyn ModuleHooks,
    ) -> Result<Tensor> {
        let mut sequence = input_ids.clone();
        for _ in 0..options.max_new_tokens {
            // no KV cache: every step re-runs the whole sequence
            let logits = self.logits(&sequence, hooks)?;
            let next = next_tokens(&logits, options.temperature)?;
            sequence = Tensor::cat(&[&sequence, &next], 1)?;
            if let Some(eos) = options.eos_token_id {
                if next.flatten_all()?.to_vec1::<u32>()?.iter().all(|&t| t == eos) {
                    break;
                }
            }
        }
        Ok(sequence)
    }
}

// ---------------------------------------------------------------------------
// Reference hooks
// ---------------------------------------------------------------------------

/// Records the primary tensor of one `(module, phase)` event.
pub struct Capture {
    pub module: String,
    pub phase: HookPhase,
    pub captured: Option<Tensor>,
}

impl Capture {
    pub fn new(module: &str, phase: HookPhase) -> Self {
        Self {
            module: module.to_owned(),
            phase,
            captured: None,
        }
    }
}

impl ModuleHooks for Capture {
    fn fire(&mut self, module: &str, phase: HookPhase, mut args: HookArgs<'_>) -> Result<()> {
        if module == self.module && phase == self.phase {
            self.captured = Some(args.primary_mut()?.clone());
        }
        Ok(())
    }
}

/// Overwrites `rows[b]`'s position with `values[b]` in a `[batch, seq, d]`
/// output of `module`.
pub struct Splice {
    pub module: String,
    pub positions: Vec<usize>,
    pub values: Tensor,
}

impl ModuleHooks for Splice {
    fn fire(&mut self, module: &str, phase: HookPhase, mut args: HookArgs<'_>) -> Result<()> {
        if module != self.module || phase != HookPhase::Post {
            return Ok(());
        }
        let out = args.primary_mut()?;
        let mut rows = Vec::new();
        for (b, &pos) in self.positions.iter().enumerate() {
            let row = out.get(b)?;
            let seq = row.dim(0)?;
            let value = self.values.get(b)?.unsqueeze(0)?;
            let mut parts = Vec::new();
            if pos > 0 {
                parts.push(row.narrow(0, 0, pos)?);
            }
            parts.push(value);
            if pos + 1 < seq {
                parts.push(row.narrow(0, pos + 1, seq - pos - 1)?);
            }
            rows.push(Tensor::cat(&parts, 0)?);
        }
        *out = Tensor::stack(&rows, 0)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tensor helpers
// ---------------------------------------------------------------------------

pub fn ids(rows: &[&[u32]]) -> Tensor {
    let seq = rows[0].len();
    let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Tensor::from_vec(flat, (rows.len(), seq), &Device::Cpu).unwrap()
}

pub fn inputs(rows: &[&[u32]]) -> ModelInputs {
    ModelInputs::from_input_ids(ids(rows))
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

/// Largest absolute difference within batch row `b`.
pub fn row_diff(a: &Tensor, b_tensor: &Tensor, b: usize) -> f32 {
    max_abs_diff(&a.get(b).unwrap(), &b_tensor.get(b).unwrap())
}
