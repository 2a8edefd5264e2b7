// SPDX-License-Identifier: MIT OR Apache-2.0

//! Alignment search: training and evaluating intervention parameters.
//!
//! [`AlignableModel::find_alignment`] optimises the trainable transforms
//! so that counterfactual outputs match the labels of a causal model,
//! using `AdamW` (no weight decay) with a linear warm-up/decay schedule
//! and a linear temperature schedule for boundary-learning transforms.
//! The backend's own weights are never handed to the optimiser.

use std::collections::BTreeMap;

use candle_core::{D, DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::{debug, info};

use crate::alignable::{AlignableModel, InterventionRequest};
use crate::backend::{AlignableBackend, ModelInputs};
use crate::error::{AlignError, Result};
use crate::locations::BatchIndices;

// ---------------------------------------------------------------------------
// Batches and arguments
// ---------------------------------------------------------------------------

/// One labelled batch of base/source pairs.
#[derive(Debug, Clone)]
pub struct AlignmentBatch {
    /// Base token ids, `[batch, seq]`.
    pub input_ids: Tensor,
    /// Source token ids, `[batch, seq]`; used for every intervention point.
    pub source_input_ids: Tensor,
    /// Counterfactual labels, in whatever form the loss expects.
    pub labels: Tensor,
    /// Flat unit locations, e.g. `"source_0->base.1.pos" -> [[2], [3]]`.
    pub locations: BTreeMap<String, BatchIndices>,
}

impl AlignmentBatch {
    /// Number of examples.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if `input_ids` is not rank 2.
    pub fn batch_size(&self) -> Result<usize> {
        let (batch, _) = self
            .input_ids
            .dims2()
            .map_err(|_| AlignError::Config("batch 'input_ids' must be [batch, seq]".into()))?;
        Ok(batch)
    }
}

/// Rewrites a batch before it is used.
pub type Collator<'a> = dyn Fn(&AlignmentBatch) -> Result<AlignmentBatch> + 'a;

/// Optimisation settings of [`AlignableModel::find_alignment`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingArgs {
    /// Peak learning rate.
    pub lr: f64,
    /// Passes over the batches.
    pub epochs: usize,
    /// Fraction of optimiser steps spent warming up.
    pub warm_up_ratio: f64,
    /// Batches per optimiser step.
    pub gradient_accumulation_steps: usize,
    /// Temperature at the first batch.
    pub temperature_start: f64,
    /// Temperature at the last batch.
    pub temperature_end: f64,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            epochs: 10,
            warm_up_ratio: 0.1,
            gradient_accumulation_steps: 1,
            temperature_start: 50.0,
            temperature_end: 0.1,
        }
    }
}

/// What a training run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    /// Optimiser updates applied.
    pub optimizer_steps: usize,
    /// Unscaled loss of every batch, in order.
    pub loss_history: Vec<f64>,
    /// Metrics of the last batch.
    pub last_metrics: BTreeMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// Linear warm-up to the peak, then linear decay to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearWarmupSchedule {
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearWarmupSchedule {
    /// Schedule over `total_steps` updates, the first `warmup_steps` of
    /// which ramp up.
    #[must_use]
    pub const fn new(warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            warmup_steps,
            total_steps,
        }
    }

    /// Multiplier of the peak learning rate at update `step` (0-based).
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn factor(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let decay = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        (remaining / decay).max(0.0)
    }
}

/// `count` evenly spaced values from `start` to `end`, inclusive.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            (0..count).map(|i| step.mul_add(i as f64, start)).collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Training and evaluation
// ---------------------------------------------------------------------------

impl<B: AlignableBackend> AlignableModel<B> {
    /// Train the intervention parameters on `batches`.
    ///
    /// Every batch runs a counterfactual forward pass with
    /// `source_input_ids` as the source of every point.  `compute_loss`
    /// maps `(logits, labels)` to a scalar; `compute_metrics` maps lists
    /// of logits and labels to named metrics for logging.  `collator`, if
    /// given, rewrites each batch first.
    ///
    /// Losses are scaled by `1 / gradient_accumulation_steps` and summed;
    /// an update is applied only once a full accumulation window has been
    /// seen, so a trailing partial window is dropped.  After each update
    /// the transforms restore their parameter constraints (rotations are
    /// re-orthonormalised) and the temperature of batch-indexed `linspace(start, end, total)` is
    /// forwarded to every transform.
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::Config`] if there is nothing to train or the
    /// arguments are degenerate, and propagates forward, loss and
    /// optimiser errors.
    pub fn find_alignment<L, M>(
        &mut self,
        batches: &[AlignmentBatch],
        compute_loss: L,
        compute_metrics: M,
        collator: Option<&Collator<'_>>,
        args: &TrainingArgs,
    ) -> Result<TrainingReport>
    where
        L: Fn(&Tensor, &Tensor) -> Result<Tensor>,
        M: Fn(&[Tensor], &[Tensor]) -> Result<BTreeMap<String, f64>>,
    {
        let accumulation = args.gradient_accumulation_steps;
        if accumulation == 0 {
            return Err(AlignError::Config(
                "gradient_accumulation_steps must be at least 1".into(),
            ));
        }
        let vars = self.trainable_vars();
        if vars.is_empty() {
            return Err(AlignError::Config(
                "no trainable intervention parameters".into(),
            ));
        }

        let total_batches = batches.len() * args.epochs;
        let total_updates = total_batches / accumulation;
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss,
            clippy::as_conversions
        )]
        let warmup = (args.warm_up_ratio * total_updates as f64) as usize;
        let schedule = LinearWarmupSchedule::new(warmup, total_updates);
        let temperatures = linspace(args.temperature_start, args.temperature_end, total_batches);

        let mut optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: args.lr * schedule.factor(0),
                weight_decay: 0.0,
                ..ParamsAdamW::default()
            },
        )?;
        info!(
            batches = batches.len(),
            epochs = args.epochs,
            total_updates,
            warmup,
            parameters = self.count_parameters(),
            "find_alignment started"
        );

        let mut report = TrainingReport::default();
        let mut pending: Option<Tensor> = None;
        let mut total_step = 0usize;
        for epoch in 0..args.epochs {
            for raw in batches {
                let collated;
                let batch = match collator {
                    Some(collate) => {
                        collated = collate(raw)?;
                        &collated
                    }
                    None => raw,
                };

                let logits = self.counterfactual_logits(batch)?;
                report.last_metrics =
                    compute_metrics(std::slice::from_ref(&logits), std::slice::from_ref(&batch.labels))?;
                let loss = compute_loss(&logits, &batch.labels)?;
                let loss_value = scalar(&loss)?;
                report.loss_history.push(loss_value);
                debug!(epoch, step = total_step, loss = loss_value, "batch done");

                #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
                let scaled = if accumulation > 1 {
                    loss.affine(1.0 / accumulation as f64, 0.0)?
                } else {
                    loss
                };
                let window = match pending.take() {
                    Some(sum) => (sum + scaled)?,
                    None => scaled,
                };

                if (total_step + 1) % accumulation == 0 {
                    let lr = args.lr * schedule.factor(report.optimizer_steps);
                    optimizer.set_learning_rate(lr);
                    optimizer.backward_step(&window)?;
                    self.restore_constraints()?;
                    report.optimizer_steps += 1;
                    self.set_zero_grad();
                    let temperature = temperatures
                        .get(total_step)
                        .copied()
                        .unwrap_or(args.temperature_end);
                    self.set_temperature(temperature);
                    info!(
                        epoch,
                        step = report.optimizer_steps,
                        loss = loss_value,
                        lr,
                        temperature,
                        "optimizer step"
                    );
                } else {
                    pending = Some(window);
                }
                total_step += 1;
            }
        }
        Ok(report)
    }

    /// Batch-size-weighted average of `compute_metrics` over `batches`.
    ///
    /// Counterfactual logits are detached before they reach the metrics.
    ///
    /// # Errors
    ///
    /// Propagates forward and metric errors.
    pub fn evaluate_alignment<M>(
        &mut self,
        batches: &[AlignmentBatch],
        compute_metrics: M,
        collator: Option<&Collator<'_>>,
    ) -> Result<BTreeMap<String, f64>>
    where
        M: Fn(&[Tensor], &[Tensor]) -> Result<BTreeMap<String, f64>>,
    {
        let mut all_metrics = Vec::with_capacity(batches.len());
        for raw in batches {
            let collated;
            let batch = match collator {
                Some(collate) => {
                    collated = collate(raw)?;
                    &collated
                }
                None => raw,
            };
            let logits = self.counterfactual_logits(batch)?.detach();
            let metrics =
                compute_metrics(std::slice::from_ref(&logits), std::slice::from_ref(&batch.labels))?;
            all_metrics.push((metrics, batch.batch_size()?));
        }
        Ok(weighted_average(&all_metrics))
    }

    fn counterfactual_logits(&mut self, batch: &AlignmentBatch) -> Result<Tensor> {
        let locations = self.unit_locations_from_flat(&batch.locations)?;
        let source = ModelInputs::from_input_ids(batch.source_input_ids.clone());
        let request = InterventionRequest::new()
            .with_sources(vec![source; self.points().len()])
            .with_unit_locations(locations);
        let base = ModelInputs::from_input_ids(batch.input_ids.clone());
        let (_, counterfactual) = self.forward(&base, &request)?;
        counterfactual
            .map(|out| out.logits)
            .ok_or_else(|| AlignError::State("counterfactual run produced no output".into()))
    }
}

// ---------------------------------------------------------------------------
// Metric helpers
// ---------------------------------------------------------------------------

/// Per-key average of `metrics`, weighted by the attached example counts.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub fn weighted_average(metrics: &[(BTreeMap<String, f64>, usize)]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for (values, count) in metrics {
        let weight = *count as f64;
        for (name, value) in values {
            let entry = sums.entry(name.clone()).or_insert((0.0, 0.0));
            entry.0 += value * weight;
            entry.1 += weight;
        }
    }
    sums.into_iter()
        .filter(|(_, (_, weight))| *weight > 0.0)
        .map(|(name, (total, weight))| (name, total / weight))
        .collect()
}

/// Cross-entropy of the last position's logits against one label per row.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - `labels`: `[batch]` of `u32`
/// - returns: scalar
///
/// # Errors
///
/// Returns [`AlignError::Model`] on shape mismatch.
pub fn last_position_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let last = last_position(logits)?;
    Ok(candle_nn::loss::cross_entropy(&last.to_dtype(DType::F32)?, labels)?)
}

/// Fraction of rows whose last-position argmax equals the label, as
/// `{"accuracy": ...}`.
///
/// # Errors
///
/// Returns [`AlignError::Model`] on shape mismatch.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub fn last_position_accuracy(
    logits: &[Tensor],
    labels: &[Tensor],
) -> Result<BTreeMap<String, f64>> {
    let mut correct = 0usize;
    let mut total = 0usize;
    for (logits, labels) in logits.iter().zip(labels) {
        let predicted: Vec<u32> = last_position(logits)?.argmax(D::Minus1)?.to_vec1()?;
        let expected: Vec<u32> = labels.to_dtype(DType::U32)?.to_vec1()?;
        correct += predicted
            .iter()
            .zip(&expected)
            .filter(|(p, e)| p == e)
            .count();
        total += expected.len();
    }
    let accuracy = if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    };
    Ok(BTreeMap::from([("accuracy".to_owned(), accuracy)]))
}

fn last_position(logits: &Tensor) -> Result<Tensor> {
    let (_, seq, _) = logits.dims3()?;
    let last = seq
        .checked_sub(1)
        .ok_or_else(|| AlignError::Location("logits have an empty sequence".into()))?;
    Ok(logits.narrow(1, last, 1)?.squeeze(1)?)
}

fn scalar(loss: &Tensor) -> Result<f64> {
    Ok(f64::from(
        loss.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
