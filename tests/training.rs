// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: alignment search and evaluation.
//!
//! Run with:
//!   `cargo test --test training`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp,
    missing_docs
)]

mod common;

use std::cell::Cell;
use std::collections::BTreeMap;

use candle_align::{
    AlignError, AlignableConfig, AlignableModel, AlignmentBatch, Collator, Intervention,
    InterventionType, Mode, RepresentationDescriptor, RepresentationKind, Subspace, TrainingArgs,
    last_position_accuracy, last_position_cross_entropy,
};
use candle_core::{D, Device, Tensor};

use common::{HIDDEN, TinyGpt2, ids, max_abs_diff};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn model(ty: InterventionType, rep: RepresentationDescriptor) -> AlignableModel<TinyGpt2> {
    let config = AlignableConfig::new(Mode::Parallel, vec![rep]).with_intervention_type(ty);
    AlignableModel::new(&config, TinyGpt2::new()).unwrap()
}

fn block_output(layer: usize) -> RepresentationDescriptor {
    RepresentationDescriptor::new(layer, RepresentationKind::BlockOutput, "pos", 1)
}

fn batch(base: [&[u32]; 2], source: [&[u32]; 2], labels: [u32; 2]) -> AlignmentBatch {
    let locations = BTreeMap::from([
        ("source_0->base.0.pos".to_owned(), vec![vec![0], vec![0]]),
        ("source_0->base.1.pos".to_owned(), vec![vec![3], vec![3]]),
    ]);
    AlignmentBatch {
        input_ids: ids(&base),
        source_input_ids: ids(&source),
        labels: Tensor::new(&labels, &Device::Cpu).unwrap(),
        locations,
    }
}

fn batches() -> Vec<AlignmentBatch> {
    vec![
        batch([&[1, 2, 3, 4], &[5, 6, 7, 8]], [&[9, 10, 11, 12], &[13, 14, 15, 16]], [3, 7]),
        batch([&[17, 18, 19, 20], &[21, 22, 23, 24]], [&[25, 26, 27, 28], &[29, 30, 31, 0]], [11, 2]),
    ]
}

fn snapshot(vars: &[candle_core::Var]) -> Vec<Vec<f32>> {
    vars.iter()
        .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
        .collect()
}

fn changed(before: &[Vec<f32>], after: &[Vec<f32>]) -> bool {
    before
        .iter()
        .zip(after)
        .any(|(a, b)| a.iter().zip(b).any(|(x, y)| (x - y).abs() > 1e-7))
}

fn args(epochs: usize, accumulation: usize) -> TrainingArgs {
    TrainingArgs {
        lr: 1e-2,
        epochs,
        gradient_accumulation_steps: accumulation,
        ..TrainingArgs::default()
    }
}

// ---------------------------------------------------------------------------
// find_alignment
// ---------------------------------------------------------------------------

#[test]
fn trains_only_intervention_parameters() {
    let mut m = model(InterventionType::BoundlessRotatedSpace, block_output(1));
    assert_eq!(m.count_parameters(), HIDDEN * HIDDEN + 2);

    let trainable_before = snapshot(&m.trainable_vars());
    let weights_before = snapshot(&m.backend().weights());

    let report = m
        .find_alignment(
            &batches(),
            last_position_cross_entropy,
            last_position_accuracy,
            None,
            &args(2, 1),
        )
        .unwrap();

    assert_eq!(report.optimizer_steps, 4);
    assert_eq!(report.loss_history.len(), 4);
    assert!(report.loss_history.iter().all(|l| l.is_finite()));
    assert!(report.last_metrics.contains_key("accuracy"));

    assert!(changed(&trainable_before, &snapshot(&m.trainable_vars())));
    assert!(!changed(&weights_before, &snapshot(&m.backend().weights())));
}

#[test]
fn trained_rotations_stay_orthonormal() {
    let x = Tensor::randn(0f32, 3.0, (2, 1, HIDDEN), &Device::Cpu).unwrap();
    let first_feature = Subspace::shared(vec![0]).resolve(None).unwrap();
    for (ty, rep) in [
        (InterventionType::RotatedSpace, block_output(2)),
        (InterventionType::BoundlessRotatedSpace, block_output(2)),
        (
            InterventionType::LowRankRotatedSpace,
            block_output(2).with_low_rank_dimension(4),
        ),
    ] {
        let mut m = model(ty, rep);
        let before = snapshot(&m.trainable_vars());
        let report = m
            .find_alignment(
                &batches(),
                last_position_cross_entropy,
                last_position_accuracy,
                None,
                &TrainingArgs {
                    lr: 0.1,
                    epochs: 5,
                    ..TrainingArgs::default()
                },
            )
            .unwrap();
        assert_eq!(report.optimizer_steps, 10);
        assert!(changed(&before, &snapshot(&m.trainable_vars())), "{ty} did not train");

        // interchanging a slice with itself must not touch any feature
        let transform = m.points()[0].intervention();
        let same = transform.intervene(&x, &x, Some(&first_feature)).unwrap();
        assert!(max_abs_diff(&same, &x) < 1e-3, "{ty} leaked outside the subspace");
    }
}

#[test]
fn partial_accumulation_window_is_dropped() {
    let mut m = model(InterventionType::RotatedSpace, block_output(2));
    let mut four = batches();
    four.extend(batches());

    let report = m
        .find_alignment(
            &four,
            last_position_cross_entropy,
            last_position_accuracy,
            None,
            &args(1, 3),
        )
        .unwrap();
    assert_eq!(report.optimizer_steps, 1);
    assert_eq!(report.loss_history.len(), 4);
}

#[test]
fn fixed_transforms_have_nothing_to_train() {
    let mut m = model(InterventionType::Vanilla, block_output(1));
    let err = m
        .find_alignment(
            &batches(),
            last_position_cross_entropy,
            last_position_accuracy,
            None,
            &args(1, 1),
        )
        .unwrap_err();
    assert!(matches!(err, AlignError::Config(_)));

    let mut m = model(InterventionType::RotatedSpace, block_output(1));
    let err = m
        .find_alignment(
            &batches(),
            last_position_cross_entropy,
            last_position_accuracy,
            None,
            &args(1, 0),
        )
        .unwrap_err();
    assert!(matches!(err, AlignError::Config(_)));
}

#[test]
fn frozen_transforms_are_not_trained() {
    let mut m = model(InterventionType::RotatedSpace, block_output(1));
    m.disable_intervention_gradients();
    assert!(m.trainable_vars().is_empty());
    assert!(
        m.find_alignment(
            &batches(),
            last_position_cross_entropy,
            last_position_accuracy,
            None,
            &args(1, 1),
        )
        .is_err()
    );
    m.enable_intervention_gradients();
    assert_eq!(m.trainable_vars().len(), 1);
}

#[test]
fn collator_rewrites_every_batch() {
    let mut m = model(
        InterventionType::LowRankRotatedSpace,
        block_output(0).with_low_rank_dimension(2),
    );
    assert_eq!(m.count_parameters(), HIDDEN * 2);

    let calls = Cell::new(0usize);
    let collate: &Collator<'_> = &|b| {
        calls.set(calls.get() + 1);
        let mut b = b.clone();
        b.labels = Tensor::new(&[0u32, 0], &Device::Cpu)?;
        Ok(b)
    };
    let report = m
        .find_alignment(
            &batches(),
            last_position_cross_entropy,
            last_position_accuracy,
            Some(collate),
            &args(3, 2),
        )
        .unwrap();
    assert_eq!(calls.get(), 6);
    assert_eq!(report.optimizer_steps, 3);
}

// ---------------------------------------------------------------------------
// evaluate_alignment
// ---------------------------------------------------------------------------

#[test]
fn evaluation_averages_accuracy() {
    let mut m = model(InterventionType::RotatedSpace, block_output(3));
    let metrics = m
        .evaluate_alignment(&batches(), last_position_accuracy, None)
        .unwrap();
    let accuracy = metrics["accuracy"];
    assert!((0.0..=1.0).contains(&accuracy));

    // labels set to the model's own counterfactual predictions score 1.0
    let mut relabelled = batches();
    for b in &mut relabelled {
        let single = std::slice::from_ref(b);
        let argmax_per_row = |logits: &[Tensor], _: &[Tensor]| -> candle_align::Result<BTreeMap<String, f64>> {
            let (_, seq, _) = logits[0].dims3()?;
            let last = logits[0].narrow(1, seq - 1, 1)?.squeeze(1)?;
            let ids: Vec<u32> = last.argmax(D::Minus1)?.to_vec1()?;
            Ok(ids
                .iter()
                .enumerate()
                .map(|(i, &id)| (format!("row{i}"), f64::from(id)))
                .collect())
        };
        let predicted = m.evaluate_alignment(single, argmax_per_row, None).unwrap();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::as_conversions)]
        let labels = [predicted["row0"] as u32, predicted["row1"] as u32];
        b.labels = Tensor::new(&labels, &Device::Cpu).unwrap();
    }
    let perfect = m
        .evaluate_alignment(&relabelled, last_position_accuracy, None)
        .unwrap();
    assert_eq!(perfect["accuracy"], 1.0);
}
