// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: counterfactual generation with step-gated edits.
//!
//! Run with:
//!   `cargo test --test generation`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    missing_docs
)]

mod common;

use candle_align::{
    AlignableBackend, AlignableConfig, AlignableModel, GenerationOptions, InterventionRequest,
    LocationPair, Mode, ModelInputs, NoHooks, RepresentationDescriptor, RepresentationKind,
    UnitLocation, UnitLocations, next_tokens,
};
use candle_core::{D, Tensor};

use common::{TinyGpt2, ids, inputs};

const PROMPT: [&[u32]; 2] = [&[1, 2, 3, 4, 5], &[6, 7, 8, 9, 10]];
const SOURCE: [&[u32]; 2] = [&[11, 12, 13, 14, 15], &[16, 17, 18, 19, 20]];
const OTHER_SOURCE: [&[u32]; 2] = [&[21, 22, 23, 24, 25], &[26, 27, 28, 29, 30]];

fn block_output(layer: usize) -> RepresentationDescriptor {
    RepresentationDescriptor::new(layer, RepresentationKind::BlockOutput, "pos", 1)
}

fn swap_model() -> AlignableModel<TinyGpt2> {
    let config = AlignableConfig::new(Mode::Parallel, vec![block_output(2)]);
    AlignableModel::new(&config, TinyGpt2::new()).unwrap()
}

fn at(per_row: &[usize]) -> UnitLocation {
    UnitLocation::single(per_row.iter().map(|&p| vec![p]).collect())
}

fn swap_request() -> InterventionRequest {
    InterventionRequest::new()
        .with_sources(vec![inputs(&SOURCE)])
        .with_unit_locations(UnitLocations::parallel(
            vec![UnitLocation::single(vec![vec![4], vec![4]])],
            vec![UnitLocation::single(vec![vec![4], vec![4]])],
        ))
}

fn greedy(max_new_tokens: usize) -> GenerationOptions {
    GenerationOptions {
        max_new_tokens,
        ..GenerationOptions::default()
    }
}

fn tokens(t: &Tensor) -> Vec<Vec<u32>> {
    t.to_vec2().unwrap()
}

#[test]
fn edit_applies_to_prompt_only() {
    let mut m = swap_model();
    let prompt = ids(&PROMPT);
    let (base, cf) = m.generate(&prompt, &swap_request(), true, &greedy(4)).unwrap();
    let cf = cf.unwrap();
    assert_eq!(base.dims(), &[2, 9]);
    assert_eq!(cf.dims(), &[2, 9]);

    let plain = m.backend().generate(&prompt, &greedy(4), &mut NoHooks).unwrap();
    assert_eq!(tokens(&base), tokens(&plain));

    // the first new token comes from the edited prompt pass
    let (_, forward_cf) = m.forward(&inputs(&PROMPT), &swap_request()).unwrap();
    let first = next_tokens(&forward_cf.unwrap().logits, 0.0).unwrap();
    assert_eq!(tokens(&cf.narrow(D::Minus1, 5, 1).unwrap()), tokens(&first));

    // later steps see the extended sequence without any edit
    let extended = cf.narrow(D::Minus1, 0, 6).unwrap();
    let rest = m.backend().generate(&extended, &greedy(3), &mut NoHooks).unwrap();
    assert_eq!(tokens(&cf), tokens(&rest));
}

#[test]
fn decode_step_edits_skip_the_prompt() {
    let mut m = swap_model();
    let prompt = ids(&PROMPT);
    let (base, cf) = m.generate(&prompt, &swap_request(), false, &greedy(3)).unwrap();
    let cf = cf.unwrap();
    assert_eq!(cf.dims(), &[2, 8]);

    // the prompt pass runs unedited, so the first new token is the plain one
    let first = |t: &Tensor| tokens(&t.narrow(D::Minus1, 0, 6).unwrap());
    assert_eq!(first(&cf), first(&base));

    // every later step re-runs the grown sequence with the edit applied
    for step in 6..8 {
        let prefix = ModelInputs::from_input_ids(cf.narrow(D::Minus1, 0, step).unwrap());
        let (_, edited) = m.forward(&prefix, &swap_request()).unwrap();
        let expected = next_tokens(&edited.unwrap().logits, 0.0).unwrap();
        assert_eq!(tokens(&cf.narrow(D::Minus1, step, 1).unwrap()), tokens(&expected));
    }
}

#[test]
fn serial_generation_chains_prompt_edits() {
    let config = AlignableConfig::new(Mode::Serial, vec![block_output(2), block_output(0)]);
    let mut m = AlignableModel::new(&config, TinyGpt2::new()).unwrap();
    let request = InterventionRequest::new()
        .with_sources(vec![inputs(&SOURCE), inputs(&OTHER_SOURCE)])
        .with_unit_locations(
            UnitLocations::new()
                .with(
                    "source_0->source_1",
                    LocationPair::single(at(&[0, 0]), at(&[1, 1])),
                )
                .with("source_1->base", LocationPair::single(at(&[1, 1]), at(&[4, 4]))),
        );
    let prompt = ids(&PROMPT);
    let (base, cf) = m.generate(&prompt, &request, true, &greedy(3)).unwrap();
    let cf = cf.unwrap();

    let plain = m.backend().generate(&prompt, &greedy(3), &mut NoHooks).unwrap();
    assert_eq!(tokens(&base), tokens(&plain));

    // the first new token comes from the serially edited prompt pass
    let (_, forward_cf) = m.forward(&inputs(&PROMPT), &request).unwrap();
    let expected = next_tokens(&forward_cf.unwrap().logits, 0.0).unwrap();
    assert_eq!(tokens(&cf.narrow(D::Minus1, 5, 1).unwrap()), tokens(&expected));

    // decode steps run without edits
    let extended = cf.narrow(D::Minus1, 0, 6).unwrap();
    let rest = m.backend().generate(&extended, &greedy(2), &mut NoHooks).unwrap();
    assert_eq!(tokens(&cf), tokens(&rest));
}

#[test]
fn pass_through_generation_returns_only_base() {
    let mut m = swap_model();
    let prompt = ids(&PROMPT);
    let (base, cf) = m
        .generate(&prompt, &InterventionRequest::new(), true, &greedy(3))
        .unwrap();
    assert!(cf.is_none());
    let plain = m.backend().generate(&prompt, &greedy(3), &mut NoHooks).unwrap();
    assert_eq!(tokens(&base), tokens(&plain));
}

#[test]
fn generation_leaves_no_hooks_behind() {
    let mut m = swap_model();
    let prompt = ids(&PROMPT);
    m.generate(&prompt, &swap_request(), true, &greedy(2)).unwrap();

    // a following plain forward must match the unhooked backend exactly
    let (out, _) = m.forward(&inputs(&PROMPT), &InterventionRequest::new()).unwrap();
    let direct = m.backend().logits(&prompt, &mut NoHooks).unwrap();
    assert_eq!(common::max_abs_diff(&out.logits, &direct), 0.0);
}
