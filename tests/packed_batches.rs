// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: packed (variable-length) batches must rotate exactly
//! like the valid tokens of the equivalent padded batch, for multi-head,
//! grouped-query, and multi-query key/value arrangements.
//!
//! Run:
//!   `cargo test --test packed_batches`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::missing_docs_in_private_items,
    clippy::missing_panics_doc,
    missing_docs
)]

use candle_core::{Device, IndexOp, Tensor};
use candle_rotary::{
    Offsets, PackedSequenceMeta, RopeConfig, RopeEngine, RopeError, RotaryLayout, RotateOptions,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const BATCH: usize = 8;
const HEAD_DIM: usize = 64;

fn random(rng: &mut StdRng, dims: &[usize]) -> Tensor {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Tensor::from_vec(data, dims, &Device::Cpu).unwrap()
}

fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

/// Concatenate the valid tokens of a padded `[batch, seqlen, ...]` tensor
/// into a packed `[total_tokens, ...]` one.
fn unpad(padded: &Tensor, lengths: &[usize]) -> Tensor {
    let runs: Vec<Tensor> = lengths
        .iter()
        .enumerate()
        .map(|(b, &len)| padded.i(b).unwrap().narrow(0, 0, len).unwrap())
        .collect();
    Tensor::cat(&runs, 0).unwrap().contiguous().unwrap()
}

/// Random lengths in `1..204` and offsets in `0..100`, one per sequence.
fn batch_shape(rng: &mut StdRng) -> (Vec<usize>, Vec<usize>) {
    let lengths = (0..BATCH).map(|_| rng.gen_range(1..204)).collect();
    let offsets = (0..BATCH).map(|_| rng.gen_range(0..100)).collect();
    (lengths, offsets)
}

// ---------------------------------------------------------------------------
// Packed vs padded
// ---------------------------------------------------------------------------

#[test]
fn packed_matches_padded_for_separate_kv() {
    let mut rng = StdRng::seed_from_u64(42);
    for heads_q in [16, 32] {
        // MHA, GQA, MQA
        for heads_kv in [heads_q, heads_q / 4, 1] {
            for layout in [RotaryLayout::PairedHalf, RotaryLayout::Interleaved] {
                let (lengths, offsets) = batch_shape(&mut rng);
                let seqlen = lengths.iter().copied().max().unwrap();
                let q = random(&mut rng, &[BATCH, seqlen, heads_q, HEAD_DIM]);
                let kv = random(&mut rng, &[BATCH, seqlen, 2, heads_kv, HEAD_DIM]);
                let packed_q = unpad(&q, &lengths);
                let packed_kv = unpad(&kv, &lengths);
                let meta = PackedSequenceMeta::from_lengths(&lengths);
                let offsets = Offsets::PerSequence(offsets);

                let config = RopeConfig::new(HEAD_DIM / 2).with_layout(layout);
                let mut padded_engine = RopeEngine::new(config).unwrap();
                let padded = padded_engine.rotate(&q, Some(&kv), &offsets, None).unwrap();
                let mut packed_engine = RopeEngine::new(config).unwrap();
                let packed = packed_engine
                    .rotate(&packed_q, Some(&packed_kv), &offsets, Some(&meta))
                    .unwrap();

                let label = format!("hq={heads_q} hkv={heads_kv} {layout}");
                assert_eq!(values(&unpad(&q, &lengths)), values(&packed_q), "q {label}");
                assert_eq!(values(&unpad(&kv, &lengths)), values(&packed_kv), "kv {label}");

                // Gradients: padded backward then unpad, vs packed backward.
                let grad_q = random(&mut rng, &[BATCH, seqlen, heads_q, HEAD_DIM]);
                let grad_kv = random(&mut rng, &[BATCH, seqlen, 2, heads_kv, HEAD_DIM]);
                let packed_grad_q = unpad(&grad_q, &lengths);
                let packed_grad_kv = unpad(&grad_kv, &lengths);
                padded_engine
                    .backward(&padded.context, &grad_q, Some(&grad_kv))
                    .unwrap();
                packed_engine
                    .backward(&packed.context, &packed_grad_q, Some(&packed_grad_kv))
                    .unwrap();
                assert_eq!(
                    values(&unpad(&grad_q, &lengths)),
                    values(&packed_grad_q),
                    "grad q {label}"
                );
                assert_eq!(
                    values(&unpad(&grad_kv, &lengths)),
                    values(&packed_grad_kv),
                    "grad kv {label}"
                );
            }
        }
    }
}

#[test]
fn packed_matches_padded_for_fused_qkv() {
    let mut rng = StdRng::seed_from_u64(7);
    for (heads_q, heads_kv) in [(16, 16), (16, 4), (32, 1)] {
        let (lengths, offsets) = batch_shape(&mut rng);
        let seqlen = lengths.iter().copied().max().unwrap();
        let heads = heads_q + 2 * heads_kv;
        let qkv = random(&mut rng, &[BATCH, seqlen, heads, HEAD_DIM]);
        let packed = unpad(&qkv, &lengths);
        let meta = PackedSequenceMeta::from_lengths(&lengths);
        let offsets = Offsets::PerSequence(offsets);
        let options = RotateOptions {
            num_heads_q: Some(heads_q),
            ..RotateOptions::default()
        };

        let mut padded_engine = RopeEngine::new(RopeConfig::new(HEAD_DIM)).unwrap();
        padded_engine
            .rotate_with_options(&qkv, None, &offsets, None, &options)
            .unwrap();
        let mut packed_engine = RopeEngine::new(RopeConfig::new(HEAD_DIM)).unwrap();
        packed_engine
            .rotate_with_options(&packed, None, &offsets, Some(&meta), &options)
            .unwrap();

        assert_eq!(
            values(&unpad(&qkv, &lengths)),
            values(&packed),
            "hq={heads_q} hkv={heads_kv}"
        );
    }
}

#[test]
fn packed_stacked_qkv_with_scalar_offset() {
    let mut rng = StdRng::seed_from_u64(99);
    let (lengths, _) = batch_shape(&mut rng);
    let seqlen = lengths.iter().copied().max().unwrap();
    let qkv = random(&mut rng, &[BATCH, seqlen, 3, 4, HEAD_DIM]);
    let packed = unpad(&qkv, &lengths);
    let meta = PackedSequenceMeta::from_lengths(&lengths);

    let mut padded_engine = RopeEngine::new(RopeConfig::new(HEAD_DIM)).unwrap();
    padded_engine.rotate(&qkv, None, &Offsets::Scalar(250), None).unwrap();
    let mut packed_engine = RopeEngine::new(RopeConfig::new(HEAD_DIM)).unwrap();
    packed_engine
        .rotate(&packed, None, &Offsets::Scalar(250), Some(&meta))
        .unwrap();

    assert_eq!(values(&unpad(&qkv, &lengths)), values(&packed));
    // The packed cache only needs to reach the longest sequence.
    assert!(packed_engine.cache().unwrap().len() >= 250 + meta.max_seqlen());
}

#[test]
fn empty_sequences_are_skipped() {
    let mut rng = StdRng::seed_from_u64(1);
    let lengths = [3, 0, 5];
    let packed = random(&mut rng, &[8, 2, HEAD_DIM]);
    let original = packed.copy().unwrap();
    let meta = PackedSequenceMeta::from_lengths(&lengths);
    let mut engine = RopeEngine::new(RopeConfig::new(HEAD_DIM)).unwrap();
    let rotated = engine
        .rotate(&packed, None, &Offsets::PerSequence(vec![0, 900, 0]), Some(&meta))
        .unwrap();

    // The third sequence starts again at position 0, like the first.
    let rows = values(rotated.context.cos());
    let half = HEAD_DIM / 2;
    assert_eq!(rows[..half], rows[3 * half..4 * half]);
    // No token needed position 900.
    assert!(engine.cache().unwrap().len() < 900);
    engine.backward(&rotated.context, &packed, None).unwrap();
    let diff = (&packed - &original).unwrap().abs().unwrap().max_keepdim(0).unwrap();
    assert!(values(&diff).iter().all(|d| *d < 1e-5));
}

#[test]
fn packed_total_must_match_tensor() {
    let meta = PackedSequenceMeta::new(vec![0, 4, 9], 5).unwrap();
    let packed = Tensor::zeros((10, 2, HEAD_DIM), candle_core::DType::F32, &Device::Cpu).unwrap();
    let mut engine = RopeEngine::new(RopeConfig::new(HEAD_DIM)).unwrap();
    let result = engine.rotate(&packed, None, &Offsets::Scalar(0), Some(&meta));
    assert!(matches!(result, Err(RopeError::ShapeMismatch(_))));
}

#[test]
fn packed_offsets_must_match_sequence_count() {
    let meta = PackedSequenceMeta::from_lengths(&[2, 2]);
    let packed = Tensor::zeros((4, 1, HEAD_DIM), candle_core::DType::F32, &Device::Cpu).unwrap();
    let mut engine = RopeEngine::new(RopeConfig::new(HEAD_DIM)).unwrap();
    let result = engine.rotate(&packed, None, &Offsets::PerSequence(vec![0, 1, 2]), Some(&meta));
    assert!(matches!(result, Err(RopeError::ShapeMismatch(_))));
}
