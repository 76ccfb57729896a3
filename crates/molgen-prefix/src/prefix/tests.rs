use ndarray::{Array1, Array2};

use super::*;
use crate::linear_layer::LinearLayer;
use crate::weights::test_util::write_safetensors;
use crate::weights::{ParamStore, SafeTensorsLoader};

fn random_assembler(geometry: PrefixGeometry, seed: u64) -> PromptAssembler {
    let mut store = ParamStore::random(seed);
    PromptAssembler::from_store(&mut store, geometry).unwrap()
}

/// A path whose projector ignores its input and emits `0, 1, 2, ...`.
fn counting_path(g: &PrefixGeometry) -> PrefixPath {
    let width = g.projected_width();
    let embedding = PrefixEmbedding::new(Array2::zeros((g.preseqlen, g.d_model)));
    let fc1 = LinearLayer::new_f32(Array2::zeros((g.mid_dim, g.d_model)), None).unwrap();
    let fc2 = LinearLayer::new_f32(
        Array2::zeros((width, g.mid_dim)),
        Some(Array1::from_iter((0..width).map(|v| v as f32))),
    )
    .unwrap();
    PrefixPath::new(embedding, PrefixProjector::new(fc1, fc2))
}

#[test]
fn test_scenario_shapes() {
    let geometry = PrefixGeometry::new(2, 4, 16, 4, 8).unwrap();
    assert_eq!(geometry.head_dim, 4);

    let bundle = random_assembler(geometry, 0).assemble(BatchLayout::new(2, 3)).unwrap();
    assert_eq!(bundle.len(), 2);
    for layer in bundle.iter() {
        assert_eq!(layer.decoder_prompt.prev_key.dim(), (6, 4, 4, 4));
        assert_eq!(layer.decoder_prompt.prev_value.dim(), (6, 4, 4, 4));
        assert_eq!(layer.cross_attention_prompt.prev_key.dim(), (6, 4, 4, 4));
        assert_eq!(layer.encoder_prompt.prev_key.dim(), (2, 4, 4, 4));
        assert_eq!(layer.encoder_prompt.prev_value.dim(), (2, 4, 4, 4));
        assert_eq!(layer.decoder_prompt.prev_key_padding_mask.dim(), (6, 4));
        assert_eq!(layer.encoder_prompt.prev_key_padding_mask.dim(), (2, 4));
    }
    bundle.check(2).unwrap();
}

#[test]
fn test_assemble_is_deterministic() {
    let geometry = PrefixGeometry::new(3, 2, 8, 5, 6).unwrap();
    let assembler = random_assembler(geometry, 11);
    let layout = BatchLayout::new(3, 2);
    assert_eq!(assembler.assemble(layout).unwrap(), assembler.assemble(layout).unwrap());
}

#[test]
fn test_padding_masks_are_all_false() {
    let geometry = PrefixGeometry::new(2, 2, 4, 3, 4).unwrap();
    let bundle = random_assembler(geometry, 5).assemble(BatchLayout::new(2, 4)).unwrap();
    for layer in bundle.iter() {
        for kind in PromptKind::ALL {
            let slice = layer.slice(kind);
            assert!(slice.prev_key_padding_mask.iter().all(|&m| !m));
            assert!(slice.attention_mask().iter().all(|&m| m == 1.0));
        }
    }
}

#[test]
fn test_rows_are_identical_across_batch() {
    let geometry = PrefixGeometry::new(1, 2, 4, 3, 4).unwrap();
    let bundle = random_assembler(geometry, 9).assemble(BatchLayout::new(1, 3)).unwrap();
    let key = &bundle.layers[0].decoder_prompt.prev_key;
    for b in 1..3 {
        assert_eq!(key.index_axis(ndarray::Axis(0), 0), key.index_axis(ndarray::Axis(0), b));
    }
}

#[test]
fn test_key_value_split_is_layer_major() {
    let g = PrefixGeometry::new(2, 2, 6, 2, 3).unwrap();
    let assembler =
        PromptAssembler::new(g, counting_path(&g), counting_path(&g), counting_path(&g)).unwrap();
    let bundle = assembler.assemble(BatchLayout::new(1, 1)).unwrap();

    // projected index = ((row * heads) + h) * head_dim + d, with row 2i for keys, 2i+1 for values
    for (i, layer) in bundle.iter().enumerate() {
        let key = &layer.decoder_prompt.prev_key;
        let value = &layer.decoder_prompt.prev_value;
        for h in 0..g.num_heads {
            for l in 0..g.preseqlen {
                for d in 0..g.head_dim {
                    let k_expected = ((2 * i * g.num_heads + h) * g.head_dim + d) as f32;
                    let v_expected = (((2 * i + 1) * g.num_heads + h) * g.head_dim + d) as f32;
                    assert_eq!(key[[0, h, l, d]], k_expected);
                    assert_eq!(value[[0, h, l, d]], v_expected);
                }
            }
        }
    }
}

#[test]
fn test_paths_are_independent() {
    let geometry = PrefixGeometry::new(1, 2, 4, 2, 4).unwrap();
    let bundle = random_assembler(geometry, 21).assemble(BatchLayout::new(1, 1)).unwrap();
    let layer = &bundle.layers[0];
    assert_ne!(layer.decoder_prompt.prev_key, layer.cross_attention_prompt.prev_key);
    assert_ne!(layer.decoder_prompt.prev_key, layer.encoder_prompt.prev_key);
}

#[test]
fn test_head_geometry_is_checked() {
    let err = PrefixGeometry::new(2, 3, 16, 4, 8).unwrap_err();
    assert!(matches!(err, PrefixError::HeadGeometry { .. }));
    assert!(matches!(
        PrefixGeometry::new(2, 4, 16, 0, 8),
        Err(PrefixError::EmptyPrefix)
    ));
}

#[test]
fn test_projector_width_mismatch_is_fatal() {
    let g = PrefixGeometry::new(2, 2, 4, 2, 3).unwrap();
    let narrow = PrefixGeometry::new(1, 2, 4, 2, 3).unwrap();
    let err = PromptAssembler::new(g, counting_path(&narrow), counting_path(&g), counting_path(&g))
        .unwrap_err();
    assert!(matches!(err, PrefixError::ProjectorWidth { path: "decoder", .. }));
}

#[test]
fn test_bundle_check_rejects_wrong_layer_count() {
    let geometry = PrefixGeometry::new(2, 2, 4, 2, 4).unwrap();
    let bundle = random_assembler(geometry, 1).assemble(BatchLayout::new(1, 2)).unwrap();
    assert!(matches!(
        bundle.check(3),
        Err(PrefixError::LayerCount { expected: 3, actual: 2 })
    ));
}

#[test]
fn test_checkpoint_prefix_is_loaded() {
    let g = PrefixGeometry::new(1, 1, 2, 2, 2).unwrap();
    let width = g.projected_width();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    write_safetensors(
        &path,
        &[
            ("prefix.encoder.projector.fc2.weight", vec![0.0; width * g.mid_dim], vec![width, g.mid_dim]),
            ("prefix.encoder.projector.fc2.bias", vec![7.0; width], vec![width]),
            ("model.shared.weight", vec![0.0; 4], vec![2, 2]),
        ],
    )
    .unwrap();

    let mut store = ParamStore::new(Some(SafeTensorsLoader::new(&path).unwrap()), 0);
    let assembler = PromptAssembler::from_store(&mut store, g).unwrap();
    let bundle = assembler.assemble(BatchLayout::new(2, 1)).unwrap();
    assert!(bundle.layers[0].encoder_prompt.prev_key.iter().all(|&v| v == 7.0));

    let report = store.report();
    assert_eq!(report.loaded, 2);
    assert_eq!(report.unexpected, vec!["model.shared.weight".to_string()]);
}
