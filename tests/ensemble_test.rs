//! Capsule routing, native network persistence, and ensemble fusion tests


use deepfake_detection::capsule::{length, squash, CapsuleLayer};
use deepfake_detection::config::{Config, MemberConfig, ModelKind};
use deepfake_detection::fusion::{FusionEnsemble, WeightPolicy};
use deepfake_detection::network::{CapsNet, Network};
use deepfake_detection::Error;
use ndarray::{Array2, Array4, Axis};
use proptest::prelude::*;
use std::sync::Arc;
use test_helpers::{create_test_face, tiny_capsnet, tiny_capsnet_spec, ConstantNetwork};

fn face_batch(size: usize, count: usize) -> Array4<f32> {
    let face = create_test_face(size);
    let views: Vec<_> = (0..count).map(|_| face.view()).collect();
    ndarray::stack(Axis(0), &views).unwrap()
}

#[test]
fn test_routing_coupling_sums_every_iteration() {
    let weights = Array4::from_shape_fn((3, 5, 4, 2), |(j, i, o, d)| ((j + 2 * i + o + d) % 5) as f32 * 0.1 - 0.2);
    let layer = CapsuleLayer::new(weights, 4).unwrap();
    let inputs = Array2::from_shape_fn((5, 2), |(i, d)| (i as f32 - 2.0) * 0.3 + d as f32 * 0.1);

    let trace = layer.route_traced(inputs.view()).unwrap();
    assert_eq!(trace.steps.len(), 4);
    for step in &trace.steps {
        for column in step.coupling.axis_iter(Axis(1)) {
            assert!((column.sum() - 1.0).abs() < 1e-5);
        }
    }
    assert_eq!(trace.outputs().unwrap(), &layer.route(inputs.view()).unwrap());
}

#[test]
fn test_routing_rejects_pose_dimension_mismatch() {
    let layer = CapsuleLayer::with_default_routings(Array4::zeros((2, 3, 4, 4))).unwrap();
    assert!(layer.route(Array2::zeros((3, 5)).view()).is_err());
    assert!(layer.route(Array2::zeros((2, 4)).view()).is_err());
}

#[test]
fn test_length_of_squashed_vectors() {
    let poses = Array2::from_shape_vec((2, 2), vec![3.0, 4.0, 0.0, 0.0]).unwrap();
    let squashed = ndarray::stack(Axis(0), &[squash(poses.row(0)).view(), squash(poses.row(1)).view()]).unwrap();
    let lengths = length(squashed.view());
    assert!((lengths[0] - 25.0 / 26.0).abs() < 1e-5);
    assert_eq!(lengths[1], 0.0);
}

#[test]
fn test_native_network_roundtrip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("member.bin");
    let network = tiny_capsnet(12, 2, 7);
    network.save(&path).unwrap();

    let loaded = CapsNet::load(&path).unwrap();
    let batch = face_batch(12, 2);
    assert_eq!(loaded.predict(&batch).unwrap(), network.predict(&batch).unwrap());
}

#[test]
fn test_corrupt_network_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrupt.bin");
    std::fs::write(&path, b"not a network").unwrap();
    assert!(CapsNet::load(&path).is_err());
}

#[test]
fn test_fused_native_members() {
    let a = Arc::new(tiny_capsnet(12, 1, 1));
    let b = Arc::new(tiny_capsnet(12, 1, 2));
    let batch = face_batch(12, 3);

    let expected = a.predict(&batch).unwrap() * 0.6 + b.predict(&batch).unwrap() * 0.4;
    let ensemble = FusionEnsemble::new(vec![a, b], vec![0.6, 0.4], WeightPolicy::RequireUnitSum).unwrap();
    let fused = ensemble.predict(&batch).unwrap();

    assert_eq!(fused.dim(), (3, 1));
    for (f, e) in fused.iter().zip(expected.iter()) {
        assert!((f - e).abs() < 1e-6);
    }
}

#[test]
fn test_mismatched_native_members() {
    let ensemble = FusionEnsemble::new(
        vec![Arc::new(tiny_capsnet(12, 1, 1)), Arc::new(tiny_capsnet(12, 2, 2))],
        vec![0.5, 0.5],
        WeightPolicy::RequireUnitSum,
    )
    .unwrap();

    let err = ensemble.predict(&face_batch(12, 1)).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { member: 1, .. }));
    assert!(err.to_string().contains("member 1"));
}

#[test]
fn test_config_loads_ensemble_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.models.members = (0..2)
        .map(|seed| {
            let path = dir.path().join(format!("member_{seed}.bin"));
            CapsNet::new(tiny_capsnet_spec(12, 1, seed)).unwrap().save(&path).unwrap();
            MemberConfig {
                path,
                weight: 3.0,
                kind: ModelKind::Native,
                channels_first: false,
            }
        })
        .collect();

    assert!(config.load_ensemble().is_err());

    config.models.weight_policy = WeightPolicy::Normalize;
    let ensemble = config.load_ensemble().unwrap();
    assert_eq!(ensemble.weights(), &[0.5, 0.5]);
    assert_eq!(ensemble.attribution_member(), Some(0));
    assert_eq!(ensemble.predict(&face_batch(12, 2)).unwrap().dim(), (2, 1));
}

#[cfg(not(feature = "onnx"))]
#[test]
fn test_onnx_member_requires_feature() {
    let mut config = Config::default();
    config.models.members[0].kind = ModelKind::Onnx;
    assert!(matches!(config.load_ensemble(), Err(Error::ConfigError(_))));
}

proptest! {
    #[test]
    fn prop_fusion_is_weighted_mean(a in 0.0f32..1.0, b in 0.0f32..1.0, w in 0.0f32..1.0) {
        let ensemble = FusionEnsemble::new(
            vec![Arc::new(ConstantNetwork(vec![a])), Arc::new(ConstantNetwork(vec![b]))],
            vec![w, 1.0 - w],
            WeightPolicy::RequireUnitSum,
        )
        .unwrap();
        let fused = ensemble.predict(&Array4::zeros((1, 2, 2, 3))).unwrap()[[0, 0]];
        prop_assert!((fused - (w * a + (1.0 - w) * b)).abs() < 1e-5);
        prop_assert!(fused >= a.min(b) - 1e-5 && fused <= a.max(b) + 1e-5);
    }
}
