//! Saliency and perturbation explainer tests on small native networks


use deepfake_detection::explain::gradcam::resolve_attribution_layer;
use deepfake_detection::explain::{
    explain_frame, ExplainSettings, PerturbationExplainer, PerturbationSettings, SaliencyExplainer, SaliencySettings,
    SlicSettings,
};
use deepfake_detection::network::Network;
use deepfake_detection::render;
use test_helpers::{create_test_face, tiny_capsnet, ConstantNetwork};

fn quick_perturbation() -> PerturbationSettings {
    PerturbationSettings {
        num_samples: 60,
        batch_size: 16,
        segmentation: SlicSettings {
            num_segments: 9,
            ..SlicSettings::default()
        },
        ..PerturbationSettings::default()
    }
}

#[test]
fn test_attribution_layer_steps_back_to_spatial_map() {
    let network = tiny_capsnet(12, 2, 0);
    // -3 is the primary capsule layer, the pooled map precedes it
    assert_eq!(resolve_attribution_layer(&network, -3).unwrap(), 2);
    assert_eq!(resolve_attribution_layer(&network, 0).unwrap(), 0);
    assert!(resolve_attribution_layer(&network, 10).is_err());
}

#[test]
fn test_saliency_heatmap_range() {
    let network = tiny_capsnet(12, 2, 1);
    let face = create_test_face(12);
    let heatmap = SaliencyExplainer::new(SaliencySettings::default())
        .explain(&network, &face)
        .unwrap();

    assert_eq!(heatmap.dim(), (12, 12));
    assert!(heatmap.iter().all(|&v| (0.0..=1.0).contains(&v)));
    let max = heatmap.fold(0.0f32, |acc, &v| acc.max(v));
    assert!(max == 0.0 || (max - 1.0).abs() < 1e-6);
}

#[test]
fn test_saliency_through_ensemble_member() {
    use deepfake_detection::fusion::{FusionEnsemble, WeightPolicy};
    use std::sync::Arc;

    let ensemble = FusionEnsemble::new(
        vec![Arc::new(ConstantNetwork(vec![0.5, 0.5])), Arc::new(tiny_capsnet(12, 2, 2))],
        vec![0.5, 0.5],
        WeightPolicy::RequireUnitSum,
    )
    .unwrap();
    assert_eq!(ensemble.attribution_member(), Some(1));
    assert_eq!(ensemble.layer_access().map(|access| access.layer_count()), Some(6));

    let heatmap = SaliencyExplainer::default().explain(&ensemble, &create_test_face(12)).unwrap();
    assert_eq!(heatmap.dim(), (12, 12));
}

#[test]
fn test_perturbation_selects_top_positive_segments() {
    let network = tiny_capsnet(12, 2, 3);
    let face = create_test_face(12);
    let settings = quick_perturbation();
    let explanation = PerturbationExplainer::new(settings).explain(&network, &face).unwrap();

    assert!(explanation.segments.len() <= settings.top_k);
    assert!(explanation.segments.iter().all(|&(_, weight)| weight > 0.0));
    assert!(explanation.segments.windows(2).all(|w| w[0].1 >= w[1].1));
    assert!(explanation.target_class < 2);
    assert_eq!(explanation.overlay.dim(), face.dim());
    assert_eq!(explanation.mask.dim(), (12, 12));
    assert_eq!(explanation.surrogate.coefficients.len(), explanation.segmentation.count());

    let selected_pixels = explanation.mask.iter().filter(|&&m| m).count();
    assert_eq!(selected_pixels > 0, !explanation.segments.is_empty());
}

#[test]
fn test_perturbation_is_deterministic_for_seed() {
    let network = tiny_capsnet(12, 2, 4);
    let face = create_test_face(12);
    let explainer = PerturbationExplainer::new(quick_perturbation());

    let first = explainer.explain(&network, &face).unwrap();
    let second = explainer.explain(&network, &face).unwrap();
    assert_eq!(first.segments, second.segments);
    assert_eq!(first.surrogate, second.surrogate);
}

#[test]
fn test_constant_network_has_no_positive_segments() {
    let face = create_test_face(12);
    let explanation = PerturbationExplainer::new(quick_perturbation())
        .explain(&ConstantNetwork(vec![0.7]), &face)
        .unwrap();
    assert!(explanation.segments.is_empty());
    assert!(explanation.mask.iter().all(|&m| !m));
}

#[test]
fn test_explainer_failures_are_isolated() {
    let face = create_test_face(12);
    let settings = ExplainSettings {
        perturbation: quick_perturbation(),
        ..ExplainSettings::default()
    };
    let explanations = explain_frame(&ConstantNetwork(vec![0.4, 0.6]), &face, &settings);

    assert!(explanations.saliency.is_err());
    let perturbation = explanations.perturbation.unwrap();
    assert_eq!(perturbation.target_class, 1);
}

#[test]
fn test_explanations_render_to_png() {
    let network = tiny_capsnet(12, 2, 5);
    let face = create_test_face(12);
    let settings = ExplainSettings {
        perturbation: quick_perturbation(),
        ..ExplainSettings::default()
    };
    let explanations = explain_frame(&network, &face, &settings);

    let heatmap = render::heatmap_to_rgb(&explanations.saliency.unwrap()).unwrap();
    let overlay = render::overlay_to_rgb(&explanations.perturbation.unwrap().overlay).unwrap();
    assert_eq!(heatmap.dimensions(), (12, 12));
    assert_eq!(overlay.dimensions(), (12, 12));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("saliency.png");
    render::save_png(&heatmap, &path).unwrap();
    assert_eq!(image::open(&path).unwrap().to_rgb8(), heatmap);
}

#[test]
fn test_network_name_is_reported() {
    let network = tiny_capsnet(12, 2, 6);
    assert_eq!(network.name(), "tiny_6");
}
