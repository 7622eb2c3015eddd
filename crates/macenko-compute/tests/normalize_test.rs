//! End-to-end normalization tests on the CPU backend.
//!
//! `data/synthetic_64x48.*` holds a two-stain image (stain vectors
//! [0.65, 0.70, 0.29] and [0.07, 0.99, 0.11], with a background strip and
//! a background disc) together with the outputs expected from the built-in
//! reference.

use approx::assert_abs_diff_eq;

use macenko_compute::{
    create_normalizer, estimate_stains, Backend, CpuPrimitives, MaxConcentration, NormalizeParams,
    Normalizer, ReferenceStains, RgbImage, StainBasis,
};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

/// Logs to the test output; `RUST_LOG=macenko_compute=debug` shows the estimates.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn synthetic() -> RgbImage {
    RgbImage::from_raw(WIDTH, HEIGHT, include_bytes!("data/synthetic_64x48.rgb").to_vec()).unwrap()
}

fn expected_stains() -> ReferenceStains {
    ReferenceStains::from_yaml_str(include_str!("data/synthetic_64x48.stains.yaml")).unwrap()
}

/// Asserts per-sample agreement within `tolerance`, with at least
/// `min_exact` of the samples identical.
fn assert_close(actual: &[u8], expected: &[u8], tolerance: u8, min_exact: f64) {
    assert_eq!(actual.len(), expected.len());
    let mut exact = 0usize;
    for (i, (a, b)) in actual.iter().zip(expected).enumerate() {
        let diff = a.abs_diff(*b);
        assert!(diff <= tolerance, "sample {}: {} vs {}", i, a, b);
        if diff == 0 {
            exact += 1;
        }
    }
    let fraction = exact as f64 / actual.len() as f64;
    assert!(fraction >= min_exact, "only {:.4} of samples match exactly", fraction);
}

fn mean_abs_error(a: &[u8], b: &[u8]) -> f64 {
    let total: u64 = a.iter().zip(b).map(|(x, y)| u64::from(x.abs_diff(*y))).sum();
    total as f64 / a.len() as f64
}

#[test]
fn test_estimate_matches_golden_stains() {
    init_tracing();
    let stains = estimate_stains(&CpuPrimitives::new(), &synthetic(), &NormalizeParams::default()).unwrap();
    let expected = expected_stains();

    for k in 0..3 {
        assert_abs_diff_eq!(stains.basis.hematoxylin[k], expected.basis.hematoxylin[k], epsilon = 1e-9);
        assert_abs_diff_eq!(stains.basis.eosin[k], expected.basis.eosin[k], epsilon = 1e-9);
    }
    assert_abs_diff_eq!(
        stains.max_concentration.hematoxylin,
        expected.max_concentration.hematoxylin,
        epsilon = 1e-9
    );
    assert_abs_diff_eq!(stains.max_concentration.eosin, expected.max_concentration.eosin, epsilon = 1e-9);
}

#[test]
fn test_estimate_recovers_stain_directions() {
    let stains = estimate_stains(&CpuPrimitives::new(), &synthetic(), &NormalizeParams::default()).unwrap();
    let h = stains.basis.hematoxylin;
    let e = stains.basis.eosin;

    // hematoxylin has the larger red density
    assert!(h[0] > e[0]);
    // eosin is dominated by green
    assert!(e[1] > 0.9);
    // estimated directions are unit length
    assert_abs_diff_eq!(h.iter().map(|v| v * v).sum::<f64>(), 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(e.iter().map(|v| v * v).sum::<f64>(), 1.0, epsilon = 1e-12);
}

#[test]
fn test_default_reference_golden_output() {
    let normalizer = Normalizer::new();
    let out = normalizer.transform(&synthetic(), &NormalizeParams::default()).unwrap();

    assert_eq!(out.shape(), (HEIGHT as usize, WIDTH as usize, 3));
    assert_close(out.as_raw(), include_bytes!("data/synthetic_64x48.normalized.rgb"), 1, 0.99);
}

#[test]
fn test_stain_channels_golden_output() {
    let normalizer = Normalizer::new();
    let stains = normalizer.transform_with_channels(&synthetic(), &NormalizeParams::default()).unwrap();

    assert_close(stains.normalized.as_raw(), include_bytes!("data/synthetic_64x48.normalized.rgb"), 1, 0.99);
    assert_close(stains.hematoxylin.as_raw(), include_bytes!("data/synthetic_64x48.hematoxylin.rgb"), 1, 0.99);
    assert_close(stains.eosin.as_raw(), include_bytes!("data/synthetic_64x48.eosin.rgb"), 1, 0.99);

    // the normalized image from the channel variant is the plain transform
    let plain = normalizer.transform(&synthetic(), &NormalizeParams::default()).unwrap();
    assert_eq!(plain, stains.normalized);
}

#[test]
fn test_shape_preserved() {
    let normalizer = Normalizer::new();
    let image = synthetic();
    let stains = normalizer.transform_with_channels(&image, &NormalizeParams::default()).unwrap();
    for out in [&stains.normalized, &stains.hematoxylin, &stains.eosin] {
        assert!(out.same_shape(&image));
        assert_eq!(out.as_raw().len(), image.as_raw().len());
    }
}

#[test]
fn test_deterministic() {
    let image = synthetic();
    let params = NormalizeParams::default();

    let a = estimate_stains(&CpuPrimitives::new(), &image, &params).unwrap();
    let b = estimate_stains(&CpuPrimitives::new(), &image, &params).unwrap();
    assert_eq!(a, b);

    let normalizer = Normalizer::new();
    let first = normalizer.transform_with_channels(&image, &params).unwrap();
    let second = normalizer.transform_with_channels(&image, &params).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_fit_idempotent() {
    let image = synthetic();
    let params = NormalizeParams::default();
    let normalizer = Normalizer::new();

    let first = normalizer.fit(&image, &params).unwrap();
    let out_first = normalizer.transform(&image, &params).unwrap();
    let second = normalizer.fit(&image, &params).unwrap();
    let out_second = normalizer.transform(&image, &params).unwrap();

    assert_eq!(first, second);
    assert_eq!(normalizer.reference(), second);
    assert_eq!(out_first, out_second);
}

#[test]
fn test_self_normalization_near_identity() {
    init_tracing();
    let image = synthetic();
    let params = NormalizeParams::default();
    let normalizer = Normalizer::new();
    normalizer.fit(&image, &params).unwrap();

    let out = normalizer.transform(&image, &params).unwrap();
    let mae = mean_abs_error(out.as_raw(), image.as_raw());
    assert!(mae < 2.0, "self-normalization MAE {}", mae);
}

#[test]
fn test_overflow_becomes_254() {
    // a negated basis turns every positive concentration into a brightening
    let negated = StainBasis::new(
        StainBasis::REFERENCE.hematoxylin.map(|v| -v),
        StainBasis::REFERENCE.eosin.map(|v| -v),
    );
    let normalizer = Normalizer::with_reference(
        CpuPrimitives::new(),
        ReferenceStains::new(negated, MaxConcentration::REFERENCE),
    );
    let out = normalizer.transform(&synthetic(), &NormalizeParams::default()).unwrap();

    let clipped = out.as_raw().iter().filter(|v| **v == 254).count();
    assert!(clipped > out.as_raw().len() / 2, "only {} samples clipped", clipped);
    assert!(!out.as_raw().contains(&255));
}

#[test]
fn test_hematoxylin_channel_clips() {
    let stains = Normalizer::new()
        .transform_with_channels(&synthetic(), &NormalizeParams::default())
        .unwrap();
    // background pixels unmix to slightly negative hematoxylin
    assert_eq!(stains.hematoxylin.as_raw().iter().max(), Some(&254));
}

#[test]
fn test_reference_round_trip_through_yaml() {
    let normalizer = Normalizer::new();
    let fitted = normalizer.fit(&synthetic(), &NormalizeParams::default()).unwrap();
    let yaml = fitted.to_yaml().unwrap();

    let restored = Normalizer::with_reference(CpuPrimitives::new(), ReferenceStains::from_yaml_str(&yaml).unwrap());
    assert_eq!(restored.reference(), fitted);
    assert_eq!(
        restored.transform(&synthetic(), &NormalizeParams::default()).unwrap(),
        normalizer.transform(&synthetic(), &NormalizeParams::default()).unwrap()
    );
}

#[test]
fn test_degenerate_inputs() {
    init_tracing();
    let normalizer = Normalizer::new();
    let params = NormalizeParams::default();

    // all background
    let white = RgbImage::filled(8, 8, [250, 250, 250]);
    assert!(normalizer.transform(&white, &params).unwrap_err().is_degenerate());

    // a single tissue pixel
    let one = RgbImage::from_fn(8, 8, |x, y| if x == 0 && y == 0 { [90, 40, 120] } else { [250, 250, 250] });
    assert!(normalizer.fit(&one, &params).unwrap_err().is_degenerate());

    // uniform tissue has no variance
    let flat = RgbImage::filled(8, 8, [90, 40, 120]);
    assert!(normalizer.fit(&flat, &params).unwrap_err().is_degenerate());

    // empty image
    let empty = RgbImage::from_raw(0, 0, Vec::new()).unwrap();
    assert!(normalizer.transform(&empty, &params).unwrap_err().is_degenerate());

    assert_eq!(normalizer.reference(), ReferenceStains::default());
}

/// A 5x5 two-stain patch on a bright background, the shape of a tile at
/// the edge of a tissue section.
fn tissue_edge_tile() -> RgbImage {
    let h = [0.65f64, 0.70, 0.29];
    let e = [0.07f64, 0.99, 0.11];
    RgbImage::from_fn(64, 64, |x, y| {
        if !(20..25).contains(&x) || !(30..35).contains(&y) {
            return [250, 250, 250];
        }
        let ch = 0.3 + 0.15 * f64::from(x - 20);
        let ce = 0.2 + 0.12 * f64::from(y - 30);
        let px = |k: usize| (240.0 * (-(h[k] * ch + e[k] * ce)).exp()) as u8;
        [px(0), px(1), px(2)]
    })
}

#[test]
fn test_low_tissue_tile_still_normalizes() {
    init_tracing();
    let image = tissue_edge_tile();
    let params = NormalizeParams::default();

    // background densities are negative and outnumber the tissue
    let stains = estimate_stains(&CpuPrimitives::new(), &image, &params).unwrap();
    assert!(stains.max_concentration.hematoxylin < 0.0, "{:?}", stains.max_concentration);
    assert!(stains.max_concentration.eosin.is_finite());

    let normalizer = Normalizer::new();
    let out = normalizer.transform(&image, &params).unwrap();
    assert_eq!(out.shape(), (64, 64, 3));

    let channels = normalizer.transform_with_channels(&image, &params).unwrap();
    assert_eq!(channels.normalized, out);
    assert!(channels.hematoxylin.same_shape(&image));

    // fitting keeps the estimate as the new reference
    assert_eq!(normalizer.fit(&image, &params).unwrap(), stains);
    assert_eq!(normalizer.reference(), stains);
}

#[test]
fn test_params_change_outcome() {
    let image = synthetic();
    let cpu = CpuPrimitives::new();
    let base = estimate_stains(&cpu, &image, &NormalizeParams::default()).unwrap();
    let wide = estimate_stains(&cpu, &image, &NormalizeParams::default().with_alpha(10.0)).unwrap();
    // a larger margin pulls the extreme angles together
    let spread = |s: &ReferenceStains| {
        let (h, e) = (s.basis.hematoxylin, s.basis.eosin);
        (h[0] * e[0] + h[1] * e[1] + h[2] * e[2]).acos()
    };
    assert!(spread(&wide) < spread(&base));
}

#[test]
fn test_any_normalizer_matches_concrete() {
    let any = create_normalizer(Backend::Cpu).unwrap();
    let concrete = Normalizer::new();
    let params = NormalizeParams::default();
    assert_eq!(
        any.transform(&synthetic(), &params).unwrap(),
        concrete.transform(&synthetic(), &params).unwrap()
    );
    assert_eq!(any.fit(&synthetic(), &params).unwrap(), concrete.fit(&synthetic(), &params).unwrap());
}

#[test]
fn test_normalizer_shared_across_threads() {
    let normalizer = std::sync::Arc::new(Normalizer::new());
    let params = NormalizeParams::default();
    let expected = normalizer.transform(&synthetic(), &params).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let n = std::sync::Arc::clone(&normalizer);
            std::thread::spawn(move || n.transform(&synthetic(), &params).unwrap())
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), expected);
    }
}
