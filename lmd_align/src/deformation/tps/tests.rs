use super::*;
use glam::DVec2;

// ============================================================================
// Helpers
// ============================================================================

/// Corners + centre of a 2 mm square.
fn square_source_5() -> Vec<DVec2> {
    vec![
        DVec2::new(-1.0, -1.0),
        DVec2::new(1.0, -1.0),
        DVec2::new(-1.0, 1.0),
        DVec2::new(1.0, 1.0),
        DVec2::new(0.0, 0.0),
    ]
}

fn assert_dvec2_near(a: DVec2, b: DVec2, tol: f64, msg: &str) {
    assert!(
        (a - b).length() < tol,
        "{msg}: got {a} expected {b} (diff {})",
        (a - b).length()
    );
}

// ============================================================================
// Kernel
// ============================================================================

#[test]
fn test_tps_kernel_known_values() {
    assert_eq!(tps_kernel(0.0), 0.0);
    assert_eq!(tps_kernel(1e-11), 0.0);
    assert!(tps_kernel(1.0).abs() < 1e-15);

    let e = std::f64::consts::E;
    assert!((tps_kernel(e) - e * e).abs() < 1e-12);
    assert!((tps_kernel(0.5) - 0.25 * 0.5_f64.ln()).abs() < 1e-12);
    assert!(tps_kernel(0.5) < 0.0);
}

// ============================================================================
// Fitting
// ============================================================================

#[test]
fn test_tps_fit_needs_three_points() {
    let pts = vec![DVec2::ZERO, DVec2::ONE];
    assert!(ThinPlateSpline::fit(&pts, &pts, TpsConfig::default()).is_none());
    assert!(ThinPlateSpline::fit(&square_source_5(), &pts, TpsConfig::default()).is_none());
}

#[test]
fn test_tps_fit_collinear_returns_none() {
    let src = vec![
        DVec2::new(0.0, 0.0),
        DVec2::new(1.0, 0.0),
        DVec2::new(2.0, 0.0),
        DVec2::new(3.0, 0.0),
    ];
    let dst = vec![DVec2::new(0.5, 0.0); 4];
    assert!(ThinPlateSpline::fit(&src, &dst, TpsConfig::default()).is_none());
}

#[test]
fn test_tps_interpolates_displacements_exactly() {
    let src = square_source_5();
    // Pixel displacements, centre pushed right.
    let disp = vec![
        DVec2::ZERO,
        DVec2::ZERO,
        DVec2::ZERO,
        DVec2::ZERO,
        DVec2::new(12.0, -3.0),
    ];
    let tps = ThinPlateSpline::fit(&src, &disp, TpsConfig::default()).unwrap();
    for (i, (&s, &d)) in src.iter().zip(&disp).enumerate() {
        assert_dvec2_near(tps.transform(s), d, 1e-8, &format!("control point {i}"));
    }
    assert!(tps.compute_residuals(&disp).iter().all(|&r| r < 1e-8));
    assert!(tps.bending_energy().abs() > 0.0);
    assert!(tps.is_finite());
}

#[test]
fn test_tps_constant_field_is_affine() {
    let src = square_source_5();
    let disp = vec![DVec2::new(4.0, 2.0); 5];
    let tps = ThinPlateSpline::fit(&src, &disp, TpsConfig::default()).unwrap();
    assert_dvec2_near(tps.transform(DVec2::new(0.3, -0.7)), DVec2::new(4.0, 2.0), 1e-8, "interior");
    assert!(tps.bending_energy().abs() < 1e-8);
}

#[test]
fn test_tps_regularization_smooths() {
    let src = square_source_5();
    let disp = vec![
        DVec2::ZERO,
        DVec2::ZERO,
        DVec2::ZERO,
        DVec2::ZERO,
        DVec2::new(10.0, 0.0),
    ];
    let exact = ThinPlateSpline::fit(&src, &disp, TpsConfig::default()).unwrap();
    let smooth = ThinPlateSpline::fit(&src, &disp, TpsConfig { regularization: 1.0 }).unwrap();
    let exact_res: f64 = exact.compute_residuals(&disp).iter().sum();
    let smooth_res: f64 = smooth.compute_residuals(&disp).iter().sum();
    assert!(smooth_res > exact_res);
    assert!(smooth.bending_energy().abs() < exact.bending_energy().abs());
}

#[test]
fn test_tps_transform_points_matches_transform() {
    let src = square_source_5();
    let disp: Vec<DVec2> = src.iter().map(|p| *p * 2.0).collect();
    let tps = ThinPlateSpline::fit(&src, &disp, TpsConfig::default()).unwrap();
    let queries = vec![DVec2::new(0.1, 0.2), DVec2::new(-0.5, 0.9)];
    let batch = tps.transform_points(&queries);
    for (q, b) in queries.iter().zip(batch) {
        assert_eq!(tps.transform(*q), b);
    }
    assert_eq!(tps.control_points().len(), 5);
}

// ============================================================================
// Serde
// ============================================================================

#[test]
fn test_tps_deserialize_checks_weights() {
    let src = square_source_5();
    let disp = vec![DVec2::ZERO, DVec2::ZERO, DVec2::ZERO, DVec2::ZERO, DVec2::new(3.0, 1.0)];
    let tps = ThinPlateSpline::fit(&src, &disp, TpsConfig::default()).unwrap();
    let json = serde_json::to_string(&tps).unwrap();
    let back: ThinPlateSpline = serde_json::from_str(&json).unwrap();
    assert_eq!(back, tps);

    let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
    value["weights_y"] = serde_json::json!([0.0]);
    assert!(serde_json::from_value::<ThinPlateSpline>(value.clone()).is_err());

    value["weights_y"] = value["weights_x"].clone();
    value["control_points"] = serde_json::json!([[0.0, 0.0], [1.0, 0.0]]);
    assert!(serde_json::from_value::<ThinPlateSpline>(value).is_err());
}
