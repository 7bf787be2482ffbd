use std::sync::Arc;
use std::time::Duration;

use glam::{DVec2, DVec3};

use super::*;
use crate::deformation::{Correction, DisplacementGrid};
use crate::refinement::{
    LandmarkGridSolver, RefinementOverrides, RefinementPreset, SolverError, SolverRun,
};
use crate::testing;

// =============================================================================
// Helpers
// =============================================================================

fn section(atlas: &Atlas) -> Section {
    let image = testing::render_section(atlas, &testing::affine_field());
    let (w, h) = testing::SECTION_SIZE;
    Section::new("s1", SectionBounds::new(100.0, 300.0, w, h), image).unwrap()
}

/// Sleeps every iteration so the run can be observed and cancelled.
struct SlowSolver {
    delay: Duration,
    fail_at: Option<usize>,
}

struct SlowRun {
    delay: Duration,
    fail_at: Option<usize>,
    step: usize,
    grid: DisplacementGrid,
}

impl NonRigidSolver for SlowSolver {
    fn name(&self) -> &str {
        "slow"
    }

    fn start(
        &self,
        problem: &RefinementProblem,
    ) -> std::result::Result<Box<dyn SolverRun>, SolverError> {
        let (min, max) = problem.plane_extent();
        let mut grid = DisplacementGrid::covering(min, max, 0.5).unwrap();
        grid.values_mut().fill(DVec2::new(1.0, 0.0));
        Ok(Box::new(SlowRun {
            delay: self.delay,
            fail_at: self.fail_at,
            step: 0,
            grid,
        }))
    }
}

impl SolverRun for SlowRun {
    fn step(&mut self) -> std::result::Result<f64, SolverError> {
        std::thread::sleep(self.delay);
        self.step += 1;
        if self.fail_at == Some(self.step) {
            return Err(SolverError::Diverged("synthetic failure".to_string()));
        }
        Ok(1.0 / self.step as f64)
    }

    fn correction(&self) -> DisplacementGrid {
        self.grid.clone()
    }
}

async fn wait_for_iteration(handle: &mut RefinementHandle) {
    while let Some(event) = handle.next_event().await {
        if matches!(event, RefinementEvent::Iteration { .. }) {
            return;
        }
    }
    panic!("run ended before the first iteration");
}

// =============================================================================
// State
// =============================================================================

#[test]
fn test_image_must_match_bounds() {
    let image = Buffer2::new_filled(10, 10, 0.0f32);
    let err = Section::new("bad", SectionBounds::new(0.0, 0.0, 10, 12), image).unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { name: "image", .. }));
}

#[test]
fn test_section_id_parses_back() {
    let atlas = testing::atlas(false);
    let id = section(&atlas).id();
    let parsed: SectionId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
    assert!("s1".parse::<SectionId>().is_err());
}

#[test]
fn test_initialize_sets_affine_field() {
    let atlas = testing::atlas(false);
    let mut section = section(&atlas);
    assert!(section.field().is_none());
    assert!(matches!(
        section.export_snapshot(),
        Err(Error::NotInitialized { .. })
    ));

    section.set_slice_params(testing::slice_params()).unwrap();
    let init = section.initialize().unwrap();
    assert_eq!(init.fit, crate::initializer::FitKind::Parametric);
    assert_eq!(section.field().unwrap(), testing::affine_field());
    assert_eq!(section.export_snapshot().unwrap(), testing::affine_field());
    assert_eq!(section.seed_field(), section.field());
}

#[test]
fn test_input_changes_discard_field() {
    let atlas = testing::atlas(false);
    let mut section = section(&atlas);

    section.initialize().unwrap();
    section.add_landmark(LandmarkPair::new(DVec3::ZERO, DVec2::new(100.0, 100.0)));
    assert!(section.field().is_none());
    assert!(section.initialization().is_none());

    section.initialize().unwrap();
    section
        .set_refinement_config(RefinementConfig::from_preset(RefinementPreset::Fast))
        .unwrap();
    assert!(section.field().is_none());

    section.initialize().unwrap();
    section
        .set_slice_params(SliceParams::new(0.1, [0.0, 0.0, 0.0]))
        .unwrap();
    assert!(section.seed_field().is_none());

    // Removing from an empty set changes nothing.
    section.set_landmarks(LandmarkSet::new());
    section.initialize().unwrap();
    assert!(section.remove_last_landmark().is_none());
    assert!(section.field().is_some());
}

#[test]
fn test_invalid_inputs_are_rejected_and_keep_field() {
    let atlas = testing::atlas(false);
    let mut section = section(&atlas);
    section.initialize().unwrap();

    assert!(
        section
            .set_slice_params(SliceParams::new(0.0, [0.0, 120.0, 0.0]))
            .is_err()
    );
    assert!(section.field().is_some());
}

#[test]
fn test_manual_adjustment_requires_initialization() {
    let atlas = testing::atlas(false);
    let section = section(&atlas);
    assert!(matches!(
        section.apply_manual_adjustment(testing::affine_field()),
        Err(Error::NotInitialized { .. })
    ));

    section.initialize().unwrap();
    let mut grid = DisplacementGrid::zeros(DVec2::splat(-1.0), 0.5, 5, 5).unwrap();
    grid.values_mut().fill(DVec2::new(0.0, 2.0));
    let adjusted =
        DeformationField::new(testing::plane(), testing::seed(), Correction::Grid(grid)).unwrap();
    section.apply_manual_adjustment(adjusted.clone()).unwrap();
    assert_eq!(section.field().unwrap(), adjusted);
    // The seed is untouched.
    assert_eq!(section.seed_field().unwrap(), testing::affine_field());
}

#[test]
fn test_convert_through_section_bridges() {
    let atlas = testing::atlas(false);
    let section = section(&atlas);
    let calibration = testing::calibration();
    let point = Point::new(CoordinateFrame::AtlasPhysical, DVec3::new(0.0, 0.2, -0.3));

    // No field yet.
    let err = section
        .convert(
            atlas.geometry(),
            Some(&calibration),
            &point,
            CoordinateFrame::DeviceStage,
        )
        .unwrap_err();
    assert!(matches!(err, Error::UnreachableFrame { .. }));

    section.initialize().unwrap();
    let stage = section
        .convert(
            atlas.geometry(),
            Some(&calibration),
            &point,
            CoordinateFrame::DeviceStage,
        )
        .unwrap();
    assert_eq!(stage.frame, CoordinateFrame::DeviceStage);
    // uv = (-0.3, 0.2) -> pixel (70, 120) -> slide (170, 420) -> stage.
    let expected = DVec2::new(170.0, 420.0) * 0.5 + DVec2::new(1000.0, 2000.0);
    assert!(testing::approx_eq_vec(stage.xy(), expected, 1e-6));

    let back = section
        .convert(
            atlas.geometry(),
            Some(&calibration),
            &stage,
            CoordinateFrame::AtlasPhysical,
        )
        .unwrap();
    assert!(back.pos.distance(point.pos) < 1e-9);

    // Without calibration DeviceStage is out of reach.
    assert!(matches!(
        section.convert(atlas.geometry(), None, &point, CoordinateFrame::DeviceStage),
        Err(Error::UnreachableFrame { .. })
    ));
}

// =============================================================================
// Refinement runs
// =============================================================================

#[test]
fn test_refinement_needs_a_runtime() {
    let atlas = testing::shared_atlas(false);
    let section = section(&atlas);
    section.initialize().unwrap();
    let err = section
        .start_refinement(atlas.clone(), Arc::new(LandmarkGridSolver))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { name: "runtime", .. }));
    assert!(!section.is_refining());
    assert_eq!(section.field(), section.seed_field());
}

#[tokio::test]
async fn test_refinement_requires_initialization() {
    let atlas = testing::shared_atlas(false);
    let section = section(&atlas);
    let err = section
        .start_refinement(atlas.clone(), Arc::new(LandmarkGridSolver))
        .unwrap_err();
    assert!(matches!(err, Error::NotInitialized { .. }));
}

#[tokio::test]
async fn test_successful_refinement_replaces_field() {
    testing::init_tracing();
    let atlas = testing::shared_atlas(false);
    let mut section = section(&atlas);
    section
        .set_refinement_config(RefinementConfig::from_preset(RefinementPreset::Fast))
        .unwrap();
    section.initialize().unwrap();

    let handle = section
        .start_refinement(atlas.clone(), Arc::new(SlowSolver {
            delay: Duration::ZERO,
            fail_at: None,
        }))
        .unwrap();
    let log = handle.log().clone();
    let outcome = handle.finish().await.unwrap();

    assert_eq!(outcome.iterations_run, 10);
    assert!(!section.is_refining());
    let field = section.export_snapshot().unwrap();
    assert_eq!(field, outcome.field);
    assert_ne!(field, testing::affine_field());

    let events = log.snapshot();
    assert_eq!(events.first(), Some(&RefinementEvent::Started { iterations: 10 }));
    assert!(matches!(events.last(), Some(RefinementEvent::Finished { .. })));
}

#[tokio::test]
async fn test_cancel_restores_affine_field() {
    let atlas = testing::shared_atlas(false);
    let mut section = section(&atlas);
    section
        .set_refinement_config(RefinementConfig::from_preset(RefinementPreset::VerySlow))
        .unwrap();
    section.initialize().unwrap();
    let before = section.field().unwrap();

    let mut handle = section
        .start_refinement(atlas.clone(), Arc::new(SlowSolver {
            delay: Duration::from_millis(2),
            fail_at: None,
        }))
        .unwrap();
    wait_for_iteration(&mut handle).await;

    assert!(section.is_refining());
    assert!(matches!(
        section.export_snapshot(),
        Err(Error::RefinementInProgress { .. })
    ));
    assert!(matches!(
        section.start_refinement(atlas.clone(), Arc::new(LandmarkGridSolver)),
        Err(Error::RefinementInProgress { .. })
    ));

    handle.cancel();
    let log = handle.log().clone();
    let err = handle.finish().await.unwrap_err();
    assert!(matches!(err, Error::RefinementCancelled));

    assert!(!section.is_refining());
    assert_eq!(section.export_snapshot().unwrap(), before);
    assert!(matches!(
        log.snapshot().last(),
        Some(RefinementEvent::Cancelled { .. })
    ));
}

#[tokio::test]
async fn test_failed_refinement_keeps_affine_field() {
    let atlas = testing::shared_atlas(false);
    let section = section(&atlas);
    section.initialize().unwrap();

    let handle = section
        .start_refinement(atlas.clone(), Arc::new(SlowSolver {
            delay: Duration::ZERO,
            fail_at: Some(3),
        }))
        .unwrap();
    let err = handle.finish().await.unwrap_err();

    assert!(matches!(err, Error::RefinementFailed { .. }));
    assert_eq!(section.export_snapshot().unwrap(), testing::affine_field());
}

#[tokio::test]
async fn test_result_is_dropped_when_inputs_change() {
    let atlas = testing::shared_atlas(false);
    let mut section = section(&atlas);
    section
        .set_refinement_config(RefinementConfig::default().with_overrides(&RefinementOverrides {
            iterations: Some(200),
            ..Default::default()
        }))
        .unwrap();
    section.initialize().unwrap();

    let mut handle = section
        .start_refinement(atlas.clone(), Arc::new(SlowSolver {
            delay: Duration::from_millis(1),
            fail_at: None,
        }))
        .unwrap();
    wait_for_iteration(&mut handle).await;
    section.add_landmark(LandmarkPair::new(DVec3::ZERO, DVec2::new(100.0, 100.0)));
    handle.finish().await.unwrap();

    assert!(section.field().is_none());
    assert!(!section.is_refining());
}

#[tokio::test]
async fn test_events_stream_in_order() {
    let atlas = testing::shared_atlas(false);
    let mut section = section(&atlas);
    section
        .set_refinement_config(RefinementConfig::from_preset(RefinementPreset::Fast))
        .unwrap();
    section.initialize().unwrap();

    let mut handle = section
        .start_refinement(atlas.clone(), Arc::new(SlowSolver {
            delay: Duration::ZERO,
            fail_at: None,
        }))
        .unwrap();

    let mut received = Vec::new();
    while let Some(event) = handle.next_event().await {
        received.push(event);
    }
    assert_eq!(received, handle.log().snapshot());
    let iterations: Vec<usize> = received
        .iter()
        .filter_map(|e| match e {
            RefinementEvent::Iteration { iteration, .. } => Some(*iteration),
            _ => None,
        })
        .collect();
    assert_eq!(iterations, (1..=10).collect::<Vec<_>>());
    handle.finish().await.unwrap();
}
