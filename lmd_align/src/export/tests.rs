use glam::DVec2;

use super::*;
use crate::calibration::SectionBounds;
use crate::deformation::{Correction, DisplacementGrid};
use crate::section::Section;
use crate::atlas::Volume;
use crate::regions::{RegionRecord, RegionTree};
use crate::testing::{self, CORTEX_A, CORTEX_B, HIDDEN, ROOT};

// =============================================================================
// Helpers
// =============================================================================

fn slide_with_section(atlas: &Atlas) -> (Slide, SectionId) {
    let mut slide = Slide::new("slide 1");
    slide.set_calibration(&testing::calibration_points()).unwrap();
    let image = testing::render_section(atlas, &testing::affine_field());
    let (w, h) = testing::SECTION_SIZE;
    let section = Section::new("s1", SectionBounds::new(100.0, 300.0, w, h), image).unwrap();
    section.initialize().unwrap();
    let id = slide.add_section(section);
    (slide, id)
}

fn selection(atlas: &Atlas, regions: &[RegionId]) -> Selection {
    let mut selection = Selection::new(atlas.regions().clone());
    for &r in regions {
        selection.toggle(r).unwrap();
    }
    selection
}

fn extract(
    atlas: &Atlas,
    field: &DeformationField,
    regions: &[RegionId],
) -> (Vec<ExportShape>, Vec<ShapeIssue>) {
    let stage = testing::calibration()
        .section_transform(&SectionBounds::new(100.0, 300.0, 200, 200))
        .unwrap();
    let target = SectionTarget {
        id: SectionId::nil(),
        name: "s1",
        field,
        stage: &stage,
    };
    extract_section_shapes(target, atlas, regions, &ExportConfig::default()).unwrap()
}

const PATCH: RegionId = RegionId(7);

/// Atlas with a single region `Patch` on the voxels where `inside(j, k)`, in
/// every axis-0 layer.
fn patch_atlas(inside: impl Fn(usize, usize) -> bool) -> Atlas {
    let geometry = testing::geometry();
    let [nx, ny, nz] = geometry.shape;
    let mut labels = Volume::filled(geometry, 0u32);
    let mut reference = Volume::filled(geometry, 0f32);
    for i in 0..nx {
        for j in 0..ny {
            for k in 0..nz {
                if inside(j, k) {
                    labels.set([i, j, k], PATCH.0);
                    reference.set([i, j, k], 1.0);
                }
            }
        }
    }
    let tree = RegionTree::from_records(vec![RegionRecord::new(PATCH.0, "Patch", None)]).unwrap();
    Atlas::new(labels, reference, tree).unwrap()
}

fn polygon_area(ring: &[DVec2]) -> f64 {
    signed_area(ring).abs()
}

// =============================================================================
// Extraction
// =============================================================================

#[test]
fn test_cortex_shapes_lie_on_their_side() {
    let atlas = testing::atlas(false);
    let (shapes, issues) = extract(&atlas, &testing::affine_field(), &[CORTEX_A, CORTEX_B]);

    assert!(issues.is_empty(), "{issues:?}");
    assert_eq!(shapes.len(), 2);
    assert_eq!(shapes[0].region, CORTEX_A);
    assert_eq!(shapes[0].region_name, "CortexA");
    assert_eq!(shapes[1].region, CORTEX_B);

    // u < -0.1 mm maps to pixel x < 90, u > 0.1 mm to x > 110.
    for ring in &shapes[0].rings {
        assert!(ring.section_pixels.iter().all(|p| p.x < 91.0));
    }
    for ring in &shapes[1].rings {
        assert!(ring.section_pixels.iter().all(|p| p.x > 109.0));
    }
    for shape in &shapes {
        assert_eq!(shape.outer_rings().count(), 1);
        assert_eq!(shape.magnification, 10);
        assert!(shape.well.is_none());
    }
}

#[test]
fn test_merged_region_covers_whole_disc() {
    let atlas = testing::atlas(false);
    let (shapes, issues) = extract(&atlas, &testing::affine_field(), &[ROOT]);

    assert!(issues.is_empty());
    assert_eq!(shapes.len(), 1);
    let shape = &shapes[0];
    assert_eq!(shape.merged_regions, vec![ROOT, CORTEX_A, CORTEX_B]);
    assert_eq!(shape.rings.len(), 1);

    // Disc of radius 0.8 mm at 100 px/mm, outlined along voxel edges.
    let area = polygon_area(&shape.rings[0].section_pixels);
    let expected = std::f64::consts::PI * 80.0 * 80.0;
    assert!(
        (area - expected).abs() / expected < 0.1,
        "area {area}, expected about {expected}"
    );
}

#[test]
fn test_stage_coordinates_follow_calibration() {
    let atlas = testing::atlas(false);
    let (shapes, _) = extract(&atlas, &testing::affine_field(), &[CORTEX_A]);
    let ring = &shapes[0].rings[0];
    assert_eq!(ring.stage.len(), ring.section_pixels.len());
    for (px, stage) in ring.section_pixels.iter().zip(&ring.stage) {
        let expected = (*px + DVec2::new(100.0, 300.0)) * 0.5 + DVec2::new(1000.0, 2000.0);
        assert!(testing::approx_eq_vec(*stage, expected, 1e-6));
    }
}

#[test]
fn test_region_absent_from_slice_is_skipped() {
    let atlas = testing::atlas(true);
    let (shapes, issues) = extract(&atlas, &testing::affine_field(), &[HIDDEN]);

    assert!(shapes.is_empty());
    assert_eq!(
        issues,
        vec![ShapeIssue::EmptyRegionMask {
            section: SectionId::nil(),
            region: HIDDEN,
        }]
    );
    assert!(!issues[0].is_fatal());
}

#[test]
fn test_one_voxel_wide_region_is_exported() {
    let atlas = patch_atlas(|j, k| k == 20 && (10..30).contains(&j));
    let (shapes, issues) = extract(&atlas, &testing::affine_field(), &[PATCH]);

    assert!(issues.is_empty(), "{issues:?}");
    assert_eq!(shapes.len(), 1);
    assert_eq!(shapes[0].rings.len(), 1);
    // 20 voxels of 0.05 mm squared.
    let area = polygon_area(&shapes[0].rings[0].plane_mm);
    assert!((area - 0.05).abs() < 0.01, "area {area}");
}

#[test]
fn test_region_with_hole_reports_uncut_hole() {
    let atlas = patch_atlas(|j, k| {
        let square = (10..30).contains(&j) && (10..30).contains(&k);
        let hole = (17..23).contains(&j) && (17..23).contains(&k);
        square && !hole
    });
    let (shapes, issues) = extract(&atlas, &testing::affine_field(), &[PATCH]);

    assert_eq!(shapes.len(), 1);
    let kinds: Vec<RingKind> = shapes[0].rings.iter().map(|r| r.kind).collect();
    assert_eq!(kinds.iter().filter(|&&k| k == RingKind::Outer).count(), 1);
    assert_eq!(kinds.iter().filter(|&&k| k == RingKind::Hole).count(), 1);
    assert_eq!(
        issues,
        vec![ShapeIssue::HolesNotCut {
            section: SectionId::nil(),
            region: PATCH,
            holes: 1,
        }]
    );
    assert!(!issues[0].is_fatal());
}

#[test]
fn test_collapsed_boundary_is_fatal() {
    let issue = ShapeIssue::BoundaryCollapsed {
        section: SectionId::nil(),
        region: PATCH,
    };
    assert!(issue.is_fatal());
    assert_eq!(issue.section(), SectionId::nil());
    let report = ExportReport {
        calibration: testing::calibration(),
        shapes: Vec::new(),
        issues: vec![issue],
    };
    assert!(report.skipped_regions().is_empty());
    assert_eq!(report.fatal_issues().count(), 1);
}

#[test]
fn test_zero_correction_matches_affine_seed() {
    let atlas = testing::atlas(false);
    let grid = DisplacementGrid::covering(DVec2::splat(-1.5), DVec2::splat(1.5), 0.25).unwrap();
    let zero_field =
        DeformationField::new(testing::plane(), testing::seed(), Correction::Grid(grid)).unwrap();

    let (affine, _) = extract(&atlas, &testing::affine_field(), &[CORTEX_A, CORTEX_B]);
    let (warped, _) = extract(&atlas, &zero_field, &[CORTEX_A, CORTEX_B]);

    assert_eq!(affine.len(), warped.len());
    for (a, w) in affine.iter().zip(&warped) {
        for (ra, rw) in a.rings.iter().zip(&w.rings) {
            assert_eq!(ra.section_pixels.len(), rw.section_pixels.len());
            for (pa, pw) in ra.section_pixels.iter().zip(&rw.section_pixels) {
                assert!(testing::approx_eq_vec(*pa, *pw, 1e-9));
            }
        }
    }
}

#[test]
fn test_rings_respect_vertex_cap() {
    let atlas = testing::atlas(false);
    let stage = testing::calibration()
        .section_transform(&SectionBounds::new(0.0, 0.0, 200, 200))
        .unwrap();
    let field = testing::affine_field();
    let target = SectionTarget {
        id: SectionId::nil(),
        name: "s1",
        field: &field,
        stage: &stage,
    };
    let config = ExportConfig {
        simplify_tolerance_mm: Some(0.0),
        max_vertices: 8,
        ..Default::default()
    };
    let (shapes, _) = extract_section_shapes(target, &atlas, &[ROOT], &config).unwrap();
    assert!(shapes[0].rings[0].plane_mm.len() <= 8);
}

#[test]
fn test_config_validation() {
    assert!(ExportConfig::default().validate().is_ok());
    let bad = [
        ExportConfig {
            magnification: 0,
            ..Default::default()
        },
        ExportConfig {
            max_vertices: 2,
            ..Default::default()
        },
        ExportConfig {
            max_spacing_mm: 0.0,
            ..Default::default()
        },
        ExportConfig {
            simplify_tolerance_mm: Some(-1.0),
            ..Default::default()
        },
    ];
    for config in bad {
        assert!(config.validate().is_err(), "accepted {config:?}");
    }
}

// =============================================================================
// Batch
// =============================================================================

#[test]
fn test_batch_assigns_spread_wells() {
    let atlas = testing::atlas(false);
    let (slide, id) = slide_with_section(&atlas);
    let selection = selection(&atlas, &[CORTEX_A, CORTEX_B]);

    let report =
        export_batch(&slide, &atlas, &selection, &[id], &ExportConfig::default()).unwrap();

    assert!(report.is_clean());
    let wells: Vec<usize> = report
        .shapes
        .iter()
        .map(|s| s.well.as_ref().unwrap().index)
        .collect();
    assert_eq!(wells, vec![0, 2]);
    assert_eq!(report.shapes[0].well.as_ref().unwrap().label, "A1");
    assert_eq!(report.shapes[1].well.as_ref().unwrap().label, "A3");
    assert_eq!(report.shapes_for(id).count(), 2);
}

#[test]
fn test_batch_without_calibration_fails() {
    let atlas = testing::atlas(false);
    let slide = Slide::new("uncalibrated");
    let selection = selection(&atlas, &[CORTEX_A]);
    let err = export_batch(&slide, &atlas, &selection, &[], &ExportConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientCalibrationPoints { found: 0 }
    ));
}

#[test]
fn test_batch_reports_uninitialized_section() {
    let atlas = testing::atlas(false);
    let (mut slide, ready) = slide_with_section(&atlas);
    let image = testing::render_section(&atlas, &testing::affine_field());
    let pending = slide.add_section(
        Section::new("s2", SectionBounds::new(400.0, 300.0, 200, 200), image).unwrap(),
    );
    let selection = selection(&atlas, &[CORTEX_A]);

    let report = export_batch(
        &slide,
        &atlas,
        &selection,
        &[pending, ready],
        &ExportConfig::default(),
    )
    .unwrap();

    assert_eq!(report.shapes.len(), 1);
    assert_eq!(report.shapes[0].section, ready);
    assert_eq!(
        report.issues,
        vec![ShapeIssue::SectionNotReady { section: pending }]
    );
    assert_eq!(report.fatal_issues().count(), 1);
}

#[test]
fn test_batch_reports_well_overflow() {
    let atlas = testing::atlas(false);
    let (slide, id) = slide_with_section(&atlas);
    let selection = selection(&atlas, &[CORTEX_A, CORTEX_B]);
    let config = ExportConfig {
        plate: WellPlate {
            rows: 1,
            columns: 2,
        },
        ..Default::default()
    };

    let report = export_batch(&slide, &atlas, &selection, &[id], &config).unwrap();
    assert_eq!(report.shapes.len(), 1);
    assert!(matches!(
        report.issues.as_slice(),
        [ShapeIssue::WellCapacityExceeded { region, .. }] if *region == CORTEX_B
    ));
}

#[test]
fn test_batch_rejects_foreign_section() {
    let atlas = testing::atlas(false);
    let (slide, _) = slide_with_section(&atlas);
    let selection = selection(&atlas, &[CORTEX_A]);
    let err = export_batch(
        &slide,
        &atlas,
        &selection,
        &[SectionId::unique()],
        &ExportConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { name: "sections", .. }));
}

#[test]
fn test_batch_keeps_shape_with_hole() {
    let atlas = patch_atlas(|j, k| {
        let square = (10..30).contains(&j) && (10..30).contains(&k);
        let hole = (17..23).contains(&j) && (17..23).contains(&k);
        square && !hole
    });
    let (slide, id) = slide_with_section(&atlas);
    let selection = selection(&atlas, &[PATCH]);

    let report =
        export_batch(&slide, &atlas, &selection, &[id], &ExportConfig::default()).unwrap();
    assert_eq!(report.shapes.len(), 1);
    assert!(!report.is_clean());
    assert_eq!(report.fatal_issues().count(), 0);
    assert!(report.skipped_regions().is_empty());
    assert!(to_lmd_xml(&report).contains("<ShapeCount>1</ShapeCount>"));
}

// =============================================================================
// Output files
// =============================================================================

#[test]
fn test_lmd_xml_layout() {
    let atlas = testing::atlas(false);
    let (slide, id) = slide_with_section(&atlas);
    let selection = selection(&atlas, &[CORTEX_A, CORTEX_B]);
    let report =
        export_batch(&slide, &atlas, &selection, &[id], &ExportConfig::default()).unwrap();

    let xml = to_lmd_xml(&report);
    assert!(xml.starts_with("<ImageData>\n<GlobalCoordinates>1</GlobalCoordinates>\n"));
    assert!(xml.trim_end().ends_with("</ImageData>"));
    assert!(xml.contains("<X_CalibrationPoint_1>1000.000</X_CalibrationPoint_1>"));
    assert!(xml.contains("<Y_CalibrationPoint_1>2000.000</Y_CalibrationPoint_1>"));
    assert!(xml.contains("<X_CalibrationPoint_2>1500.000</X_CalibrationPoint_2>"));
    assert!(xml.contains("<Y_CalibrationPoint_3>2500.000</Y_CalibrationPoint_3>"));
    assert!(xml.contains("<ShapeCount>2</ShapeCount>"));
    assert!(xml.contains("<TransferID>CortexA_s1</TransferID>"));
    assert!(xml.contains("<CapID>A1</CapID>"));
    assert!(xml.contains("<CapID>A3</CapID>"));
    assert!(xml.contains("<Magnification>10</Magnification>"));

    let ring = &report.shapes[0].rings[0].stage;
    let n = ring.len() + 1;
    assert!(xml.contains(&format!("<PointCount>{n}</PointCount>")));
    // Closed: the last point repeats the first.
    assert!(xml.contains(&format!("<X_{n}>{:.3}</X_{n}>", ring[0].x)));
    assert!(xml.contains(&format!("<Y_{n}>{:.3}</Y_{n}>", ring[0].y)));
}

#[test]
fn test_lmd_xml_and_overlay_files() {
    let atlas = testing::atlas(false);
    let (slide, id) = slide_with_section(&atlas);
    let selection = selection(&atlas, &[ROOT]);
    let report =
        export_batch(&slide, &atlas, &selection, &[id], &ExportConfig::default()).unwrap();

    let xml_path = common::test_utils::test_output_path("export_outlines_lmd.xml");
    save_lmd_xml(&report, &xml_path).unwrap();
    let written = std::fs::read_to_string(&xml_path).unwrap();
    assert_eq!(written, to_lmd_xml(&report));

    let section = slide.section(id).unwrap();
    let overlay = render_overlay(section.image(), report.shapes_for(id));
    assert_eq!(overlay.dimensions(), (200, 200));
    assert!(overlay.pixels().any(|p| p.0 == [255, 0, 0]));

    let png_path = common::test_utils::test_output_path("export_rois.png");
    save_overlay(section.image(), report.shapes_for(id), &png_path).unwrap();
    assert!(png_path.exists());
}
