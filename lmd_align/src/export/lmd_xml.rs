//! Shape import file for Leica LMD instruments.
//!
//! Calibration marks and all vertices are written in stage coordinates with
//! `GlobalCoordinates` set, so the instrument software only asks the user to
//! confirm the three calibration marks. Each outer ring becomes one shape;
//! every shape ring is closed by repeating its first point.

use std::fmt::Write as _;
use std::path::Path;

use glam::DVec2;
use tracing::info;

use crate::error::{Error, Result};
use crate::export::ExportReport;

pub const LMD_FILE_NAME: &str = "outlines_lmd.xml";

fn write_point(out: &mut String, index: usize, p: DVec2) {
    let _ = writeln!(out, "<X_{index}>{:.3}</X_{index}>", p.x);
    let _ = writeln!(out, "<Y_{index}>{:.3}</Y_{index}>", p.y);
}

/// Renders the report as instrument XML. Hole rings are left out; the report
/// lists them as [`ShapeIssue::HolesNotCut`](crate::export::ShapeIssue::HolesNotCut).
pub fn to_lmd_xml(report: &ExportReport) -> String {
    let mut out = String::new();
    out.push_str("<ImageData>\n");
    out.push_str("<GlobalCoordinates>1</GlobalCoordinates>\n");

    for (i, point) in report.calibration.points().iter().enumerate() {
        let n = i + 1;
        let _ = writeln!(
            out,
            "<X_CalibrationPoint_{n}>{:.3}</X_CalibrationPoint_{n}>",
            point.stage.x
        );
        let _ = writeln!(
            out,
            "<Y_CalibrationPoint_{n}>{:.3}</Y_CalibrationPoint_{n}>",
            point.stage.y
        );
    }

    let shape_count: usize = report.shapes.iter().map(|s| s.outer_rings().count()).sum();
    let _ = writeln!(out, "<ShapeCount>{shape_count}</ShapeCount>");

    let mut k = 0;
    for shape in &report.shapes {
        let cap = shape.well.as_ref().map_or("", |w| w.label.as_str());
        for ring in shape.outer_rings() {
            k += 1;
            let _ = writeln!(out, "<Shape_{k}>");
            let _ = writeln!(out, "<PointCount>{}</PointCount>", ring.stage.len() + 1);
            let _ = writeln!(out, "<TransferID>{}</TransferID>", shape.transfer_id());
            let _ = writeln!(out, "<CapID>{cap}</CapID>");
            let _ = writeln!(out, "<Magnification>{}</Magnification>", shape.magnification);
            for (j, &p) in ring.stage.iter().chain(ring.stage.first()).enumerate() {
                write_point(&mut out, j + 1, p);
            }
            let _ = writeln!(out, "</Shape_{k}>");
        }
    }
    out.push_str("</ImageData>\n");
    out
}

pub fn save_lmd_xml(report: &ExportReport, path: &Path) -> Result<()> {
    std::fs::write(path, to_lmd_xml(report)).map_err(|e| Error::io(path, e))?;
    info!(path = %path.display(), shapes = report.shapes.len(), "instrument file written");
    Ok(())
}
