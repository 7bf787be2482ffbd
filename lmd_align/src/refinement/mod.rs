//! Landmark-guided non-rigid refinement.
//!
//! This module orchestrates a [`NonRigidSolver`]: it validates the inputs,
//! streams `(iteration, metric)` events, keeps the best correction seen so
//! far, detects stalls and honours cancellation between iterations. The
//! numerical method itself lives behind the solver traits.

mod config;
mod progress;
mod solver;

use tracing::{debug, error, info, warn};

use crate::atlas::SlicePlane;
use crate::deformation::{Correction, DeformationField, DisplacementGrid};
use crate::error::{Error, Result};

pub use config::{
    MAX_ITERATIONS, RefinementConfig, RefinementOverrides, RefinementPreset,
    SECONDS_PER_ITERATION, format_duration,
};
pub use progress::{
    CancelToken, EventLog, ProgressCallback, RefinementEvent, RefinementStalled, report_progress,
};
pub use solver::{LandmarkGridSolver, NonRigidSolver, RefinementProblem, SolverError, SolverRun};

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    /// Seed plus the best correction found. Affine-only when no iteration ran.
    pub field: DeformationField,
    pub iterations_run: usize,
    pub best_metric: Option<f64>,
    /// Set when the run stopped early for lack of improvement.
    pub stalled: Option<RefinementStalled>,
}

struct Best {
    iteration: usize,
    metric: f64,
    correction: DisplacementGrid,
}

/// Runs `solver` on `problem` to completion, stall, failure or cancellation.
pub fn refine(
    plane: SlicePlane,
    problem: &RefinementProblem,
    solver: &dyn NonRigidSolver,
    cancel: &CancelToken,
    progress: &ProgressCallback,
) -> Result<RefinementOutcome> {
    let config = &problem.config;
    config.validate_inputs(
        problem.landmarks.len(),
        (problem.section.width(), problem.section.height()),
        (problem.atlas.width(), problem.atlas.height()),
    )?;
    let affine_only = DeformationField::from_affine(plane, problem.seed)?;

    info!(
        solver = solver.name(),
        preset = %config.preset,
        iterations = config.iterations,
        landmarks = problem.landmarks.len(),
        estimated = %format_duration(config.estimated_duration()),
        "refinement started"
    );
    report_progress(
        progress,
        RefinementEvent::Started {
            iterations: config.iterations,
        },
    );

    if config.iterations == 0 {
        return Ok(finish(progress, affine_only, 0, None, None));
    }
    if cancel.is_cancelled() {
        return Err(cancelled(progress, 0));
    }

    let mut run = solver
        .start(problem)
        .map_err(|e| failed(progress, e.to_string()))?;

    let mut best: Option<Best> = None;
    let mut reference: Option<f64> = None;
    let mut last_improvement = 0;
    let mut stalled = None;
    let mut iterations_run = 0;

    for iteration in 1..=config.iterations {
        if cancel.is_cancelled() {
            return Err(cancelled(progress, iterations_run));
        }

        let metric = run.step().map_err(|e| failed(progress, e.to_string()))?;
        if !metric.is_finite() {
            return Err(failed(
                progress,
                format!("metric is {metric} at iteration {iteration}"),
            ));
        }
        iterations_run = iteration;
        debug!(iteration, metric, "refinement iteration");
        report_progress(progress, RefinementEvent::Iteration { iteration, metric });

        if best.as_ref().is_none_or(|b| metric < b.metric) {
            best = Some(Best {
                iteration,
                metric,
                correction: run.correction(),
            });
        }

        let improved = reference
            .is_none_or(|r| r - metric > config.stall_tolerance * r.abs().max(f64::EPSILON));
        if improved {
            reference = Some(metric);
            last_improvement = iteration;
        } else if iteration - last_improvement >= config.stall_window {
            let (best_iteration, best_metric) =
                best.as_ref().map_or((0, metric), |b| (b.iteration, b.metric));
            let report = RefinementStalled {
                iteration,
                best_iteration,
                best_metric,
                window: config.stall_window,
            };
            warn!(
                iteration,
                best_iteration, best_metric, "refinement stalled, keeping best field"
            );
            report_progress(progress, RefinementEvent::Stalled(report));
            stalled = Some(report);
            break;
        }
    }

    let Some(best) = best else {
        return Ok(finish(progress, affine_only, iterations_run, None, stalled));
    };
    if !best.correction.is_finite() {
        return Err(failed(
            progress,
            "correction contains non-finite values".to_string(),
        ));
    }
    let field = DeformationField::new(plane, problem.seed, Correction::Grid(best.correction))
        .map_err(|e| failed(progress, e.to_string()))?;

    Ok(finish(
        progress,
        field,
        iterations_run,
        Some(best.metric),
        stalled,
    ))
}

fn finish(
    progress: &ProgressCallback,
    field: DeformationField,
    iterations_run: usize,
    best_metric: Option<f64>,
    stalled: Option<RefinementStalled>,
) -> RefinementOutcome {
    info!(iterations_run, ?best_metric, "refinement finished");
    report_progress(
        progress,
        RefinementEvent::Finished {
            iterations_run,
            best_metric,
        },
    );
    RefinementOutcome {
        field,
        iterations_run,
        best_metric,
        stalled,
    }
}

fn failed(progress: &ProgressCallback, reason: String) -> Error {
    error!(%reason, "refinement failed");
    report_progress(
        progress,
        RefinementEvent::Failed {
            reason: reason.clone(),
        },
    );
    Error::RefinementFailed { reason }
}

fn cancelled(progress: &ProgressCallback, iteration: usize) -> Error {
    info!(iteration, "refinement cancelled");
    report_progress(progress, RefinementEvent::Cancelled { iteration });
    Error::RefinementCancelled
}
