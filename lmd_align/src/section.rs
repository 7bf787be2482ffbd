//! One tissue section: its image, alignment inputs and current deformation field.
//!
//! A section owns its field exclusively. Changing the slice parameters,
//! landmarks or refinement parameters discards the field; it must be
//! re-initialized. Refinement runs on a blocking worker and only replaces
//! the field on success.

use std::sync::Arc;

use common::{SharedFn, id_type};
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::atlas::{Atlas, AtlasGeometry, SliceParams};
use crate::buffer2::Buffer2;
use crate::calibration::{SectionBounds, StageCalibration};
use crate::deformation::DeformationField;
use crate::error::{Error, Result};
use crate::frames::{CoordinateFrame, FrameRegistry, Point};
use crate::initializer::{
    AffineInitializer, Initialization, InitializerConfig, LandmarkPair, LandmarkSet,
};
use crate::refinement::{
    CancelToken, EventLog, NonRigidSolver, ProgressCallback, RefinementConfig, RefinementEvent,
    RefinementOutcome, RefinementProblem, refine,
};
use crate::transform::AffineTransform;

id_type!(SectionId);

#[derive(Debug, Default)]
struct SectionState {
    initialization: Option<Initialization>,
    /// Affine-only field from the last initialization.
    seed: Option<DeformationField>,
    /// Field used for conversion and export.
    active: Option<DeformationField>,
    refining: bool,
    /// Bumped whenever the inputs change; stale refinement results are dropped.
    generation: u64,
}

#[derive(Debug)]
pub struct Section {
    id: SectionId,
    name: String,
    bounds: SectionBounds,
    image: Arc<Buffer2<f32>>,
    slice_params: SliceParams,
    landmarks: LandmarkSet,
    initializer: InitializerConfig,
    refinement: RefinementConfig,
    state: Arc<Mutex<SectionState>>,
}

impl Section {
    /// `image` must have the size given by `bounds`.
    pub fn new(
        name: impl Into<String>,
        bounds: SectionBounds,
        image: Buffer2<f32>,
    ) -> Result<Self> {
        if image.width() != bounds.width || image.height() != bounds.height {
            return Err(Error::invalid(
                "image",
                format!(
                    "{}x{} image does not match {}x{} section bounds",
                    image.width(),
                    image.height(),
                    bounds.width,
                    bounds.height
                ),
            ));
        }
        let initializer = InitializerConfig {
            section_size: (bounds.width, bounds.height),
            ..Default::default()
        };
        Ok(Self {
            id: SectionId::unique(),
            name: name.into(),
            bounds,
            image: Arc::new(image),
            slice_params: SliceParams::default(),
            landmarks: LandmarkSet::new(),
            initializer,
            refinement: RefinementConfig::default(),
            state: Arc::default(),
        })
    }

    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bounds(&self) -> &SectionBounds {
        &self.bounds
    }

    pub fn image(&self) -> &Arc<Buffer2<f32>> {
        &self.image
    }

    pub fn slice_params(&self) -> &SliceParams {
        &self.slice_params
    }

    pub fn landmarks(&self) -> &LandmarkSet {
        &self.landmarks
    }

    pub fn initializer_config(&self) -> &InitializerConfig {
        &self.initializer
    }

    pub fn refinement_config(&self) -> &RefinementConfig {
        &self.refinement
    }

    // =========================================================================
    // Inputs. Every change discards the field.
    // =========================================================================

    pub fn set_slice_params(&mut self, params: SliceParams) -> Result<()> {
        params.validate()?;
        self.slice_params = params;
        self.invalidate();
        Ok(())
    }

    pub fn add_landmark(&mut self, pair: LandmarkPair) {
        self.landmarks.push(pair);
        self.invalidate();
    }

    pub fn remove_last_landmark(&mut self) -> Option<LandmarkPair> {
        let removed = self.landmarks.remove_last();
        if removed.is_some() {
            self.invalidate();
        }
        removed
    }

    pub fn set_landmarks(&mut self, landmarks: LandmarkSet) {
        self.landmarks = landmarks;
        self.invalidate();
    }

    pub fn set_initializer_config(&mut self, config: InitializerConfig) -> Result<()> {
        config.validate()?;
        self.initializer = config;
        self.invalidate();
        Ok(())
    }

    pub fn set_refinement_config(&mut self, config: RefinementConfig) -> Result<()> {
        config.validate()?;
        self.refinement = config;
        self.invalidate();
        Ok(())
    }

    fn invalidate(&self) {
        let mut state = self.state.lock();
        state.initialization = None;
        state.seed = None;
        state.active = None;
        state.generation += 1;
        if state.refining {
            warn!(section = %self.id, "inputs changed during refinement, its result will be discarded");
        }
    }

    // =========================================================================
    // Alignment
    // =========================================================================

    /// Computes the affine seed and makes it the active field.
    pub fn initialize(&self) -> Result<Initialization> {
        let initialization = AffineInitializer::new(self.initializer.clone())
            .initialize(&self.slice_params, &self.landmarks)?;
        let field = DeformationField::from_affine(initialization.plane, initialization.seed)?;

        let mut state = self.state.lock();
        if state.refining {
            return Err(Error::RefinementInProgress { section: self.id });
        }
        state.initialization = Some(initialization.clone());
        state.seed = Some(field.clone());
        state.active = Some(field);
        Ok(initialization)
    }

    pub fn initialization(&self) -> Option<Initialization> {
        self.state.lock().initialization.clone()
    }

    /// Active field, if initialized. May be mid-refinement; see
    /// [`export_snapshot`](Self::export_snapshot) for the gated variant.
    pub fn field(&self) -> Option<DeformationField> {
        self.state.lock().active.clone()
    }

    pub fn seed_field(&self) -> Option<DeformationField> {
        self.state.lock().seed.clone()
    }

    pub fn is_refining(&self) -> bool {
        self.state.lock().refining
    }

    /// Active field for export. Fails while a refinement is running.
    pub fn export_snapshot(&self) -> Result<DeformationField> {
        let state = self.state.lock();
        if state.refining {
            return Err(Error::RefinementInProgress { section: self.id });
        }
        state
            .active
            .clone()
            .ok_or(Error::NotInitialized { section: self.id })
    }

    /// Replaces the active field with one adjusted by hand.
    pub fn apply_manual_adjustment(&self, field: DeformationField) -> Result<()> {
        if !field.is_finite() {
            return Err(Error::DegenerateTransform(
                "adjusted field contains non-finite values".to_string(),
            ));
        }
        let mut state = self.state.lock();
        if state.refining {
            return Err(Error::RefinementInProgress { section: self.id });
        }
        if state.seed.is_none() {
            return Err(Error::NotInitialized { section: self.id });
        }
        info!(section = %self.id, "manual adjustment applied");
        state.active = Some(field);
        Ok(())
    }

    /// Starts refinement on a blocking worker. Must be called inside a tokio runtime.
    ///
    /// The active field is reset to the affine seed for the duration of the
    /// run and replaced only if the run succeeds and the inputs did not change.
    pub fn start_refinement(
        &self,
        atlas: Arc<Atlas>,
        solver: Arc<dyn NonRigidSolver>,
    ) -> Result<RefinementHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::invalid("runtime", e.to_string()))?;
        let config = self.refinement.clone();
        config.validate()?;
        config.validate_landmarks(self.landmarks.len())?;

        let (seed, generation) = {
            let mut state = self.state.lock();
            if state.refining {
                return Err(Error::RefinementInProgress { section: self.id });
            }
            let seed = state
                .seed
                .clone()
                .ok_or(Error::NotInitialized { section: self.id })?;
            state.refining = true;
            state.active = Some(seed.clone());
            (seed, state.generation)
        };
        let guard = RefiningGuard(self.state.clone());

        let cancel = CancelToken::new();
        let log = EventLog::new();
        let (tx, rx) = unbounded_channel();
        let progress: ProgressCallback = {
            let log = log.clone();
            let f: Arc<dyn Fn(RefinementEvent) + Send + Sync> = Arc::new(move |event: RefinementEvent| {
                log.push(event.clone());
                let _ = tx.send(event);
            });
            SharedFn::new(f)
        };

        let section = self.id;
        let image = self.image.clone();
        let landmarks = self.landmarks.clone();
        let state = self.state.clone();
        let task_cancel = cancel.clone();

        let task = runtime.spawn_blocking(move || {
            let _guard = guard;
            let plane = *seed.plane();
            let result = atlas_problem(&atlas, &seed, &image, &landmarks, config)
                .and_then(|problem| refine(plane, &problem, solver.as_ref(), &task_cancel, &progress));

            let mut state = state.lock();
            match &result {
                Ok(outcome) if state.generation == generation => {
                    state.active = Some(outcome.field.clone());
                }
                Ok(_) => debug!(%section, "section changed during refinement, result dropped"),
                Err(_) if state.generation == generation => {
                    state.active = Some(seed);
                }
                Err(_) => {}
            }
            result
        });

        Ok(RefinementHandle {
            section,
            cancel,
            events: rx,
            log,
            task,
        })
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// SectionPixel -> DeviceStage transform of this section.
    pub fn stage_transform(&self, calibration: &StageCalibration) -> Result<AffineTransform> {
        calibration.section_transform(&self.bounds)
    }

    /// Converts a point using the bridges this section currently has.
    pub fn convert(
        &self,
        geometry: &AtlasGeometry,
        calibration: Option<&StageCalibration>,
        point: &Point,
        to: CoordinateFrame,
    ) -> Result<Point> {
        let field = self.field();
        let stage = calibration
            .map(|c| self.stage_transform(c))
            .transpose()?;

        let mut registry = FrameRegistry::new().with_atlas(geometry);
        if let Some(field) = &field {
            registry = registry.with_field(field);
        }
        if let Some(stage) = &stage {
            registry = registry.with_stage(stage)?;
        }
        registry.convert(point, point.frame, to)
    }
}

/// Builds the solver input: atlas intensities on the section plane, the
/// section image, and landmarks projected to plane coordinates.
fn atlas_problem(
    atlas: &Atlas,
    seed: &DeformationField,
    image: &Buffer2<f32>,
    landmarks: &LandmarkSet,
    config: RefinementConfig,
) -> Result<RefinementProblem> {
    let plane = seed.plane();
    let raster = plane.sample_reference(atlas.reference(), atlas.geometry().min_voxel_size())?;
    Ok(RefinementProblem {
        atlas: raster,
        section: image.clone(),
        seed: *seed.seed(),
        landmarks: landmarks
            .iter()
            .map(|pair| (plane.project(pair.atlas).0, pair.section))
            .collect(),
        config,
    })
}

/// Clears the run-in-progress flag when the worker ends, even by panic.
struct RefiningGuard(Arc<Mutex<SectionState>>);

impl Drop for RefiningGuard {
    fn drop(&mut self) {
        self.0.lock().refining = false;
    }
}

/// A running refinement.
///
/// Events arrive in order on [`next_event`](Self::next_event); the shared
/// [`log`](Self::log) holds every event emitted so far.
#[derive(Debug)]
pub struct RefinementHandle {
    section: SectionId,
    cancel: CancelToken,
    events: UnboundedReceiver<RefinementEvent>,
    log: EventLog,
    task: JoinHandle<Result<RefinementOutcome>>,
}

impl RefinementHandle {
    pub fn section(&self) -> SectionId {
        self.section
    }

    /// Requests cancellation; takes effect at the next iteration boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Next event, or `None` once the run has ended and all events were read.
    pub async fn next_event(&mut self) -> Option<RefinementEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<RefinementEvent> {
        self.events.try_recv().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the run to end.
    pub async fn finish(self) -> Result<RefinementOutcome> {
        self.task.await.map_err(|e| Error::RefinementFailed {
            reason: format!("refinement worker stopped: {e}"),
        })?
    }
}

#[cfg(test)]
mod tests;
