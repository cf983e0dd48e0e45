//! Run configuration and execution
//!
//! A [`Run`] owns the frame sources and configuration of one filtering job. It
//! validates everything in [`Run::configure`] without touching the device, then
//! [`Run::run`] builds the resource pool and pass executor, walks the planned
//! steps, and releases every allocation on every exit path.

use crate::{
    binding::BindingSet,
    context::GpuContext,
    error::{Error, Result},
    frame::{Frame, FrameSource, PixelFormat},
    instrumentation::{Instrumentation, Totals},
    kernel::{AccumTexel, DispatchParams},
    pass::{Pass, PassBuilder},
    pass_executor::{PassExecutor, WaitPolicy},
    resource_pool::{AccessPattern, ResourcePool, SlotExtent, SlotHandle, SlotKind, pack_rows, upload_row_pitch},
    scheduler::{Lane, PassPlan, PlannedDispatch, StageTarget, Step, plan, uses_lane_b},
    topology::{Topology, TopologyKind},
};
use bytemuck::Zeroable;
use std::time::{Duration, Instant};

/// Configuration of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Filter shape and parameters
    pub topology: Topology,
    /// Overlap neighbour uploads with accumulation dispatches (two-pass only)
    pub overlap: bool,
    /// Upper bound on the wait for one submission
    pub submission_timeout: Duration,
    /// Extra waits with a fresh fence before a timeout becomes fatal
    pub timeout_retries: u32,
    /// Maximum number of live device slots
    pub max_slots: usize,
    /// Download the final accumulation buffer of a two-pass run
    pub capture_accumulation: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            overlap: false,
            submission_timeout: Duration::from_secs(10),
            timeout_retries: 0,
            max_slots: 32,
            capture_accumulation: false,
        }
    }
}

impl RunConfig {
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_overlap(mut self, overlap: bool) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_submission_timeout(mut self, timeout: Duration) -> Self {
        self.submission_timeout = timeout;
        self
    }

    pub fn with_timeout_retries(mut self, retries: u32) -> Self {
        self.timeout_retries = retries;
        self
    }

    pub fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = max_slots;
        self
    }

    pub fn with_capture_accumulation(mut self, capture: bool) -> Self {
        self.capture_accumulation = capture;
        self
    }
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Output frames in the input pixel format, one per input frame for the
    /// single-pass topology and exactly one for the two-pass topology
    pub frames: Vec<Frame>,
    /// The same outputs as read back from the device, before format conversion
    pub float_pixels: Vec<Vec<[f32; 4]>>,
    /// Timing counters
    pub totals: Totals,
    /// Final accumulation texels, when captured
    pub accumulation: Option<Vec<AccumTexel>>,
    /// Number of executed passes
    pub passes: usize,
}

/// A configured filtering job
pub struct Run {
    config: RunConfig,
    sources: Vec<Box<dyn FrameSource>>,
    steps: Vec<Step>,
    outstanding: usize,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("config", &self.config)
            .field("sources", &self.sources.iter().map(|source| source.label()).collect::<Vec<_>>())
            .field("steps", &self.steps.len())
            .field("outstanding", &self.outstanding)
            .finish()
    }
}

impl Run {
    /// Validates a configuration and plans the run
    ///
    /// No device resource is touched; invalid parameters, an empty frame list and
    /// overlap with the single-pass topology fail with `FatalConfiguration`.
    ///
    /// # Arguments
    /// * `config` - Topology, scheduling and limits
    /// * `sources` - Ordered input frames; for the two-pass topology frame 0 is the target
    pub fn configure(config: RunConfig, sources: Vec<Box<dyn FrameSource>>) -> Result<Self> {
        config.topology.validate()?;
        if config.submission_timeout.is_zero() {
            return Err(Error::FatalConfiguration("submission timeout must be non-zero".to_string()));
        }
        if config.max_slots == 0 {
            return Err(Error::FatalConfiguration("max_slots must be non-zero".to_string()));
        }
        let steps = plan(config.topology.kind(), config.overlap, sources.len(), config.capture_accumulation)?;
        tracing::debug!(topology = ?config.topology, overlap = config.overlap, frames = sources.len(), steps = steps.len(), "run configured");
        Ok(Self {
            config,
            sources,
            steps,
            outstanding: 0,
        })
    }

    /// The validated configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The planned steps
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Live device allocations left by the last run
    pub fn outstanding_allocations(&self) -> usize {
        self.outstanding
    }

    /// Executes the run
    ///
    /// Runs may be repeated; no state carries over between them.
    ///
    /// # Arguments
    /// * `ctx` - Device context the run allocates from
    ///
    /// # Returns
    /// Output frames and instrumentation totals
    pub fn run(&mut self, ctx: &GpuContext) -> Result<RunOutput> {
        let span = tracing::info_span!("run", topology = ?self.config.topology.kind(), overlap = self.config.overlap, frames = self.sources.len());
        let _enter = span.enter();

        let mut pool = ResourcePool::new(ctx, self.config.max_slots);
        let policy = WaitPolicy {
            timeout: self.config.submission_timeout,
            retries: self.config.timeout_retries,
        };
        let mut driver = Driver {
            config: &self.config,
            sources: &self.sources,
            executor: PassExecutor::new(ctx, policy),
            instrumentation: Instrumentation::new(),
            first: None,
            slots: None,
            output: RunOutput {
                frames: Vec::new(),
                float_pixels: Vec::new(),
                totals: Totals::default(),
                accumulation: None,
                passes: 0,
            },
        };

        let result = driver.execute(&mut pool, &self.steps);
        let totals = driver.instrumentation.totals();
        let mut output = driver.output;

        pool.release_all();
        self.outstanding = pool.outstanding();

        match result {
            Ok(()) => {
                output.totals = totals;
                output.passes = totals.passes;
                tracing::info!(passes = totals.passes, exec = ?totals.exec(), transfer = ?totals.transfer(), "run complete");
                Ok(output)
            }
            Err(e) => {
                tracing::error!(device_fault = e.is_device_fault(), "run aborted: {e}");
                Err(e)
            }
        }
    }
}

/// Device slots of a neighbour lane
#[derive(Debug, Clone, Copy)]
struct LaneSlots {
    staging: SlotHandle,
    buffer: SlotHandle,
}

/// Bindings for the two-pass topology
#[derive(Debug)]
struct TwoPassBindings {
    accumulate: [Option<BindingSet>; 2],
    normalize: BindingSet,
}

/// Every slot of a run, allocated once frame 0 is known
#[derive(Debug)]
struct RunSlots {
    image_staging: SlotHandle,
    image: SlotHandle,
    output: SlotHandle,
    output_readback: SlotHandle,
    accumulation: Option<SlotHandle>,
    accumulation_readback: Option<SlotHandle>,
    lanes: [Option<LaneSlots>; 2],
    single_pass: Option<BindingSet>,
    two_pass: Option<TwoPassBindings>,
    dispatch_params: DispatchParams,
}

fn lane_index(lane: Lane) -> usize {
    match lane {
        Lane::A => 0,
        Lane::B => 1,
    }
}

impl RunSlots {
    fn allocate(pool: &mut ResourcePool<'_>, config: &RunConfig, frame: &Frame, lane_b: bool) -> Result<Self> {
        let (width, height, format) = (frame.width(), frame.height(), frame.format());
        let pixels = frame.pixel_count() as u64;
        let float_bytes = pixels * 16;

        let params = pool.allocate(SlotKind::Parameters, SlotExtent::Bytes(DispatchParams::SIZE), AccessPattern::DeviceOnly)?;
        let image_staging = pool.allocate(
            SlotKind::TransferSource,
            SlotExtent::Bytes(upload_row_pitch(frame.row_bytes()) as u64 * height as u64),
            AccessPattern::HostWrite,
        )?;
        let image = pool.allocate(SlotKind::ComputeInputImage, SlotExtent::Image { width, height, format }, AccessPattern::DeviceOnly)?;
        let output = pool.allocate(SlotKind::ComputeOutput, SlotExtent::Bytes(float_bytes), AccessPattern::DeviceOnly)?;
        let output_readback = pool.allocate(SlotKind::TransferDestination, SlotExtent::Bytes(float_bytes), AccessPattern::HostRead)?;

        let mut slots = Self {
            image_staging,
            image,
            output,
            output_readback,
            accumulation: None,
            accumulation_readback: None,
            lanes: [None, None],
            single_pass: None,
            two_pass: None,
            dispatch_params: config.topology.dispatch_params(width, height, format == PixelFormat::Rgba8Unorm),
        };

        match config.topology.kind() {
            TopologyKind::SinglePass => {
                slots.single_pass = Some(BindingSet::build_single_pass(output, image, params)?);
            }
            TopologyKind::TwoPass => {
                let accumulation_bytes = pixels * AccumTexel::STRIDE;
                let accumulation = pool.allocate(SlotKind::Accumulation, SlotExtent::Bytes(accumulation_bytes), AccessPattern::DeviceOnly)?;
                slots.accumulation = Some(accumulation);
                if config.capture_accumulation {
                    slots.accumulation_readback = Some(pool.allocate(SlotKind::TransferDestination, SlotExtent::Bytes(accumulation_bytes), AccessPattern::HostRead)?);
                }

                let lane_bytes = pixels * format.bytes_per_pixel() as u64;
                let lanes: &[Lane] = if lane_b { &[Lane::A, Lane::B] } else { &[Lane::A] };
                let mut accumulate = [None, None];
                for &lane in lanes {
                    let staging = pool.allocate(SlotKind::TransferSource, SlotExtent::Bytes(lane_bytes), AccessPattern::HostWrite)?;
                    let buffer = pool.allocate(SlotKind::ComputeInputBuffer, SlotExtent::Bytes(lane_bytes), AccessPattern::DeviceOnly)?;
                    slots.lanes[lane_index(lane)] = Some(LaneSlots { staging, buffer });
                    accumulate[lane_index(lane)] = Some(BindingSet::build_accumulation(accumulation, image, buffer, params)?);
                }
                slots.two_pass = Some(TwoPassBindings {
                    accumulate,
                    normalize: BindingSet::build_normalization(output, accumulation, params)?,
                });
            }
        }
        Ok(slots)
    }

    fn lane(&self, lane: Lane) -> Result<LaneSlots> {
        self.lanes[lane_index(lane)].ok_or_else(|| Error::FatalConfiguration(format!("neighbour lane {lane:?} is not allocated")))
    }

    fn accumulation(&self) -> Result<SlotHandle> {
        self.accumulation.ok_or_else(|| Error::FatalConfiguration("the single-pass topology has no accumulation buffer".to_string()))
    }

    fn bindings(&self, dispatch: PlannedDispatch) -> Result<BindingSet> {
        let missing = || Error::FatalConfiguration(format!("no bindings for {dispatch:?} in this topology"));
        let bindings = match dispatch {
            PlannedDispatch::Bilateral => self.single_pass.as_ref(),
            PlannedDispatch::Accumulate { lane } => self.two_pass.as_ref().and_then(|two_pass| two_pass.accumulate[lane_index(lane)].as_ref()),
            PlannedDispatch::Normalize => self.two_pass.as_ref().map(|two_pass| &two_pass.normalize),
        };
        bindings.cloned().ok_or_else(missing)
    }
}

/// Executes planned steps against one pool
struct Driver<'run, 'ctx> {
    config: &'run RunConfig,
    sources: &'run [Box<dyn FrameSource>],
    executor: PassExecutor<'ctx>,
    instrumentation: Instrumentation,
    first: Option<Frame>,
    slots: Option<RunSlots>,
    output: RunOutput,
}

impl Driver<'_, '_> {
    fn execute(&mut self, pool: &mut ResourcePool<'_>, steps: &[Step]) -> Result<()> {
        let first = self.load(0)?;
        self.slots = Some(RunSlots::allocate(pool, self.config, &first, uses_lane_b(steps))?);
        self.first = Some(first);

        let mut executed = 0;
        for step in steps {
            match *step {
                Step::Enter(state) => tracing::info!(?state, "scheduler phase"),
                Step::Stage { frame, target } => self.stage(pool, frame, target)?,
                Step::Execute(plan) => {
                    let pass = self.build_pass(&plan, executed)?;
                    let result = self.executor.execute(pool, &pass)?;
                    self.instrumentation.record(result);
                    executed += 1;
                    if plan.download_accumulation {
                        self.read_accumulation(pool)?;
                    }
                }
                Step::Collect { output } => self.collect(pool, output)?,
            }
        }
        Ok(())
    }

    fn slots(&self) -> Result<&RunSlots> {
        self.slots.as_ref().ok_or_else(|| Error::FatalConfiguration("run slots are not allocated".to_string()))
    }

    fn first(&self) -> Result<&Frame> {
        self.first.as_ref().ok_or_else(|| Error::FatalConfiguration("frame 0 is not loaded".to_string()))
    }

    fn load(&self, index: usize) -> Result<Frame> {
        let source = self
            .sources
            .get(index)
            .ok_or_else(|| Error::FatalConfiguration(format!("frame {index} is out of range")))?;
        let frame = source.load_frame().map_err(|source_error| Error::FrameSource {
            label: source.label(),
            source: source_error,
        })?;
        tracing::debug!(index, shape = %frame.shape(), "frame loaded");
        Ok(frame)
    }

    fn frame(&self, index: usize) -> Result<Frame> {
        if index == 0 {
            return self.first().cloned();
        }
        let frame = self.load(index)?;
        let first = self.first()?;
        if (frame.width(), frame.height(), frame.format()) != (first.width(), first.height(), first.format()) {
            return Err(Error::FrameMismatch {
                index,
                expected: first.shape(),
                found: frame.shape(),
            });
        }
        Ok(frame)
    }

    fn stage(&mut self, pool: &ResourcePool<'_>, index: usize, target: StageTarget) -> Result<()> {
        let frame = self.frame(index)?;
        let slots = self.slots()?;
        let started = Instant::now();
        match target {
            StageTarget::Image => pool.write(slots.image_staging, &pack_rows(frame.data(), frame.row_bytes(), frame.height()))?,
            StageTarget::Lane(lane) => pool.write(slots.lane(lane)?.staging, frame.data())?,
        }
        self.instrumentation.record_host_transfer(started.elapsed());
        Ok(())
    }

    fn build_pass(&self, plan: &PassPlan, index: usize) -> Result<Pass> {
        let slots = self.slots()?;
        let first = self.first()?;
        let mut builder = PassBuilder::new(format!("#{index} {plan}"));
        if plan.clear_accumulation {
            builder = builder.clear(slots.accumulation()?);
        }
        if plan.upload_image {
            builder = builder.upload(slots.image_staging, slots.image);
        }
        if let Some(lane) = plan.upload_lane {
            let lane = slots.lane(lane)?;
            builder = builder.upload(lane.staging, lane.buffer);
        }
        if let Some(dispatch) = plan.dispatch {
            builder = builder.dispatch(slots.bindings(dispatch)?, first.width(), first.height(), slots.dispatch_params);
        }
        if plan.download_output {
            builder = builder.download(slots.output, slots.output_readback);
        }
        if plan.download_accumulation {
            let readback = slots
                .accumulation_readback
                .ok_or_else(|| Error::FatalConfiguration("accumulation capture is disabled".to_string()))?;
            builder = builder.download(slots.accumulation()?, readback);
        }
        builder.build()
    }

    fn collect(&mut self, pool: &ResourcePool<'_>, index: usize) -> Result<()> {
        let first = self.first()?;
        let (width, height, format) = (first.width(), first.height(), first.format());
        let slots = self.slots()?;

        let started = Instant::now();
        let mut pixels = vec![[0f32; 4]; first.pixel_count()];
        pool.read(slots.output_readback, bytemuck::cast_slice_mut(&mut pixels))?;
        self.instrumentation.record_host_transfer(started.elapsed());

        let frame = Frame::from_float_pixels(width, height, format, &pixels)?;
        tracing::debug!(index, shape = %frame.shape(), "output collected");
        self.output.frames.push(frame);
        self.output.float_pixels.push(pixels);
        Ok(())
    }

    fn read_accumulation(&mut self, pool: &ResourcePool<'_>) -> Result<()> {
        let slots = self.slots()?;
        let readback = slots
            .accumulation_readback
            .ok_or_else(|| Error::FatalConfiguration("accumulation capture is disabled".to_string()))?;

        let started = Instant::now();
        let mut texels = vec![AccumTexel::zeroed(); self.first()?.pixel_count()];
        pool.read(readback, bytemuck::cast_slice_mut(&mut texels))?;
        self.instrumentation.record_host_transfer(started.elapsed());
        self.output.accumulation = Some(texels);
        Ok(())
    }
}
