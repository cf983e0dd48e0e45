//! Pass execution engine
//!
//! This module records a [`Pass`] into one command buffer, submits it, and blocks
//! until the device reports completion. Compute pipelines are created once per
//! kernel and cached; bind groups are rebuilt per pass from its binding set.

use crate::{
    binding::BindingSet,
    context::GpuContext,
    error::{Error, Result},
    instrumentation::PassResult,
    kernel::{BindingClass, KernelProgram, SlotRole},
    pass::{Download, Pass, Stage, Upload},
    resource_pool::{ResourcePool, SlotExtent, map_blocking, upload_row_pitch},
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Sleep between device polls while waiting for a submission
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// A kernel compiled into a wgpu compute pipeline
#[derive(Debug)]
struct BoundProgram {
    /// The wgpu compute pipeline
    pipeline: wgpu::ComputePipeline,
    /// Explicit layout of bind group 0
    layout: wgpu::BindGroupLayout,
}

fn binding_type(class: BindingClass) -> wgpu::BindingType {
    match class {
        BindingClass::Image => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        BindingClass::StorageRead | BindingClass::StorageReadWrite => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: class == BindingClass::StorageRead,
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingClass::Uniform => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
    }
}

impl BoundProgram {
    /// Compiles a kernel with an explicit bind group layout built from its slots
    fn new(device: &wgpu::Device, kernel: &KernelProgram) -> Self {
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.name),
            source: wgpu::ShaderSource::Wgsl(kernel.shader.into()),
        });

        let mut bind_group_layout_entries: Vec<wgpu::BindGroupLayoutEntry> = kernel
            .slots
            .iter()
            .map(|slot| wgpu::BindGroupLayoutEntry {
                binding: slot.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: binding_type(slot.class),
                count: None,
            })
            .collect();
        bind_group_layout_entries.sort_by_key(|entry| entry.binding);

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(kernel.name),
            entries: &bind_group_layout_entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(kernel.name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.name),
            layout: Some(&pipeline_layout),
            module: &shader_module,
            entry_point: Some(kernel.entry_point),
            compilation_options: Default::default(),
            cache: None,
        });

        tracing::debug!(kernel = kernel.name, "compute pipeline created");
        Self { pipeline, layout }
    }

    /// Creates the bind group for one dispatch
    fn bind_group(&self, device: &wgpu::Device, pool: &ResourcePool<'_>, bindings: &BindingSet) -> Result<wgpu::BindGroup> {
        let mut bind_group_entries = Vec::with_capacity(bindings.entries().len());
        for bound in bindings.entries() {
            let resource = match bound.slot.class {
                BindingClass::Image => wgpu::BindingResource::TextureView(pool.image(bound.handle)?.1),
                _ => pool.buffer(bound.handle)?.as_entire_binding(),
            };
            bind_group_entries.push(wgpu::BindGroupEntry {
                binding: bound.slot.binding,
                resource,
            });
        }
        bind_group_entries.sort_by_key(|entry| entry.binding);

        Ok(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(bindings.kernel().name),
            layout: &self.layout,
            entries: &bind_group_entries,
        }))
    }
}

/// Query set and buffers used to time passes on the device
///
/// With encoder timestamps the five queries are: start, transfers in done,
/// dispatch begin, dispatch end, and end. Otherwise only the dispatch is timed.
#[derive(Debug)]
struct TimestampQueries {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    encoder_stamps: bool,
    period: f32,
}

impl TimestampQueries {
    fn new(ctx: &GpuContext) -> Option<Self> {
        if !ctx.supports_timestamps() {
            return None;
        }
        let encoder_stamps = ctx.supports_encoder_timestamps();
        let count = if encoder_stamps { 5 } else { 2 };
        let size = count as u64 * wgpu::QUERY_SIZE as u64;
        let device = ctx.device();

        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("pass timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count,
        });
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp resolve"),
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Some(Self {
            query_set,
            resolve,
            readback,
            encoder_stamps,
            period: ctx.queue().get_timestamp_period(),
        })
    }

    fn count(&self) -> u32 {
        if self.encoder_stamps { 5 } else { 2 }
    }

    fn dispatch_indices(&self) -> (u32, u32) {
        if self.encoder_stamps { (2, 3) } else { (0, 1) }
    }

    fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        let count = self.count();
        encoder.resolve_query_set(&self.query_set, 0..count, &self.resolve, 0);
        encoder.copy_buffer_to_buffer(&self.resolve, 0, &self.readback, 0, count as u64 * wgpu::QUERY_SIZE as u64);
    }

    fn read(&self, device: &wgpu::Device) -> Result<Vec<u64>> {
        let slice = self.readback.slice(..);
        map_blocking(device, &slice, wgpu::MapMode::Read)?;
        let ticks = {
            let view = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, u64>(&view).to_vec()
        };
        self.readback.unmap();
        Ok(ticks)
    }

    fn nanos(&self, begin: u64, end: u64) -> u64 {
        (end.saturating_sub(begin) as f64 * self.period as f64) as u64
    }
}

/// How long to wait for a submission and how often to re-arm the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Upper bound on one wait
    pub timeout: Duration,
    /// Additional waits with a fresh completion callback before giving up
    pub retries: u32,
}

/// Records, submits and waits for passes
#[derive(Debug)]
pub struct PassExecutor<'ctx> {
    ctx: &'ctx GpuContext,
    programs: HashMap<&'static str, BoundProgram>,
    timestamps: Option<TimestampQueries>,
    policy: WaitPolicy,
}

impl<'ctx> PassExecutor<'ctx> {
    /// Creates an executor
    ///
    /// Device timestamps are used when the device supports them.
    pub fn new(ctx: &'ctx GpuContext, policy: WaitPolicy) -> Self {
        let timestamps = TimestampQueries::new(ctx);
        tracing::debug!(
            device_timestamps = timestamps.is_some(),
            encoder_timestamps = timestamps.as_ref().is_some_and(|t| t.encoder_stamps),
            "pass executor created"
        );
        Self {
            ctx,
            programs: HashMap::new(),
            timestamps,
            policy,
        }
    }

    /// Executes one pass and blocks until it completes
    ///
    /// All slots of the pass are `InUse` while it runs and `Idle` afterwards, on
    /// success and failure alike.
    ///
    /// # Arguments
    /// * `pool` - Pool owning every slot the pass references
    /// * `pass` - The pass to execute
    ///
    /// # Returns
    /// Dispatch and transfer time of the pass
    pub fn execute(&mut self, pool: &mut ResourcePool<'_>, pass: &Pass) -> Result<PassResult> {
        let span = tracing::debug_span!("pass", label = pass.label());
        let _enter = span.enter();

        pass.validate()?;
        self.ctx.check_device()?;

        let slots = pass.slots();
        pool.mark_in_use(&slots)?;
        let result = self.record_and_submit(pool, pass);
        pool.mark_idle(&slots);

        if let Ok(result) = &result {
            tracing::debug!(exec_nanos = result.exec_nanos, transfer_nanos = result.transfer_nanos, "pass complete");
        }
        result
    }

    fn record_and_submit(&mut self, pool: &ResourcePool<'_>, pass: &Pass) -> Result<PassResult> {
        let ctx = self.ctx;
        let device = ctx.device();

        let bind_group = match pass.dispatch() {
            Some(dispatch) => {
                if let Some(params) = dispatch.bindings.handle(SlotRole::Parameters) {
                    pool.update_parameters(params, &dispatch.params)?;
                }
                let kernel = dispatch.bindings.kernel();
                let program = self.programs.entry(kernel.name).or_insert_with(|| BoundProgram::new(device, kernel));
                Some(program.bind_group(device, pool, &dispatch.bindings)?)
            }
            None => None,
        };

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(pass.label()) });
        let timestamps = self.timestamps.as_ref();
        let encoder_stamps = timestamps.filter(|t| t.encoder_stamps);
        let device_timed = encoder_stamps.is_some() || (timestamps.is_some() && pass.dispatch().is_some());

        if let Some(t) = encoder_stamps {
            encoder.write_timestamp(&t.query_set, 0);
        }

        let mut transfers_in_done = false;
        for stage in pass.stages() {
            if !transfers_in_done && matches!(stage, Stage::Dispatch(_) | Stage::PostDispatchBarrier(_) | Stage::Download(_)) {
                transfers_in_done = true;
                if let Some(t) = encoder_stamps {
                    encoder.write_timestamp(&t.query_set, 1);
                    if pass.dispatch().is_none() {
                        encoder.write_timestamp(&t.query_set, 2);
                        encoder.write_timestamp(&t.query_set, 3);
                    }
                }
            }

            match stage {
                Stage::Clear(slot) => encoder.clear_buffer(pool.buffer(slot)?, 0, None),
                Stage::Upload(upload) => record_upload(&mut encoder, pool, upload)?,
                Stage::PreDispatchBarrier(barrier) | Stage::PostDispatchBarrier(barrier) => {
                    encoder.insert_debug_marker(&format!("barrier {} {:?} -> {:?}", barrier.slot, barrier.before, barrier.after));
                }
                Stage::Dispatch(dispatch) => {
                    let kernel = dispatch.bindings.kernel();
                    let (Some(program), Some(bind_group)) = (self.programs.get(kernel.name), bind_group.as_ref()) else {
                        return Err(Error::BindingMismatch(format!("no pipeline prepared for {}", kernel.name)));
                    };
                    let timestamp_writes = timestamps.map(|t| {
                        let (begin, end) = t.dispatch_indices();
                        wgpu::ComputePassTimestampWrites {
                            query_set: &t.query_set,
                            beginning_of_pass_write_index: Some(begin),
                            end_of_pass_write_index: Some(end),
                        }
                    });

                    let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(kernel.name),
                        timestamp_writes,
                    });
                    compute_pass.set_pipeline(&program.pipeline);
                    compute_pass.set_bind_group(0, bind_group, &[]);
                    let (workgroup_x, workgroup_y) = dispatch.workgroups();
                    compute_pass.dispatch_workgroups(workgroup_x, workgroup_y, 1);
                }
                Stage::Download(download) => record_download(&mut encoder, pool, download)?,
            }
        }

        if let Some(t) = encoder_stamps {
            if !transfers_in_done {
                for index in 1..4 {
                    encoder.write_timestamp(&t.query_set, index);
                }
            }
            encoder.write_timestamp(&t.query_set, 4);
        }
        if let Some(t) = timestamps.filter(|_| device_timed) {
            t.resolve(&mut encoder);
        }

        let started = Instant::now();
        ctx.queue().submit(Some(encoder.finish()));
        self.wait_for_submission(pass.label())?;
        let wall_nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);

        let result = match timestamps.filter(|_| device_timed) {
            Some(t) => {
                let ticks = t.read(device)?;
                let (begin, end) = t.dispatch_indices();
                let exec_nanos = t.nanos(ticks[begin as usize], ticks[end as usize]);
                let transfer_nanos = if t.encoder_stamps {
                    t.nanos(ticks[0], ticks[1]).saturating_add(t.nanos(ticks[3], ticks[4]))
                } else if pass.has_transfers() {
                    wall_nanos.saturating_sub(exec_nanos)
                } else {
                    0
                };
                PassResult { exec_nanos, transfer_nanos }
            }
            None if pass.dispatch().is_some() => PassResult {
                exec_nanos: wall_nanos,
                transfer_nanos: 0,
            },
            None => PassResult {
                exec_nanos: 0,
                transfer_nanos: wall_nanos,
            },
        };
        Ok(result)
    }

    /// Blocks until the last submission completes
    ///
    /// A completion callback acts as the fence. When the wait exceeds the policy
    /// timeout it is re-armed with a fresh callback up to `retries` times.
    fn wait_for_submission(&self, label: &str) -> Result<()> {
        let device = self.ctx.device();
        wait_with_retries(
            &self.policy,
            label,
            || {
                let done = Arc::new(AtomicBool::new(false));
                let fence = Arc::clone(&done);
                self.ctx.queue().on_submitted_work_done(move || fence.store(true, Ordering::Release));
                done
            },
            || {
                device.poll(wgpu::PollType::Poll).map_err(|e| Error::DeviceLost(format!("poll failed: {e}")))?;
                self.ctx.check_device()
            },
        )
    }
}

/// Waits on fences produced by `arm`, driving progress with `poll`
///
/// Each attempt arms a fresh fence and polls until it signals or `policy.timeout`
/// elapses. After `policy.retries` re-armed attempts the wait fails with
/// `SubmissionTimeout`. Errors from `poll` end the wait immediately.
fn wait_with_retries(policy: &WaitPolicy, label: &str, mut arm: impl FnMut() -> Arc<AtomicBool>, mut poll: impl FnMut() -> Result<()>) -> Result<()> {
    let mut attempt = 0;
    loop {
        let done = arm();
        let deadline = Instant::now() + policy.timeout;
        loop {
            poll()?;
            if done.load(Ordering::Acquire) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        if attempt >= policy.retries {
            return Err(Error::SubmissionTimeout(format!("pass '{label}' did not complete within {:?}", policy.timeout)));
        }
        attempt += 1;
        tracing::warn!(label, attempt, retries = policy.retries, "submission timed out, re-arming completion fence");
    }
}

fn record_upload(encoder: &mut wgpu::CommandEncoder, pool: &ResourcePool<'_>, upload: &Upload) -> Result<()> {
    let staging = pool.buffer(upload.staging)?;
    match pool.extent(upload.destination)? {
        SlotExtent::Image { width, height, format } => {
            let (texture, _) = pool.image(upload.destination)?;
            let bytes_per_row = upload_row_pitch(width * format.bytes_per_pixel());
            if staging.size() < bytes_per_row as u64 * height as u64 {
                return Err(Error::InvalidAccess(format!("staging slot {} is too small for a {width}x{height} image", upload.staging)));
            }
            encoder.copy_buffer_to_texture(
                wgpu::TexelCopyBufferInfo {
                    buffer: staging,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(bytes_per_row),
                        rows_per_image: Some(height),
                    },
                },
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
        }
        SlotExtent::Bytes(_) => {
            let destination = pool.buffer(upload.destination)?;
            if staging.size() < destination.size() {
                return Err(Error::InvalidAccess(format!("staging slot {} is smaller than {}", upload.staging, upload.destination)));
            }
            encoder.copy_buffer_to_buffer(staging, 0, destination, 0, destination.size());
        }
    }
    Ok(())
}

fn record_download(encoder: &mut wgpu::CommandEncoder, pool: &ResourcePool<'_>, download: &Download) -> Result<()> {
    let source = pool.buffer(download.source)?;
    let staging = pool.buffer(download.staging)?;
    if staging.size() < source.size() {
        return Err(Error::InvalidAccess(format!("staging slot {} is smaller than {}", download.staging, download.source)));
    }
    encoder.copy_buffer_to_buffer(source, 0, staging, 0, source.size());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(retries: u32) -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_millis(2),
            retries,
        }
    }

    #[test]
    fn test_unsignalled_fence_times_out_after_every_retry() {
        for retries in [0, 1, 3] {
            let mut armed = 0;
            let result = wait_with_retries(
                &policy(retries),
                "stuck",
                || {
                    armed += 1;
                    Arc::new(AtomicBool::new(false))
                },
                || Ok(()),
            );
            assert!(matches!(result, Err(Error::SubmissionTimeout(_))), "{result:?}");
            assert_eq!(armed, retries + 1);
        }
    }

    #[test]
    fn test_rearmed_fence_can_still_complete() {
        let mut armed = 0;
        let result = wait_with_retries(
            &policy(2),
            "late",
            || {
                armed += 1;
                Arc::new(AtomicBool::new(armed == 2))
            },
            || Ok(()),
        );
        assert!(result.is_ok());
        assert_eq!(armed, 2);
    }

    #[test]
    fn test_device_fault_ends_the_wait() {
        let mut armed = 0;
        let result = wait_with_retries(
            &policy(5),
            "lost",
            || {
                armed += 1;
                Arc::new(AtomicBool::new(false))
            },
            || Err(Error::DeviceLost("gone".into())),
        );
        assert!(matches!(result, Err(Error::DeviceLost(_))));
        assert_eq!(armed, 1);
    }

    #[test]
    fn test_layout_entries_follow_binding_class() {
        assert!(matches!(
            binding_type(BindingClass::Image),
            wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            }
        ));
        assert!(matches!(
            binding_type(BindingClass::StorageRead),
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                ..
            }
        ));
        assert!(matches!(
            binding_type(BindingClass::StorageReadWrite),
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                ..
            }
        ));
        assert!(matches!(
            binding_type(BindingClass::Uniform),
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                ..
            }
        ));
    }
}
