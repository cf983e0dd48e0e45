//! Device resource pool
//!
//! The pool is the sole owner of every buffer and image used by a run. Other
//! components hold generation-checked [`SlotHandle`]s and borrow the underlying
//! wgpu objects only while recording a submission. Releasing is idempotent, and
//! [`ResourcePool::release_all`] runs again on drop so no allocation outlives the
//! pool on any exit path.

use crate::{
    context::GpuContext,
    error::{Error, Result},
    frame::PixelFormat,
    kernel::DispatchParams,
};
use std::fmt;

/// Row pitch alignment required for buffer-to-image copies
pub const COPY_BYTES_PER_ROW_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// What a slot is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Host-written staging buffer copied into device resources
    TransferSource,
    /// Staging buffer that device results are copied into for host reads
    TransferDestination,
    /// Storage buffer a kernel writes its output pixels to
    ComputeOutput,
    /// Sampled image a kernel reads pixels from
    ComputeInputImage,
    /// Storage buffer a kernel reads raw pixels from (buffer-as-texture)
    ComputeInputBuffer,
    /// Per-pixel (weighted color sum, weight) storage buffer
    Accumulation,
    /// Uniform buffer of per-dispatch scalar parameters
    Parameters,
}

impl SlotKind {
    /// Whether slots of this kind are device images rather than buffers
    pub fn is_image(self) -> bool {
        self == SlotKind::ComputeInputImage
    }

    fn buffer_usage(self) -> wgpu::BufferUsages {
        use wgpu::BufferUsages as U;
        match self {
            SlotKind::TransferSource => U::COPY_SRC,
            SlotKind::TransferDestination => U::COPY_DST,
            SlotKind::ComputeOutput => U::STORAGE | U::COPY_SRC,
            SlotKind::ComputeInputBuffer => U::STORAGE | U::COPY_DST,
            SlotKind::Accumulation => U::STORAGE | U::COPY_DST | U::COPY_SRC,
            SlotKind::Parameters => U::UNIFORM | U::COPY_DST,
            SlotKind::ComputeInputImage => U::empty(),
        }
    }

    fn is_storage(self) -> bool {
        matches!(self, SlotKind::ComputeOutput | SlotKind::ComputeInputBuffer | SlotKind::Accumulation)
    }
}

/// How the host intends to touch a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessPattern {
    /// The host writes the slot directly
    HostWrite,
    /// The host reads the slot directly
    HostRead,
    /// Only the device touches the slot
    DeviceOnly,
}

/// Memory residency chosen for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    /// Host-visible, mappable for writing
    HostUpload,
    /// Host-visible, mappable for reading
    HostReadback,
    /// Device-local, not mappable
    DeviceLocal,
}

impl Residency {
    /// Whether the host can map slots with this residency
    pub fn is_host_visible(self) -> bool {
        self != Residency::DeviceLocal
    }
}

/// Picks the cheapest residency satisfying `access` for `kind`
///
/// Staging kinds map directly; other buffer kinds can only be host-visible when
/// the device has `MAPPABLE_PRIMARY_BUFFERS`. Images are never host-visible.
pub fn select_residency(kind: SlotKind, access: AccessPattern, features: wgpu::Features) -> Result<Residency> {
    let mappable_primary = features.contains(wgpu::Features::MAPPABLE_PRIMARY_BUFFERS);
    match (access, kind) {
        (AccessPattern::DeviceOnly, _) => Ok(Residency::DeviceLocal),
        (_, SlotKind::ComputeInputImage) => Err(Error::ResourceExhausted(format!("no memory type satisfies {access:?} access for {kind:?}: images are never host-visible"))),
        (AccessPattern::HostWrite, SlotKind::TransferSource) => Ok(Residency::HostUpload),
        (AccessPattern::HostRead, SlotKind::TransferDestination) => Ok(Residency::HostReadback),
        (AccessPattern::HostWrite, _) if mappable_primary => Ok(Residency::HostUpload),
        (AccessPattern::HostRead, _) if mappable_primary => Ok(Residency::HostReadback),
        _ => Err(Error::ResourceExhausted(format!("no memory type satisfies {access:?} access for {kind:?}"))),
    }
}

/// Size of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotExtent {
    /// A buffer of this many bytes
    Bytes(u64),
    /// A 2D image
    Image { width: u32, height: u32, format: PixelFormat },
}

/// Lifecycle of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No device resource exists for the handle
    Unallocated,
    /// Allocated and not yet used by a submission
    Bound,
    /// Referenced by an in-flight submission
    InUse,
    /// Used by a completed submission
    Idle,
    /// Released; the handle is stale
    Released,
}

/// Generation-checked reference to a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
    kind: SlotKind,
}

impl SlotHandle {
    /// Kind the slot was allocated with
    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    /// A handle that was never allocated by any pool
    ///
    /// Releasing it is a no-op and every other pool operation rejects it.
    pub fn dangling(kind: SlotKind) -> Self {
        Self {
            index: u32::MAX,
            generation: 0,
            kind,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(index: u32, kind: SlotKind) -> Self {
        Self { index, generation: 1, kind }
    }
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}.{}", self.kind, self.index, self.generation)
    }
}

#[derive(Debug)]
enum SlotResource {
    Buffer(wgpu::Buffer),
    Image { texture: wgpu::Texture, view: wgpu::TextureView },
}

#[derive(Debug)]
struct SlotEntry {
    generation: u32,
    state: SlotState,
    kind: SlotKind,
    residency: Residency,
    extent: SlotExtent,
    resource: Option<SlotResource>,
}

/// Rounds `row_bytes` up to the buffer-to-image copy row alignment
pub fn upload_row_pitch(row_bytes: u32) -> u32 {
    row_bytes.div_ceil(COPY_BYTES_PER_ROW_ALIGNMENT) * COPY_BYTES_PER_ROW_ALIGNMENT
}

/// Copies tightly packed rows into a buffer with [`upload_row_pitch`] stride
///
/// # Arguments
/// * `data` - `row_bytes * height` bytes of row-major pixels
/// * `row_bytes` - Unpadded bytes per row
/// * `height` - Number of rows
pub fn pack_rows(data: &[u8], row_bytes: u32, height: u32) -> Vec<u8> {
    let pitch = upload_row_pitch(row_bytes) as usize;
    let row_bytes = row_bytes as usize;
    let mut packed = vec![0u8; pitch * height as usize];
    for (dst, src) in packed.chunks_exact_mut(pitch).zip(data.chunks_exact(row_bytes)) {
        dst[..row_bytes].copy_from_slice(src);
    }
    packed
}

/// Maps a buffer slice and blocks until the mapping completes
pub(crate) fn map_blocking(device: &wgpu::Device, slice: &wgpu::BufferSlice<'_>, mode: wgpu::MapMode) -> Result<()> {
    let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
    slice.map_async(mode, move |v| {
        let _ = sender.send(v);
    });
    device.poll(wgpu::PollType::Wait).map_err(|e| Error::DeviceLost(format!("poll failed while mapping: {e}")))?;
    match pollster::block_on(receiver.receive()) {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(Error::DeviceLost(format!("buffer map failed: {e}"))),
        None => Err(Error::DeviceLost("buffer map callback was dropped".to_string())),
    }
}

/// Owner of every device allocation made during a run
#[derive(Debug)]
pub struct ResourcePool<'ctx> {
    ctx: &'ctx GpuContext,
    max_slots: usize,
    entries: Vec<SlotEntry>,
    free: Vec<u32>,
}

impl<'ctx> ResourcePool<'ctx> {
    /// Creates an empty pool allowing at most `max_slots` live allocations
    pub fn new(ctx: &'ctx GpuContext, max_slots: usize) -> Self {
        Self {
            ctx,
            max_slots,
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Allocates a buffer or image
    ///
    /// # Arguments
    /// * `kind` - What the slot is used for
    /// * `extent` - Byte size for buffers, dimensions for images
    /// * `access` - Host access pattern, which determines residency
    ///
    /// # Returns
    /// A handle to the new slot in the `Bound` state
    pub fn allocate(&mut self, kind: SlotKind, extent: SlotExtent, access: AccessPattern) -> Result<SlotHandle> {
        let residency = select_residency(kind, access, self.ctx.features())?;
        self.check_limits(kind, extent)?;

        let label = format!("{kind:?} slot");
        let device = self.ctx.device();
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

        let resource = match extent {
            SlotExtent::Bytes(size) => {
                let usage = kind.buffer_usage()
                    | match residency {
                        Residency::HostUpload => wgpu::BufferUsages::MAP_WRITE,
                        Residency::HostReadback => wgpu::BufferUsages::MAP_READ,
                        Residency::DeviceLocal => wgpu::BufferUsages::empty(),
                    };
                SlotResource::Buffer(device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&label),
                    size: size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
                    usage,
                    mapped_at_creation: false,
                }))
            }
            SlotExtent::Image { width, height, format } => {
                let texture = device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(&label),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: format.texture_format(),
                    usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                });
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                SlotResource::Image { texture, view }
            }
        };

        let out_of_memory = pollster::block_on(device.pop_error_scope());
        let invalid = pollster::block_on(device.pop_error_scope());
        if let Some(error) = out_of_memory.or(invalid) {
            return Err(Error::ResourceExhausted(format!("device rejected {kind:?} allocation of {extent:?}: {error}")));
        }

        let (index, generation) = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.generation += 1;
                entry.state = SlotState::Unallocated;
                (index, entry.generation)
            }
            None => {
                self.entries.push(SlotEntry {
                    generation: 1,
                    state: SlotState::Unallocated,
                    kind,
                    residency,
                    extent,
                    resource: None,
                });
                (self.entries.len() as u32 - 1, 1)
            }
        };

        let entry = &mut self.entries[index as usize];
        entry.kind = kind;
        entry.residency = residency;
        entry.extent = extent;
        entry.resource = Some(resource);
        entry.state = SlotState::Bound;

        let handle = SlotHandle { index, generation, kind };
        tracing::debug!(slot = %handle, ?extent, ?residency, "allocated");
        Ok(handle)
    }

    fn check_limits(&self, kind: SlotKind, extent: SlotExtent) -> Result<()> {
        if self.outstanding() >= self.max_slots {
            return Err(Error::ResourceExhausted(format!("slot limit of {} reached", self.max_slots)));
        }

        let limits = self.ctx.limits();
        match extent {
            SlotExtent::Bytes(_) if kind.is_image() => Err(Error::InvalidAccess(format!("{kind:?} needs image dimensions, not a byte size"))),
            SlotExtent::Image { .. } if !kind.is_image() => Err(Error::InvalidAccess(format!("{kind:?} needs a byte size, not image dimensions"))),
            SlotExtent::Bytes(0) => Err(Error::InvalidAccess(format!("zero-sized {kind:?} buffer"))),
            SlotExtent::Bytes(size) if size > limits.max_buffer_size => Err(Error::ResourceExhausted(format!("{size} bytes exceeds max_buffer_size {}", limits.max_buffer_size))),
            SlotExtent::Bytes(size) if kind.is_storage() && size > limits.max_storage_buffer_binding_size as u64 => Err(Error::ResourceExhausted(format!(
                "{size} bytes exceeds max_storage_buffer_binding_size {}",
                limits.max_storage_buffer_binding_size
            ))),
            SlotExtent::Bytes(size) if kind == SlotKind::Parameters && size > limits.max_uniform_buffer_binding_size as u64 => Err(Error::ResourceExhausted(format!(
                "{size} bytes exceeds max_uniform_buffer_binding_size {}",
                limits.max_uniform_buffer_binding_size
            ))),
            SlotExtent::Image { width, height, .. } if width == 0 || height == 0 => Err(Error::InvalidAccess(format!("zero-sized {width}x{height} image"))),
            SlotExtent::Image { width, height, .. } if width.max(height) > limits.max_texture_dimension_2d => Err(Error::ResourceExhausted(format!(
                "{width}x{height} image exceeds max_texture_dimension_2d {}",
                limits.max_texture_dimension_2d
            ))),
            _ => Ok(()),
        }
    }

    fn entry(&self, handle: SlotHandle) -> Result<&SlotEntry> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation && entry.resource.is_some())
            .ok_or_else(|| Error::InvalidAccess(format!("slot {handle} is not allocated")))
    }

    fn entry_mut(&mut self, handle: SlotHandle) -> Result<&mut SlotEntry> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation && entry.resource.is_some())
            .ok_or_else(|| Error::InvalidAccess(format!("slot {handle} is not allocated")))
    }

    fn host_buffer(&self, handle: SlotHandle, residency: Residency) -> Result<&wgpu::Buffer> {
        let entry = self.entry(handle)?;
        if entry.residency != residency {
            return Err(Error::InvalidAccess(format!("slot {handle} is {:?}, host access needs {residency:?}", entry.residency)));
        }
        if entry.state == SlotState::InUse {
            return Err(Error::InvalidAccess(format!("slot {handle} is in use by a submission")));
        }
        self.buffer(handle)
    }

    /// Copies `data` into a host-visible upload slot
    ///
    /// Fails with `InvalidAccess` for device-local slots, in-flight slots, or data
    /// larger than the slot.
    pub fn write(&self, handle: SlotHandle, data: &[u8]) -> Result<()> {
        let buffer = self.host_buffer(handle, Residency::HostUpload)?;
        if data.len() as u64 > buffer.size() {
            return Err(Error::InvalidAccess(format!("{} bytes do not fit slot {handle} of {} bytes", data.len(), buffer.size())));
        }
        if data.is_empty() {
            return Ok(());
        }

        let mapped_len = (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let slice = buffer.slice(..mapped_len);
        map_blocking(self.ctx.device(), &slice, wgpu::MapMode::Write)?;
        {
            let mut view = slice.get_mapped_range_mut();
            view[..data.len()].copy_from_slice(data);
        }
        buffer.unmap();
        Ok(())
    }

    /// Copies the start of a host-visible readback slot into `host`
    ///
    /// Fails with `InvalidAccess` for device-local slots, in-flight slots, or a
    /// destination larger than the slot.
    pub fn read(&self, handle: SlotHandle, host: &mut [u8]) -> Result<()> {
        let buffer = self.host_buffer(handle, Residency::HostReadback)?;
        if host.len() as u64 > buffer.size() {
            return Err(Error::InvalidAccess(format!("cannot read {} bytes from slot {handle} of {} bytes", host.len(), buffer.size())));
        }
        if host.is_empty() {
            return Ok(());
        }

        let mapped_len = (host.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let slice = buffer.slice(..mapped_len);
        map_blocking(self.ctx.device(), &slice, wgpu::MapMode::Read)?;
        {
            let view = slice.get_mapped_range();
            host.copy_from_slice(&view[..host.len()]);
        }
        buffer.unmap();
        Ok(())
    }

    /// Stages new dispatch parameters into a `Parameters` slot
    ///
    /// The write is ordered before the next queue submission.
    pub fn update_parameters(&self, handle: SlotHandle, params: &DispatchParams) -> Result<()> {
        if handle.kind != SlotKind::Parameters {
            return Err(Error::InvalidAccess(format!("slot {handle} does not hold dispatch parameters")));
        }
        let buffer = self.buffer(handle)?;
        self.ctx.queue().write_buffer(buffer, 0, bytemuck::bytes_of(params));
        Ok(())
    }

    /// The wgpu buffer behind a buffer slot
    pub fn buffer(&self, handle: SlotHandle) -> Result<&wgpu::Buffer> {
        match &self.entry(handle)?.resource {
            Some(SlotResource::Buffer(buffer)) => Ok(buffer),
            _ => Err(Error::InvalidAccess(format!("slot {handle} is not a buffer"))),
        }
    }

    /// The wgpu texture and view behind an image slot
    pub fn image(&self, handle: SlotHandle) -> Result<(&wgpu::Texture, &wgpu::TextureView)> {
        match &self.entry(handle)?.resource {
            Some(SlotResource::Image { texture, view }) => Ok((texture, view)),
            _ => Err(Error::InvalidAccess(format!("slot {handle} is not an image"))),
        }
    }

    /// Extent the slot was allocated with
    pub fn extent(&self, handle: SlotHandle) -> Result<SlotExtent> {
        Ok(self.entry(handle)?.extent)
    }

    /// Residency chosen for the slot
    pub fn residency(&self, handle: SlotHandle) -> Result<Residency> {
        Ok(self.entry(handle)?.residency)
    }

    /// Current lifecycle state of `handle`
    pub fn state(&self, handle: SlotHandle) -> SlotState {
        match self.entries.get(handle.index as usize) {
            None => SlotState::Unallocated,
            Some(entry) if entry.generation == handle.generation => entry.state,
            Some(entry) if entry.generation > handle.generation => SlotState::Released,
            Some(_) => SlotState::Unallocated,
        }
    }

    /// Marks slots as referenced by an in-flight submission
    ///
    /// Fails without changing any state if a handle is stale or already in use.
    pub fn mark_in_use(&mut self, handles: &[SlotHandle]) -> Result<()> {
        for (i, handle) in handles.iter().enumerate() {
            if handles[..i].contains(handle) {
                continue;
            }
            if self.entry(*handle)?.state == SlotState::InUse {
                return Err(Error::InvalidAccess(format!("slot {handle} is already in use")));
            }
        }
        for handle in handles {
            self.entry_mut(*handle)?.state = SlotState::InUse;
        }
        Ok(())
    }

    /// Marks slots as no longer referenced by a submission
    pub fn mark_idle(&mut self, handles: &[SlotHandle]) {
        for handle in handles {
            if let Ok(entry) = self.entry_mut(*handle) {
                if entry.state == SlotState::InUse {
                    entry.state = SlotState::Idle;
                }
            }
        }
    }

    /// Releases a slot
    ///
    /// Releasing a stale, already released or never allocated handle is a no-op.
    pub fn release(&mut self, handle: SlotHandle) {
        let Ok(entry) = self.entry_mut(handle) else {
            return;
        };
        if let Some(resource) = entry.resource.take() {
            match resource {
                SlotResource::Buffer(buffer) => buffer.destroy(),
                SlotResource::Image { texture, .. } => texture.destroy(),
            }
        }
        entry.state = SlotState::Released;
        self.free.push(handle.index);
        tracing::debug!(slot = %handle, "released");
    }

    /// Releases every live slot
    pub fn release_all(&mut self) {
        let live: Vec<SlotHandle> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.resource.is_some())
            .map(|(index, entry)| SlotHandle {
                index: index as u32,
                generation: entry.generation,
                kind: entry.kind,
            })
            .collect();
        if !live.is_empty() {
            tracing::debug!(count = live.len(), "releasing all slots");
        }
        for handle in live {
            self.release(handle);
        }
    }

    /// Number of live allocations
    pub fn outstanding(&self) -> usize {
        self.entries.iter().filter(|entry| entry.resource.is_some()).count()
    }
}

impl Drop for ResourcePool<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_kinds_map_directly() {
        let none = wgpu::Features::empty();
        assert_eq!(select_residency(SlotKind::TransferSource, AccessPattern::HostWrite, none).unwrap(), Residency::HostUpload);
        assert_eq!(select_residency(SlotKind::TransferDestination, AccessPattern::HostRead, none).unwrap(), Residency::HostReadback);
        assert_eq!(select_residency(SlotKind::Accumulation, AccessPattern::DeviceOnly, none).unwrap(), Residency::DeviceLocal);
    }

    #[test]
    fn test_host_access_to_compute_kinds_needs_mappable_primary_buffers() {
        let none = wgpu::Features::empty();
        assert!(matches!(
            select_residency(SlotKind::ComputeOutput, AccessPattern::HostRead, none),
            Err(Error::ResourceExhausted(_))
        ));
        assert!(matches!(
            select_residency(SlotKind::TransferSource, AccessPattern::HostRead, none),
            Err(Error::ResourceExhausted(_))
        ));

        let mappable = wgpu::Features::MAPPABLE_PRIMARY_BUFFERS;
        assert_eq!(select_residency(SlotKind::ComputeOutput, AccessPattern::HostRead, mappable).unwrap(), Residency::HostReadback);
        assert_eq!(select_residency(SlotKind::ComputeInputBuffer, AccessPattern::HostWrite, mappable).unwrap(), Residency::HostUpload);
    }

    #[test]
    fn test_images_are_never_host_visible() {
        let all = wgpu::Features::MAPPABLE_PRIMARY_BUFFERS;
        assert!(matches!(
            select_residency(SlotKind::ComputeInputImage, AccessPattern::HostWrite, all),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_row_pitch() {
        assert_eq!(upload_row_pitch(1), 256);
        assert_eq!(upload_row_pitch(256), 256);
        assert_eq!(upload_row_pitch(4 * 65), 512);
    }

    #[test]
    fn test_pack_rows_pads_each_row() {
        let data: Vec<u8> = (0..8).collect();
        let packed = pack_rows(&data, 4, 2);
        assert_eq!(packed.len(), 512);
        assert_eq!(&packed[0..4], &[0, 1, 2, 3]);
        assert!(packed[4..256].iter().all(|&b| b == 0));
        assert_eq!(&packed[256..260], &[4, 5, 6, 7]);
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(SlotHandle::for_tests(3, SlotKind::Accumulation).to_string(), "Accumulation#3.1");
    }
}
