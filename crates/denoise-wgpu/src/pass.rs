//! Passes: one atomic unit of transfers, barriers and at most one dispatch
//!
//! A [`Pass`] is recorded in a fixed order: clears, uploads, barriers that make
//! transferred data visible to the kernel, the dispatch, barriers that make kernel
//! output visible to transfers, and finally downloads. [`PassBuilder`] derives the
//! barriers from the declared operations and [`Pass::validate`] rejects passes
//! with racing or stale resource state.

use crate::{
    binding::BindingSet,
    error::{Error, Result},
    kernel::{BindingClass, DispatchParams},
    resource_pool::{SlotHandle, SlotKind},
};

/// How an operation accesses a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Written by a clear or copy
    TransferWrite,
    /// Read by a copy
    TransferRead,
    /// Read by the kernel
    ShaderRead,
    /// Written by the kernel
    ShaderWrite,
    /// Read and written by the kernel
    ShaderReadWrite,
}

/// A state transition of one slot between two stages of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    /// Slot whose state changes
    pub slot: SlotHandle,
    /// Access by the earlier stage
    pub before: Access,
    /// Access by the later stage
    pub after: Access,
}

impl Barrier {
    fn is_pre_dispatch(&self) -> bool {
        self.before == Access::TransferWrite
    }
}

/// Copy of a staging buffer into a device buffer or image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upload {
    /// Host-written staging slot
    pub staging: SlotHandle,
    /// Device slot receiving the data
    pub destination: SlotHandle,
}

/// Copy of a device buffer into a readback staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Download {
    /// Device slot holding the data
    pub source: SlotHandle,
    /// Host-readable staging slot
    pub staging: SlotHandle,
}

/// A kernel dispatch covering a `width` x `height` image
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Kernel and its bound slots
    pub bindings: BindingSet,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Parameters written to the `Parameters` slot before submission
    pub params: DispatchParams,
}

impl Dispatch {
    /// Work-groups needed to cover the image
    pub fn workgroups(&self) -> (u32, u32) {
        self.bindings.kernel().dispatch_size(self.width, self.height)
    }
}

/// One recording step, in submission order
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stage<'a> {
    Clear(SlotHandle),
    Upload(&'a Upload),
    PreDispatchBarrier(&'a Barrier),
    Dispatch(&'a Dispatch),
    PostDispatchBarrier(&'a Barrier),
    Download(&'a Download),
}

/// One schedulable unit of device work
#[derive(Debug, Clone, PartialEq)]
pub struct Pass {
    label: String,
    clears: Vec<SlotHandle>,
    uploads: Vec<Upload>,
    dispatch: Option<Dispatch>,
    downloads: Vec<Download>,
    barriers: Vec<Barrier>,
}

/// Builder deriving the barriers of a [`Pass`]
#[derive(Debug, Clone)]
pub struct PassBuilder {
    label: String,
    clears: Vec<SlotHandle>,
    uploads: Vec<Upload>,
    dispatch: Option<Dispatch>,
    downloads: Vec<Download>,
    extra_barriers: Vec<Barrier>,
    derive_barriers: bool,
}

impl PassBuilder {
    /// Starts an empty pass
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            clears: Vec::new(),
            uploads: Vec::new(),
            dispatch: None,
            downloads: Vec::new(),
            extra_barriers: Vec::new(),
            derive_barriers: true,
        }
    }

    /// Zero-fills a device buffer
    pub fn clear(mut self, slot: SlotHandle) -> Self {
        self.clears.push(slot);
        self
    }

    /// Copies `staging` into `destination`
    pub fn upload(mut self, staging: SlotHandle, destination: SlotHandle) -> Self {
        self.uploads.push(Upload { staging, destination });
        self
    }

    /// Sets the kernel dispatch
    pub fn dispatch(mut self, bindings: BindingSet, width: u32, height: u32, params: DispatchParams) -> Self {
        self.dispatch = Some(Dispatch { bindings, width, height, params });
        self
    }

    /// Copies `source` into `staging` after the dispatch
    pub fn download(mut self, source: SlotHandle, staging: SlotHandle) -> Self {
        self.downloads.push(Download { source, staging });
        self
    }

    /// Adds an explicit barrier
    pub fn barrier(mut self, barrier: Barrier) -> Self {
        self.extra_barriers.push(barrier);
        self
    }

    /// Turns barrier derivation on or off
    pub fn derive_barriers(mut self, derive: bool) -> Self {
        self.derive_barriers = derive;
        self
    }

    /// Derives barriers and validates the pass
    pub fn build(self) -> Result<Pass> {
        let mut barriers = self.extra_barriers;
        if self.derive_barriers {
            if let Some(dispatch) = &self.dispatch {
                let transfer_written = self.clears.iter().copied().chain(self.uploads.iter().map(|upload| upload.destination));
                for slot in transfer_written {
                    if let Some(bound) = dispatch.bindings.find(slot) {
                        let after = if bound.slot.class == BindingClass::StorageReadWrite { Access::ShaderReadWrite } else { Access::ShaderRead };
                        push_unique(&mut barriers, Barrier { slot, before: Access::TransferWrite, after });
                    }
                }
                for download in &self.downloads {
                    if dispatch.bindings.find(download.source).is_some_and(|bound| bound.is_written()) {
                        push_unique(
                            &mut barriers,
                            Barrier {
                                slot: download.source,
                                before: Access::ShaderWrite,
                                after: Access::TransferRead,
                            },
                        );
                    }
                }
            }
        }

        let pass = Pass {
            label: self.label,
            clears: self.clears,
            uploads: self.uploads,
            dispatch: self.dispatch,
            downloads: self.downloads,
            barriers,
        };
        pass.validate()?;
        Ok(pass)
    }
}

fn push_unique(barriers: &mut Vec<Barrier>, barrier: Barrier) {
    if !barriers.contains(&barrier) {
        barriers.push(barrier);
    }
}

impl Pass {
    /// Label used for debugging and logs
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The kernel dispatch, if any
    pub fn dispatch(&self) -> Option<&Dispatch> {
        self.dispatch.as_ref()
    }

    /// Derived and explicit barriers
    pub fn barriers(&self) -> &[Barrier] {
        &self.barriers
    }

    /// Whether the pass moves data between host-visible and device slots
    pub fn has_transfers(&self) -> bool {
        !self.clears.is_empty() || !self.uploads.is_empty() || !self.downloads.is_empty()
    }

    /// Every slot the pass touches, without duplicates
    pub fn slots(&self) -> Vec<SlotHandle> {
        let mut slots = Vec::new();
        let mut add = |slot: SlotHandle| {
            if !slots.contains(&slot) {
                slots.push(slot);
            }
        };
        self.clears.iter().copied().for_each(&mut add);
        for upload in &self.uploads {
            add(upload.staging);
            add(upload.destination);
        }
        if let Some(dispatch) = &self.dispatch {
            dispatch.bindings.entries().iter().for_each(|entry| add(entry.handle));
        }
        for download in &self.downloads {
            add(download.source);
            add(download.staging);
        }
        slots
    }

    /// The pass operations in recording order
    pub fn stages(&self) -> Vec<Stage<'_>> {
        let mut stages: Vec<Stage<'_>> = self.clears.iter().map(|slot| Stage::Clear(*slot)).collect();
        stages.extend(self.uploads.iter().map(Stage::Upload));
        stages.extend(self.barriers.iter().filter(|b| b.is_pre_dispatch()).map(Stage::PreDispatchBarrier));
        stages.extend(self.dispatch.iter().map(Stage::Dispatch));
        stages.extend(self.barriers.iter().filter(|b| !b.is_pre_dispatch()).map(Stage::PostDispatchBarrier));
        stages.extend(self.downloads.iter().map(Stage::Download));
        stages
    }

    fn has_barrier(&self, slot: SlotHandle, before: Access, after: &[Access]) -> bool {
        self.barriers.iter().any(|b| b.slot == slot && b.before == before && after.contains(&b.after))
    }

    /// Checks slot kinds, the single-writer rule and barrier coverage
    ///
    /// A slot is cleared at most once and receives at most one upload and one
    /// download. Data written by transfers and used by the kernel needs a
    /// `TransferWrite` barrier; kernel output that is downloaded needs a
    /// `ShaderWrite -> TransferRead` barrier.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::InvalidAccess(format!("pass '{}': {message}", self.label)));

        for (i, slot) in self.clears.iter().enumerate() {
            if slot.kind().is_image() || slot.kind() == SlotKind::Parameters {
                return invalid(format!("cannot clear {slot}"));
            }
            if self.clears[..i].contains(slot) {
                return invalid(format!("{slot} is cleared twice"));
            }
        }
        for (i, upload) in self.uploads.iter().enumerate() {
            if upload.staging.kind() != SlotKind::TransferSource {
                return invalid(format!("upload source {} is not a transfer source", upload.staging));
            }
            if !matches!(upload.destination.kind(), SlotKind::ComputeInputImage | SlotKind::ComputeInputBuffer | SlotKind::Accumulation) {
                return invalid(format!("cannot upload into {}", upload.destination));
            }
            if self.uploads[..i].iter().any(|other| other.destination == upload.destination) {
                return invalid(format!("{} has two upload writers", upload.destination));
            }
        }
        for (i, download) in self.downloads.iter().enumerate() {
            if download.staging.kind() != SlotKind::TransferDestination {
                return invalid(format!("download destination {} is not a transfer destination", download.staging));
            }
            if !matches!(download.source.kind(), SlotKind::ComputeOutput | SlotKind::Accumulation) {
                return invalid(format!("cannot download from {}", download.source));
            }
            if self.downloads[..i].iter().any(|other| other.staging == download.staging) {
                return invalid(format!("{} has two download writers", download.staging));
            }
        }

        let transfer_written: Vec<SlotHandle> = self.clears.iter().copied().chain(self.uploads.iter().map(|upload| upload.destination)).collect();

        if let Some(dispatch) = &self.dispatch {
            for bound in dispatch.bindings.entries() {
                let slot = bound.handle;
                if bound.is_written() && transfer_written.contains(&slot) && !self.has_barrier(slot, Access::TransferWrite, &[Access::ShaderReadWrite, Access::ShaderWrite]) {
                    return invalid(format!("{slot} is written by transfers and the kernel without a barrier"));
                }
                if !bound.is_written() && transfer_written.contains(&slot) && !self.has_barrier(slot, Access::TransferWrite, &[Access::ShaderRead, Access::ShaderReadWrite]) {
                    return invalid(format!("{slot} is read by the kernel without a barrier after its transfer"));
                }
            }
            for download in &self.downloads {
                if dispatch.bindings.find(download.source).is_some_and(|bound| bound.is_written()) && !self.has_barrier(download.source, Access::ShaderWrite, &[Access::TransferRead]) {
                    return invalid(format!("{} is downloaded without a barrier after the kernel writes it", download.source));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(index: u32, kind: SlotKind) -> SlotHandle {
        SlotHandle::for_tests(index, kind)
    }

    struct Slots {
        staging: SlotHandle,
        image: SlotHandle,
        output: SlotHandle,
        readback: SlotHandle,
        params: SlotHandle,
    }

    fn slots() -> Slots {
        Slots {
            staging: slot(0, SlotKind::TransferSource),
            image: slot(1, SlotKind::ComputeInputImage),
            output: slot(2, SlotKind::ComputeOutput),
            readback: slot(3, SlotKind::TransferDestination),
            params: slot(4, SlotKind::Parameters),
        }
    }

    fn single_pass(s: &Slots) -> PassBuilder {
        let bindings = BindingSet::build_single_pass(s.output, s.image, s.params).unwrap();
        PassBuilder::new("bilateral").upload(s.staging, s.image).dispatch(bindings, 4, 4, DispatchParams::new(4, 4)).download(s.output, s.readback)
    }

    #[test]
    fn test_barriers_are_derived() {
        let s = slots();
        let pass = single_pass(&s).build().unwrap();
        assert_eq!(
            pass.barriers(),
            &[
                Barrier { slot: s.image, before: Access::TransferWrite, after: Access::ShaderRead },
                Barrier { slot: s.output, before: Access::ShaderWrite, after: Access::TransferRead },
            ]
        );
    }

    #[test]
    fn test_stage_order() {
        let s = slots();
        let pass = single_pass(&s).build().unwrap();
        let names: Vec<&str> = pass
            .stages()
            .iter()
            .map(|stage| match stage {
                Stage::Clear(_) => "clear",
                Stage::Upload(_) => "upload",
                Stage::PreDispatchBarrier(_) => "pre",
                Stage::Dispatch(_) => "dispatch",
                Stage::PostDispatchBarrier(_) => "post",
                Stage::Download(_) => "download",
            })
            .collect();
        assert_eq!(names, vec!["upload", "pre", "dispatch", "post", "download"]);
        assert_eq!(pass.dispatch().map(Dispatch::workgroups), Some((1, 1)));
        assert_eq!(pass.slots().len(), 5);
    }

    #[test]
    fn test_missing_barriers_are_rejected() {
        let s = slots();
        let result = single_pass(&s).derive_barriers(false).build();
        assert!(matches!(result, Err(Error::InvalidAccess(_))));

        let only_upload_barrier = single_pass(&s)
            .derive_barriers(false)
            .barrier(Barrier { slot: s.image, before: Access::TransferWrite, after: Access::ShaderRead })
            .build();
        assert!(matches!(only_upload_barrier, Err(Error::InvalidAccess(_))));
    }

    #[test]
    fn test_accumulation_clear_needs_read_write_barrier() {
        let accumulation = slot(5, SlotKind::Accumulation);
        let neighbour = slot(6, SlotKind::ComputeInputBuffer);
        let s = slots();
        let bindings = BindingSet::build_accumulation(accumulation, s.image, neighbour, s.params).unwrap();
        let pass = PassBuilder::new("accumulate").clear(accumulation).dispatch(bindings, 4, 4, DispatchParams::new(4, 4)).build().unwrap();
        assert_eq!(pass.barriers(), &[Barrier { slot: accumulation, before: Access::TransferWrite, after: Access::ShaderReadWrite }]);
    }

    #[test]
    fn test_upload_into_disjoint_slot_needs_no_barrier() {
        let accumulation = slot(5, SlotKind::Accumulation);
        let lane_a = slot(6, SlotKind::ComputeInputBuffer);
        let lane_b = slot(7, SlotKind::ComputeInputBuffer);
        let staging_b = slot(8, SlotKind::TransferSource);
        let s = slots();
        let bindings = BindingSet::build_accumulation(accumulation, s.image, lane_a, s.params).unwrap();
        let pass = PassBuilder::new("combined").upload(staging_b, lane_b).dispatch(bindings, 4, 4, DispatchParams::new(4, 4)).build().unwrap();
        assert!(pass.barriers().is_empty());
        assert!(pass.has_transfers());
    }

    #[test]
    fn test_two_writers_are_rejected() {
        let s = slots();
        let other_staging = slot(9, SlotKind::TransferSource);
        let result = PassBuilder::new("double").upload(s.staging, s.image).upload(other_staging, s.image).build();
        assert!(matches!(result, Err(Error::InvalidAccess(_))));

        let result = PassBuilder::new("double download").download(s.output, s.readback).download(slot(10, SlotKind::Accumulation), s.readback).build();
        assert!(matches!(result, Err(Error::InvalidAccess(_))));
    }

    #[test]
    fn test_kind_checks() {
        let s = slots();
        assert!(matches!(PassBuilder::new("clear image").clear(s.image).build(), Err(Error::InvalidAccess(_))));
        assert!(matches!(PassBuilder::new("bad upload").upload(s.readback, s.image).build(), Err(Error::InvalidAccess(_))));
        assert!(matches!(PassBuilder::new("bad download").download(s.image, s.readback).build(), Err(Error::InvalidAccess(_))));
    }
}
