//! Binding set construction
//!
//! A [`BindingSet`] ties each slot a kernel declares to a concrete pool slot. The
//! builders are pure: they never allocate, they only check that every slot kind
//! fits the role and access class the kernel expects.

use crate::{
    error::{Error, Result},
    kernel::{BindingClass, KernelProgram, KernelSlot, SlotRole},
    kernels,
    resource_pool::{SlotHandle, SlotKind},
};

/// One kernel slot bound to a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundSlot {
    /// Slot as declared by the kernel
    pub slot: KernelSlot,
    /// Pool slot bound to it
    pub handle: SlotHandle,
}

impl BoundSlot {
    /// Whether the kernel writes this slot
    pub fn is_written(&self) -> bool {
        self.slot.class == BindingClass::StorageReadWrite
    }
}

/// An immutable association between a kernel's slots and pool slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSet {
    kernel: &'static KernelProgram,
    entries: Vec<BoundSlot>,
}

fn role_accepts(role: SlotRole, kind: SlotKind) -> bool {
    matches!(
        (role, kind),
        (SlotRole::Output, SlotKind::ComputeOutput)
            | (SlotRole::Input, SlotKind::ComputeInputImage)
            | (SlotRole::Target, SlotKind::ComputeInputImage)
            | (SlotRole::Neighbour, SlotKind::ComputeInputBuffer)
            | (SlotRole::Accumulation, SlotKind::Accumulation)
            | (SlotRole::Parameters, SlotKind::Parameters)
    )
}

fn class_accepts(class: BindingClass, kind: SlotKind) -> bool {
    match class {
        BindingClass::Image => kind == SlotKind::ComputeInputImage,
        BindingClass::StorageRead => matches!(kind, SlotKind::ComputeInputBuffer | SlotKind::Accumulation | SlotKind::ComputeOutput),
        BindingClass::StorageReadWrite => matches!(kind, SlotKind::Accumulation | SlotKind::ComputeOutput),
        BindingClass::Uniform => kind == SlotKind::Parameters,
    }
}

impl BindingSet {
    /// Binds `assignments` to the slots declared by `kernel`
    ///
    /// Every declared role must be assigned exactly once, to a distinct slot whose
    /// kind matches the role and the declared access class.
    pub fn new(kernel: &'static KernelProgram, assignments: &[(SlotRole, SlotHandle)]) -> Result<Self> {
        for (i, (role, handle)) in assignments.iter().enumerate() {
            if kernel.slot(*role).is_none() {
                return Err(Error::BindingMismatch(format!("{} has no {role:?} slot", kernel.name)));
            }
            if assignments[..i].iter().any(|(other, _)| other == role) {
                return Err(Error::BindingMismatch(format!("{role:?} of {} is assigned twice", kernel.name)));
            }
            if assignments[..i].iter().any(|(_, other)| other == handle) {
                return Err(Error::BindingMismatch(format!("slot {handle} is bound to more than one role of {}", kernel.name)));
            }
        }

        let entries = kernel
            .slots
            .iter()
            .map(|slot| {
                let handle = assignments
                    .iter()
                    .find(|(role, _)| *role == slot.role)
                    .map(|(_, handle)| *handle)
                    .ok_or_else(|| Error::BindingMismatch(format!("{:?} of {} is not bound", slot.role, kernel.name)))?;
                if !role_accepts(slot.role, handle.kind()) || !class_accepts(slot.class, handle.kind()) {
                    return Err(Error::BindingMismatch(format!(
                        "{:?} of {} expects a {:?} binding, got {:?} slot {handle}",
                        slot.role,
                        kernel.name,
                        slot.class,
                        handle.kind()
                    )));
                }
                Ok(BoundSlot { slot: *slot, handle })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { kernel, entries })
    }

    /// Binding set for the single-pass topology
    pub fn build_single_pass(output: SlotHandle, input: SlotHandle, params: SlotHandle) -> Result<Self> {
        Self::new(&kernels::BILATERAL, &[(SlotRole::Output, output), (SlotRole::Input, input), (SlotRole::Parameters, params)])
    }

    /// Binding set for the accumulation half of the two-pass topology
    pub fn build_accumulation(accumulation: SlotHandle, target: SlotHandle, neighbour: SlotHandle, params: SlotHandle) -> Result<Self> {
        Self::new(
            &kernels::ACCUMULATE,
            &[
                (SlotRole::Accumulation, accumulation),
                (SlotRole::Target, target),
                (SlotRole::Neighbour, neighbour),
                (SlotRole::Parameters, params),
            ],
        )
    }

    /// Binding set for the normalization half of the two-pass topology
    pub fn build_normalization(output: SlotHandle, accumulation: SlotHandle, params: SlotHandle) -> Result<Self> {
        Self::new(
            &kernels::NORMALIZE,
            &[(SlotRole::Output, output), (SlotRole::Accumulation, accumulation), (SlotRole::Parameters, params)],
        )
    }

    /// The kernel these bindings belong to
    pub fn kernel(&self) -> &'static KernelProgram {
        self.kernel
    }

    /// Bound slots sorted by binding index
    pub fn entries(&self) -> &[BoundSlot] {
        &self.entries
    }

    /// The pool slot bound to `role`
    pub fn handle(&self, role: SlotRole) -> Option<SlotHandle> {
        self.entries.iter().find(|entry| entry.slot.role == role).map(|entry| entry.handle)
    }

    /// The bound slot referencing `handle`, if any
    pub fn find(&self, handle: SlotHandle) -> Option<&BoundSlot> {
        self.entries.iter().find(|entry| entry.handle == handle)
    }

    /// Pool slots the kernel writes
    pub fn written(&self) -> impl Iterator<Item = SlotHandle> + '_ {
        self.entries.iter().filter(|entry| entry.is_written()).map(|entry| entry.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(index: u32, kind: SlotKind) -> SlotHandle {
        SlotHandle::for_tests(index, kind)
    }

    #[test]
    fn test_single_pass_binding() {
        let output = slot(0, SlotKind::ComputeOutput);
        let input = slot(1, SlotKind::ComputeInputImage);
        let params = slot(2, SlotKind::Parameters);
        let set = BindingSet::build_single_pass(output, input, params).unwrap();

        assert_eq!(set.kernel().name, kernels::BILATERAL.name);
        assert_eq!(set.handle(SlotRole::Input), Some(input));
        assert_eq!(set.written().collect::<Vec<_>>(), vec![output]);
        assert!(set.entries().windows(2).all(|pair| pair[0].slot.binding < pair[1].slot.binding));
    }

    #[test]
    fn test_buffer_where_image_required() {
        let result = BindingSet::build_single_pass(slot(0, SlotKind::ComputeOutput), slot(1, SlotKind::ComputeInputBuffer), slot(2, SlotKind::Parameters));
        assert!(matches!(result, Err(Error::BindingMismatch(_))));
    }

    #[test]
    fn test_accumulation_binding() {
        let accumulation = slot(0, SlotKind::Accumulation);
        let set = BindingSet::build_accumulation(accumulation, slot(1, SlotKind::ComputeInputImage), slot(2, SlotKind::ComputeInputBuffer), slot(3, SlotKind::Parameters)).unwrap();
        assert_eq!(set.written().collect::<Vec<_>>(), vec![accumulation]);
        assert!(set.find(slot(2, SlotKind::ComputeInputBuffer)).is_some_and(|bound| !bound.is_written()));

        let swapped = BindingSet::build_accumulation(accumulation, slot(2, SlotKind::ComputeInputBuffer), slot(1, SlotKind::ComputeInputImage), slot(3, SlotKind::Parameters));
        assert!(matches!(swapped, Err(Error::BindingMismatch(_))));
    }

    #[test]
    fn test_normalization_reads_accumulation() {
        let accumulation = slot(1, SlotKind::Accumulation);
        let set = BindingSet::build_normalization(slot(0, SlotKind::ComputeOutput), accumulation, slot(2, SlotKind::Parameters)).unwrap();
        assert!(set.find(accumulation).is_some_and(|bound| !bound.is_written()));
    }

    #[test]
    fn test_same_slot_in_two_roles_is_rejected() {
        let output = slot(0, SlotKind::ComputeOutput);
        let result = BindingSet::new(&kernels::NORMALIZE, &[(SlotRole::Output, output), (SlotRole::Accumulation, output), (SlotRole::Parameters, slot(2, SlotKind::Parameters))]);
        assert!(matches!(result, Err(Error::BindingMismatch(_))));
    }

    #[test]
    fn test_missing_and_unknown_roles_are_rejected() {
        let missing = BindingSet::new(&kernels::NORMALIZE, &[(SlotRole::Output, slot(0, SlotKind::ComputeOutput))]);
        assert!(matches!(missing, Err(Error::BindingMismatch(_))));

        let unknown = BindingSet::new(&kernels::NORMALIZE, &[(SlotRole::Target, slot(0, SlotKind::ComputeInputImage))]);
        assert!(matches!(unknown, Err(Error::BindingMismatch(_))));
    }
}
