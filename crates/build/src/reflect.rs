//! WGSL reflection checks
//!
//! Parses a WGSL kernel with naga and verifies that the resource bindings and the
//! compute entry point it declares agree with the kernel manifest.

use crate::kernels::{BindingClass, SlotSpec};
use std::fmt;

/// A resource binding found in a WGSL module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedBinding {
    /// Variable name in the shader
    pub name: String,
    /// Bind group index
    pub group: u32,
    /// Binding point within the group
    pub binding: u32,
    /// Access class derived from the declaration
    pub class: Option<BindingClass>,
}

/// Mismatches between a WGSL module and its manifest declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflectError {
    /// The WGSL source failed to parse or validate
    Invalid(String),
    /// No compute entry point with the given name exists
    MissingEntryPoint(String),
    /// The entry point work-group size differs from the declared tile size
    WorkgroupSize { declared: u32, found: [u32; 3] },
    /// A declared slot has no matching binding in the shader
    MissingBinding(u32),
    /// The shader declares a binding the manifest does not
    UndeclaredBinding { name: String, group: u32, binding: u32 },
    /// The shader binding has a different access class than declared
    ClassMismatch { binding: u32, declared: BindingClass, found: Option<BindingClass> },
}

impl fmt::Display for ReflectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(message) => write!(f, "Invalid WGSL: {message}"),
            Self::MissingEntryPoint(name) => write!(f, "No compute entry point named '{name}'"),
            Self::WorkgroupSize { declared, found } => write!(f, "Work-group size {found:?} does not match tile size {declared}"),
            Self::MissingBinding(binding) => write!(f, "Declared binding {binding} is not used by the shader"),
            Self::UndeclaredBinding { name, group, binding } => write!(f, "Shader variable '{name}' at group {group} binding {binding} is not declared"),
            Self::ClassMismatch { binding, declared, found } => match found {
                Some(found) => write!(f, "Binding {binding} is declared as {declared} but the shader uses {found}"),
                None => write!(f, "Binding {binding} is declared as {declared} but the shader uses an unsupported resource type"),
            },
        }
    }
}

impl std::error::Error for ReflectError {}

/// Parses and validates WGSL source with naga
pub(crate) fn parse_and_validate(shader: &str) -> Result<(naga::Module, naga::valid::ModuleInfo), ReflectError> {
    let module = naga::front::wgsl::parse_str(shader).map_err(|e| ReflectError::Invalid(e.emit_to_string(shader)))?;
    let mut validator = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all());
    let info = validator.validate(&module).map_err(|e| ReflectError::Invalid(e.to_string()))?;
    Ok((module, info))
}

/// Lists all resource bindings declared by a WGSL module
///
/// # Arguments
/// * `shader` - WGSL source code
///
/// # Returns
/// The bindings sorted by (group, binding)
pub fn reflect_bindings(shader: &str) -> Result<Vec<ReflectedBinding>, ReflectError> {
    let (module, _) = parse_and_validate(shader)?;
    Ok(collect_bindings(&module))
}

fn collect_bindings(module: &naga::Module) -> Vec<ReflectedBinding> {
    let mut bindings: Vec<ReflectedBinding> = module
        .global_variables
        .iter()
        .filter_map(|(_, var)| {
            let resource = var.binding.as_ref()?;
            Some(ReflectedBinding {
                name: var.name.clone().unwrap_or_default(),
                group: resource.group,
                binding: resource.binding,
                class: binding_class(module, var),
            })
        })
        .collect();
    bindings.sort_by_key(|b| (b.group, b.binding));
    bindings
}

fn binding_class(module: &naga::Module, var: &naga::GlobalVariable) -> Option<BindingClass> {
    match var.space {
        naga::AddressSpace::Uniform => Some(BindingClass::Uniform),
        naga::AddressSpace::Storage { access } => {
            if access.contains(naga::StorageAccess::STORE) {
                Some(BindingClass::StorageReadWrite)
            } else {
                Some(BindingClass::StorageRead)
            }
        }
        naga::AddressSpace::Handle => match module.types[var.ty].inner {
            naga::TypeInner::Image {
                dim: naga::ImageDimension::D2,
                arrayed: false,
                class: naga::ImageClass::Sampled { multi: false, .. },
            } => Some(BindingClass::Image),
            _ => None,
        },
        _ => None,
    }
}

/// Checks a WGSL kernel against its declared slots
///
/// Every declared slot must exist in bind group 0 with the declared class, the
/// shader must not bind anything else, and the named compute entry point must use
/// a `tile_size` x `tile_size` x 1 work-group.
///
/// # Arguments
/// * `shader` - WGSL source code
/// * `entry_point` - Name of the compute entry point
/// * `tile_size` - Declared work-group edge length
/// * `slots` - Declared slots
pub fn check_declared_slots(shader: &str, entry_point: &str, tile_size: u32, slots: &[SlotSpec]) -> Result<(), ReflectError> {
    let (module, _) = parse_and_validate(shader)?;

    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.name == entry_point && ep.stage == naga::ShaderStage::Compute)
        .ok_or_else(|| ReflectError::MissingEntryPoint(entry_point.to_string()))?;
    if entry.workgroup_size != [tile_size, tile_size, 1] {
        return Err(ReflectError::WorkgroupSize {
            declared: tile_size,
            found: entry.workgroup_size,
        });
    }

    let bindings = collect_bindings(&module);

    for reflected in &bindings {
        if reflected.group != 0 || !slots.iter().any(|slot| slot.binding == reflected.binding) {
            return Err(ReflectError::UndeclaredBinding {
                name: reflected.name.clone(),
                group: reflected.group,
                binding: reflected.binding,
            });
        }
    }

    for slot in slots {
        let reflected = bindings.iter().find(|b| b.group == 0 && b.binding == slot.binding).ok_or(ReflectError::MissingBinding(slot.binding))?;
        if reflected.class != Some(slot.class) {
            return Err(ReflectError::ClassMismatch {
                binding: slot.binding,
                declared: slot.class,
                found: reflected.class,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::SlotRole;

    const SHADER: &str = r#"
struct Params { width: u32, height: u32 }

@group(0) @binding(0) var<storage, read_write> output: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> accumulation: array<vec4<f32>>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.width || id.y >= params.height) { return; }
    let i = id.y * params.width + id.x;
    output[i] = accumulation[i];
}
"#;

    fn slots() -> Vec<SlotSpec> {
        vec![
            SlotSpec { role: SlotRole::Output, binding: 0, class: BindingClass::StorageReadWrite },
            SlotSpec { role: SlotRole::Accumulation, binding: 1, class: BindingClass::StorageRead },
            SlotSpec { role: SlotRole::Parameters, binding: 2, class: BindingClass::Uniform },
        ]
    }

    #[test]
    fn test_reflect_bindings() {
        let bindings = reflect_bindings(SHADER).unwrap();
        let classes: Vec<_> = bindings.iter().map(|b| (b.binding, b.class)).collect();
        assert_eq!(
            classes,
            vec![
                (0, Some(BindingClass::StorageReadWrite)),
                (1, Some(BindingClass::StorageRead)),
                (2, Some(BindingClass::Uniform)),
            ]
        );
        assert_eq!(bindings[1].name, "accumulation");
    }

    #[test]
    fn test_declared_slots_match() {
        assert_eq!(check_declared_slots(SHADER, "main", 16, &slots()), Ok(()));
    }

    #[test]
    fn test_wrong_tile_size() {
        assert_eq!(
            check_declared_slots(SHADER, "main", 8, &slots()),
            Err(ReflectError::WorkgroupSize { declared: 8, found: [16, 16, 1] })
        );
    }

    #[test]
    fn test_missing_entry_point() {
        assert_eq!(check_declared_slots(SHADER, "run", 16, &slots()), Err(ReflectError::MissingEntryPoint("run".to_string())));
    }

    #[test]
    fn test_undeclared_and_missing_bindings() {
        let mut declared = slots();
        declared.pop();
        assert!(matches!(check_declared_slots(SHADER, "main", 16, &declared), Err(ReflectError::UndeclaredBinding { binding: 2, .. })));

        let mut declared = slots();
        declared.push(SlotSpec { role: SlotRole::Target, binding: 3, class: BindingClass::Image });
        assert_eq!(check_declared_slots(SHADER, "main", 16, &declared), Err(ReflectError::MissingBinding(3)));
    }

    #[test]
    fn test_invalid_source() {
        assert!(matches!(check_declared_slots("fn main( {", "main", 16, &slots()), Err(ReflectError::Invalid(_))));
    }
}
