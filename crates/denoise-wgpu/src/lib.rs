//! GPU offloaded image denoising on wgpu
//!
//! This crate runs two denoising filters as WGSL compute kernels: a single-pass
//! edge-aware (bilateral) filter, and a two-pass filter that accumulates
//! patch-weighted neighbour frames and then normalizes the sum. Frames are
//! streamed through a small set of device slots owned by one resource pool, and
//! every pass is submitted and waited for synchronously.
//!
//! ```no_run
//! use denoise_wgpu::{ContextOptions, Frame, FrameSource, GpuContext, Run, RunConfig};
//!
//! # fn main() -> denoise_wgpu::Result<()> {
//! let ctx = GpuContext::new_blocking(&ContextOptions::default())?;
//! let frame = Frame::from_rgb8(2, 2, &[128; 12])?;
//! let mut run = Run::configure(RunConfig::default(), vec![Box::new(frame) as Box<dyn FrameSource>])?;
//! let output = run.run(&ctx)?;
//! assert_eq!(output.frames.len(), 1);
//! # Ok(())
//! # }
//! ```

mod binding;
mod context;
mod error;
mod frame;
mod instrumentation;
mod pass;
mod pass_executor;
mod resource_pool;
mod run;

pub mod kernel;
pub mod kernels;
pub mod scheduler;
pub mod topology;

pub use binding::{BindingSet, BoundSlot};
pub use context::{ContextOptions, GpuContext};
pub use error::{BoxError, Error, Result};
pub use frame::{Frame, FrameSource, PixelFormat};
pub use instrumentation::{Instrumentation, PassResult, Totals};
pub use kernel::{AccumTexel, DispatchParams, KernelProgram};
pub use pass::{Access, Barrier, Dispatch, Download, Pass, PassBuilder, Stage, Upload};
pub use pass_executor::{PassExecutor, WaitPolicy};
pub use resource_pool::{AccessPattern, COPY_BYTES_PER_ROW_ALIGNMENT, Residency, ResourcePool, SlotExtent, SlotHandle, SlotKind, SlotState, pack_rows, select_residency, upload_row_pitch};
pub use run::{Run, RunConfig, RunOutput};
pub use topology::{AccumulationParams, BilateralParams, Topology, TopologyKind};
