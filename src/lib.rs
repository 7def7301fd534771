#![forbid(unsafe_code)]

pub use wgpu;

pub mod composite_cpu;
pub mod context;
pub mod effect;
pub mod error;
pub mod pixel;
pub mod programs;
pub mod resource;
pub mod sample_cpu;
mod sync;

pub use composite_cpu::{CopyRect, FULL_RECT, SampleMode};
pub use context::{ActionKind, ActionRecord, ContextOptions, ExecContext, request_device};
pub use effect::{Effect, EffectDescriptor, ParameterInfo};
pub use error::{FxrtError, FxrtResult};
pub use programs::{ProgramCache, ProgramLibrary};
pub use resource::{ExternalImage, Resource, ResourceKind, WrapMode};
pub use sample_cpu::FilterMode;
