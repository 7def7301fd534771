//! Host-facing effect interface.
//!
//! A generated effect is a small driver around an [`ExecContext`]: it
//! declares its scalar parameters, sets up resources in `init`, and runs
//! kernels once per frame in `process_frame`. The host discovers effects
//! through [`EffectDescriptor`] entries and owns the parameter values
//! between frames.

use crate::context::ExecContext;
use crate::error::FxrtResult;

/// One scalar parameter exposed to the host UI.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub default: f32,
    pub min: f32,
    pub max: f32,
}

impl ParameterInfo {
    pub fn new(name: impl Into<String>, default: f32, min: f32, max: f32) -> Self {
        Self {
            name: name.into(),
            default,
            min,
            max,
        }
    }
}

pub trait Effect {
    /// Register resources and do one-time setup. Called once, before the
    /// first frame.
    fn init(&mut self, ctx: &mut ExecContext) -> FxrtResult<()>;

    /// Run one frame at the given output size. Implementations push their
    /// parameter values into the context as scalar inputs, dispatch
    /// whatever kernels the frame needs, and leave draining to the host.
    fn process_frame(&mut self, ctx: &mut ExecContext, width: u32, height: u32) -> FxrtResult<()>;

    fn set_parameter(&mut self, name: &str, value: f32);

    /// Current value of a parameter; unknown names read as its default or
    /// zero.
    fn parameter(&self, name: &str) -> f32;

    fn parameters(&self) -> Vec<ParameterInfo>;
}

/// Registry entry for one effect: a display name, a stable four-character
/// code, and a constructor.
pub struct EffectDescriptor {
    pub name: &'static str,
    pub code: &'static str,
    pub make: fn() -> Box<dyn Effect>,
}

impl std::fmt::Debug for EffectDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectDescriptor")
            .field("name", &self.name)
            .field("code", &self.code)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Gain {
        values: HashMap<String, f32>,
    }

    impl Effect for Gain {
        fn init(&mut self, _ctx: &mut ExecContext) -> FxrtResult<()> {
            Ok(())
        }

        fn process_frame(
            &mut self,
            _ctx: &mut ExecContext,
            _width: u32,
            _height: u32,
        ) -> FxrtResult<()> {
            Ok(())
        }

        fn set_parameter(&mut self, name: &str, value: f32) {
            self.values.insert(name.to_string(), value);
        }

        fn parameter(&self, name: &str) -> f32 {
            self.values.get(name).copied().unwrap_or(0.0)
        }

        fn parameters(&self) -> Vec<ParameterInfo> {
            vec![ParameterInfo::new("gain", 1.0, 0.0, 2.0)]
        }
    }

    #[test]
    fn descriptor_constructs_boxed_effects() {
        let desc = EffectDescriptor {
            name: "Gain",
            code: "GN01",
            make: || Box::new(Gain::default()),
        };
        let mut fx = (desc.make)();
        assert_eq!(fx.parameter("gain"), 0.0);
        fx.set_parameter("gain", 0.5);
        assert_eq!(fx.parameter("gain"), 0.5);
        assert_eq!(fx.parameters()[0].name, "gain");
    }
}
