//! VM configuration (section 4.10): a builder in the same style as the
//! compiler's `CompilerConfig`/the teacher's `ExternalBuiltin` registration,
//! here covering frame/stack limits and native-function registration.

use std::rc::Rc;
use std::time::Instant;

use lox_core::{NativeFn, Object, StringInterner};

use crate::native::{clock_native, make_native, unix_native};

const DEFAULT_FRAMES_MAX: usize = 64;

/// One native binding pending installation into a freshly built VM: a name
/// and the function it resolves to.
pub struct NativeBinding {
    pub name: String,
    pub func: NativeFn,
}

/// Tunable VM limits plus the set of native functions to install at
/// construction time.
pub struct VmConfig {
    pub frames_max: usize,
    pub stack_max: usize,
    natives: Vec<NativeBinding>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl VmConfig {
    /// The default configuration: `FRAMES_MAX = 64`, a stack sized
    /// `frames_max * 256`, and `clock`/`unix` registered (section 4.8).
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames_max: DEFAULT_FRAMES_MAX,
            stack_max: DEFAULT_FRAMES_MAX * 256,
            natives: vec![
                NativeBinding { name: "clock".to_string(), func: clock_native(Instant::now()) },
                NativeBinding { name: "unix".to_string(), func: unix_native() },
            ],
        }
    }

    #[must_use]
    pub fn with_frames_max(mut self, frames_max: usize) -> Self {
        self.frames_max = frames_max;
        self.stack_max = frames_max * 256;
        self
    }

    #[must_use]
    pub fn with_stack_max(mut self, stack_max: usize) -> Self {
        self.stack_max = stack_max;
        self
    }

    /// Register an additional (or overriding-by-name) native function.
    #[must_use]
    pub fn with_native(mut self, name: impl Into<String>, func: NativeFn) -> Self {
        self.natives.push(NativeBinding { name: name.into(), func });
        self
    }

    /// Intern every registered native's name and wrap it as a callable
    /// `Object`, ready for installation into the VM's global table.
    pub(crate) fn build_natives(&self, interner: &mut StringInterner) -> Vec<(Rc<Object>, Rc<Object>)> {
        self.natives
            .iter()
            .map(|binding| {
                let name = interner.intern_str(&binding.name);
                let native_obj = make_native(Rc::clone(&name), Rc::clone(&binding.func));
                (name, native_obj)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_registers_clock_and_unix() {
        let config = VmConfig::new();
        assert_eq!(config.natives.len(), 2);
        assert!(config.natives.iter().any(|n| n.name == "clock"));
        assert!(config.natives.iter().any(|n| n.name == "unix"));
    }

    #[test]
    fn with_frames_max_rescales_stack_max() {
        let config = VmConfig::new().with_frames_max(8);
        assert_eq!(config.stack_max, 8 * 256);
    }
}
