//! Native-function registration (section 4.8): the boundary a host embeds
//! Rust functions through, and the two natives shipped by default.

use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use lox_core::{NativeFn, NativeFunction, Object, Value};

/// Build the `clock()` native, measuring wall-clock seconds since `start`.
#[must_use]
pub fn clock_native(start: Instant) -> NativeFn {
    Rc::new(move |_args: &[Value]| Ok(Value::Number(start.elapsed().as_secs_f64())))
}

/// Build the `unix()` native: whole seconds since the Unix epoch.
#[must_use]
pub fn unix_native() -> NativeFn {
    Rc::new(|_args: &[Value]| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| format!("system clock is before the Unix epoch: {e}"))?;
        Ok(Value::Number(now.as_secs() as f64))
    })
}

/// Wrap a native function pointer in the `Object` shape the VM's call
/// protocol and global table expect.
#[must_use]
pub fn make_native(name: Rc<Object>, func: NativeFn) -> Rc<Object> {
    Rc::new(Object::NativeFunction(NativeFunction { name, func }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_native_returns_a_plausible_timestamp() {
        let native = unix_native();
        let value = native(&[]).unwrap();
        let seconds = value.as_number().unwrap();
        // 2020-01-01 as a sanity floor; guards against an inverted/garbage clock.
        assert!(seconds > 1_577_836_800.0);
    }

    #[test]
    fn clock_native_starts_near_zero() {
        let native = clock_native(Instant::now());
        let value = native(&[]).unwrap();
        assert!(value.as_number().unwrap() >= 0.0);
    }
}
