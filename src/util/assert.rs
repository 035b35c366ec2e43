/// Version string embedded in internal assertion messages.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Panics with an internal assertion message when `condition` is false.
///
/// `id` is a stable numeric identifier for the call site, rendered in hex so
/// crash reports can be traced back without shipping source locations.
#[track_caller]
pub fn hard_assert(condition: bool, id: u32, message: impl AsRef<str>) {
    if !condition {
        fail(id, message);
    }
}

/// Unconditionally panics with an internal assertion message.
#[track_caller]
pub fn fail(id: u32, message: impl AsRef<str>) -> ! {
    let text = assertion_error(id, message);
    log::error!("{text}");
    panic!("{text}");
}

/// Builds the string used when an internal assertion fails.
pub fn assertion_error(id: u32, message: impl AsRef<str>) -> String {
    format!(
        "FIRESTORE ({SDK_VERSION}) INTERNAL ASSERTION FAILED: {} (ID: {id:x})",
        message.as_ref()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "INTERNAL ASSERTION FAILED")]
    fn hard_assert_panics_on_false() {
        hard_assert(false, 0x1a2b, "should panic");
    }

    #[test]
    fn hard_assert_passes_on_true() {
        hard_assert(true, 0x1a2b, "never shown");
    }

    #[test]
    fn assertion_error_renders_hex_id() {
        let err = assertion_error(0xbeef, "boom");
        assert!(err.contains("boom"));
        assert!(err.ends_with("(ID: beef)"));
    }
}
