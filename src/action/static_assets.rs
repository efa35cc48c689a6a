//! Bundled default responses for the built-in `static` route types.

use once_cell::sync::Lazy;
use std::collections::HashMap;

static BUNDLED: Lazy<HashMap<&'static str, &'static [u8]>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("unknown", include_bytes!("../../static/unknown.http").as_slice());
    m.insert("no-hosts", include_bytes!("../../static/no-hosts.http").as_slice());
    m.insert("timeout", include_bytes!("../../static/timeout.http").as_slice());
    m
});

/// Returns the canned response bytes for `kind`, checking `static_dir` first
/// (operator override) and falling back to the compiled-in default.
pub fn lookup(static_dir: Option<&std::path::Path>, kind: &str) -> std::io::Result<Vec<u8>> {
    if let Some(dir) = static_dir {
        let path = dir.join(format!("{kind}.http"));
        match std::fs::read(&path) {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    BUNDLED
        .get(kind)
        .map(|b| b.to_vec())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("no static response for {kind:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_fallbacks_exist_for_builtin_kinds() {
        for kind in ["unknown", "no-hosts", "timeout"] {
            assert!(lookup(None, kind).is_ok(), "missing bundled static for {kind}");
        }
    }

    #[test]
    fn unrecognized_kind_is_an_error() {
        assert!(lookup(None, "does-not-exist").is_err());
    }
}
