//! Readiness sentinel
//!
//! The marker file exists only while the process can serve: it is written
//! once the HSM session is open, the trust roots are loaded and the transport
//! is connected, and removed again on shutdown.

use std::path::Path;

use tracing::{info, warn};

pub fn mark_ready(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, b"ok\n")?;
    info!("Ready, wrote {}", path.display());
    Ok(())
}

pub fn clear(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("healthcheck");

        mark_ready(&path).unwrap();
        assert!(path.exists());

        clear(&path);
        assert!(!path.exists());
        // Clearing twice is harmless
        clear(&path);
    }

    #[test]
    fn test_unwritable_location_fails() {
        assert!(mark_ready(Path::new("/nonexistent/dir/healthcheck")).is_err());
    }
}
