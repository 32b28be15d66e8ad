//! Built-in liveness / readiness / startup probe endpoints.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use http::StatusCode;

use crate::concat::PackedParts;
use crate::error::Error;
use crate::response::Response;

/// Probe endpoint configuration. Paths are stored packed in a single
/// allocation.
#[derive(Debug, Clone)]
pub struct ProbesConfig {
    pub enabled: bool,
    paths: PackedParts<3>,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            paths: PackedParts::new(["/livez", "/readyz", "/startupz"]),
        }
    }
}

impl ProbesConfig {
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn liveness_path(&self) -> &str {
        self.paths.get(0)
    }

    #[must_use]
    pub fn readiness_path(&self) -> &str {
        self.paths.get(1)
    }

    #[must_use]
    pub fn startup_path(&self) -> &str {
        self.paths.get(2)
    }

    #[must_use]
    pub fn with_liveness_path(mut self, path: &str) -> Self {
        self.paths.set(0, path);
        self
    }

    #[must_use]
    pub fn with_readiness_path(mut self, path: &str) -> Self {
        self.paths.set(1, path);
        self
    }

    #[must_use]
    pub fn with_startup_path(mut self, path: &str) -> Self {
        self.paths.set(2, path);
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.enabled {
            return Ok(());
        }
        for (path, name) in [
            (self.liveness_path(), "liveness"),
            (self.readiness_path(), "readiness"),
            (self.startup_path(), "startup"),
        ] {
            if path.is_empty() {
                return Err(Error::new_config(format!(
                    "builtin probe path '{name}' must be non-empty"
                )));
            }
            if !path.starts_with('/') {
                return Err(Error::new_config(format!(
                    "builtin probe path '{name}' must start with '/'"
                )));
            }
            if path
                .bytes()
                .any(|byte| byte <= 0x1f || byte == 0x7f || byte == b' ')
            {
                return Err(Error::new_config(format!(
                    "builtin probe path '{name}' contains invalid characters"
                )));
            }
        }
        Ok(())
    }
}

/// Probe state shared between the loop thread and external readers.
#[derive(Debug, Default)]
pub(crate) struct ProbeFlags {
    pub started: AtomicBool,
    pub ready: AtomicBool,
    pub startup_complete: AtomicBool,
}

pub(crate) type SharedProbeFlags = Arc<ProbeFlags>;

/// Answer a probe request, or `None` when `path` is not a probe path.
pub(crate) fn respond(
    config: &ProbesConfig,
    flags: &ProbeFlags,
    path: &str,
) -> Option<Response> {
    if !config.enabled {
        return None;
    }
    let flag = if path == config.liveness_path() {
        &flags.started
    } else if path == config.readiness_path() {
        &flags.ready
    } else if path == config.startup_path() {
        &flags.startup_complete
    } else {
        return None;
    };

    let response = if flag.load(Ordering::Relaxed) {
        Response::new(StatusCode::OK).with_body("ok\n")
    } else {
        Response::new(StatusCode::SERVICE_UNAVAILABLE).with_body("unavailable\n")
    };
    Some(response.with_content_type("text/plain; charset=utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths() {
        let config = ProbesConfig::default();
        assert_eq!(config.liveness_path(), "/livez");
        assert_eq!(config.readiness_path(), "/readyz");
        assert_eq!(config.startup_path(), "/startupz");
    }

    #[test]
    fn disabled_probes_skip_validation() {
        let config = ProbesConfig::default().with_liveness_path("not a path");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_paths() {
        let enabled = ProbesConfig::enabled();
        assert!(enabled.clone().with_liveness_path("").validate().is_err());
        assert!(
            enabled
                .clone()
                .with_readiness_path("readyz")
                .validate()
                .is_err()
        );
        assert!(
            enabled
                .clone()
                .with_startup_path("/start up")
                .validate()
                .is_err()
        );
        assert!(
            enabled
                .with_liveness_path("/li\u{7}vez")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn probe_responses_follow_flags() {
        let config = ProbesConfig::enabled();
        let flags = ProbeFlags::default();

        let resp = respond(&config, &flags, "/livez").unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        flags.started.store(true, Ordering::Relaxed);
        let resp = respond(&config, &flags, "/livez").unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        assert!(respond(&config, &flags, "/other").is_none());
    }
}
