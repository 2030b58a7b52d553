use std::sync::Mutex;

use cbus_protocol::{MemoryImprint, TapConfig};

/// A point-in-time view of the coordinator configuration.
///
/// The version counter makes replacement explicit: a pipeline run holds
/// the snapshot it started with, so a concurrent `set_tap_config` never
/// changes an in-flight invocation.
#[derive(Debug, Clone, Default)]
pub struct SettingsSnapshot {
    pub tap: Option<TapConfig>,
    pub imprints: Vec<MemoryImprint>,
    pub version: u64,
}

/// Coordinator-wide tap and memory configuration.
///
/// Replaced wholesale by client actions, last writer wins.
#[derive(Default)]
pub struct Settings {
    inner: Mutex<SettingsSnapshot>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tap(&self, tap: Option<TapConfig>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.tap = tap;
            inner.version += 1;
        }
    }

    pub fn set_imprints(&self, imprints: Vec<MemoryImprint>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.imprints = imprints;
            inner.version += 1;
        }
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        self.inner.lock().map(|inner| inner.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_bumps_version_and_wins() {
        let settings = Settings::new();
        assert!(settings.snapshot().tap.is_none());

        settings.set_tap(Some(TapConfig::direct("http://a", "echo")));
        settings.set_tap(Some(TapConfig::direct("http://b", "search")));
        let snap = settings.snapshot();
        assert_eq!(snap.tap.as_ref().map(|t| t.tool_name.as_str()), Some("search"));
        assert_eq!(snap.version, 2);

        settings.set_tap(None);
        assert!(settings.snapshot().tap.is_none());
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let settings = Settings::new();
        settings.set_imprints(vec![MemoryImprint { text: "boot".into() }]);
        let snap = settings.snapshot();
        settings.set_imprints(vec![]);
        assert_eq!(snap.imprints.len(), 1);
        assert!(settings.snapshot().imprints.is_empty());
    }
}
