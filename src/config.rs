use std::path::PathBuf;
use std::vec::Vec;

use serde_derive::Deserialize;

/// vsock ports the three servers bind to.
///
/// Port numbers are a server-chosen convention, not assigned by the
/// hypervisor (only the context id is).
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VsockPorts {
    /// Port for the request router (R).
    ///
    /// Default: 5000
    #[serde(default = "VsockPorts::default_router")]
    pub router: u32,
    /// Port for the tunnel server (T).
    ///
    /// Default: 5001
    #[serde(default = "VsockPorts::default_tunnel")]
    pub tunnel: u32,
    /// Port for the event push server (E).
    ///
    /// Default: 5003
    #[serde(default = "VsockPorts::default_events")]
    pub events: u32,
}

impl VsockPorts {
    fn default_router() -> u32 {
        5000
    }

    fn default_tunnel() -> u32 {
        5001
    }

    fn default_events() -> u32 {
        5003
    }
}

impl Default for VsockPorts {
    fn default() -> Self {
        Self {
            router: Self::default_router(),
            tunnel: Self::default_tunnel(),
            events: Self::default_events(),
        }
    }
}

/// Tri-state auto-start-at-login preference.
///
/// `Unset` is distinct from `Disabled`: an explicit `false` uninstalls any
/// existing launch-agent registration, while leaving the key absent leaves
/// whatever is already registered untouched.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoStart {
    Enabled,
    Disabled,
    #[default]
    Unset,
}

/// A directory that may hold a newer build of this daemon, checked in
/// priority order by the version gate.
#[derive(Deserialize, Clone, Debug)]
pub struct UpdateSource {
    /// Human-readable name, used only in log messages.
    pub name: String,
    /// Directory to look for a bundle + metadata file in.
    pub path: PathBuf,
}

/// Top-level daemon configuration, loaded from `vmbridge.toml`.
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    /// vsock ports for R/T/E.
    #[serde(default)]
    pub ports: VsockPorts,

    /// Canonical install path this daemon should run from.
    ///
    /// Used by the location gate and as the target of the version gate's
    /// bundle replacement.
    pub install_path: PathBuf,

    /// Update sources to check, in priority order. The first entry is
    /// conventionally the hypervisor's mounted update volume; the rest are
    /// other shared folders that might also carry a newer bundle.
    #[serde(default = "Vec::new")]
    pub update_sources: Vec<UpdateSource>,

    /// Auto-start-at-login preference.
    #[serde(default)]
    pub auto_start: AutoStart,

    /// Application identifier used to namespace the PID lock file, the
    /// downloads directory, and the launch-agent unit name.
    ///
    /// Default: "vmbridge"
    #[serde(default = "Config::default_app_id")]
    pub app_id: String,

    /// How often (in seconds) to rerun the version gate in the background.
    ///
    /// Default: 10
    #[serde(default = "Config::default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
}

impl Config {
    fn default_app_id() -> String {
        "vmbridge".into()
    }

    fn default_rescan_interval_secs() -> u64 {
        10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let config: Config = toml::from_str(
            r#"
            install_path = "/Applications/vmbridge.app"
            "#,
        )
        .unwrap();
        assert_eq!(config.ports.router, 5000);
        assert_eq!(config.ports.tunnel, 5001);
        assert_eq!(config.ports.events, 5003);
        assert_eq!(config.app_id, "vmbridge");
        assert_eq!(config.rescan_interval_secs, 10);
        assert_eq!(config.auto_start, AutoStart::Unset);
        assert!(config.update_sources.is_empty());
    }

    #[test]
    fn test_explicit_ports_and_autostart() {
        let config: Config = toml::from_str(
            r#"
            install_path = "/Applications/vmbridge.app"
            auto_start = "enabled"

            [ports]
            router = 6000
            tunnel = 6001
            events = 6003

            [[update_sources]]
            name = "primary"
            path = "/Volumes/update"
            "#,
        )
        .unwrap();
        assert_eq!(config.ports.router, 6000);
        assert_eq!(config.auto_start, AutoStart::Enabled);
        assert_eq!(config.update_sources.len(), 1);
        assert_eq!(config.update_sources[0].name, "primary");
    }

    // Triple-quoted TOML strings are treated literally, including spaces.
    #[test]
    fn test_triple_quoted_strings_are_literal() {
        let config: Config = toml::from_str(
            r#"
            install_path = '''/Applications/vm bridge.app'''
            "#,
        )
        .unwrap();
        assert_eq!(
            config.install_path,
            PathBuf::from("/Applications/vm bridge.app")
        );
    }
}
