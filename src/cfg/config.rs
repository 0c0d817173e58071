// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::YesNo;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Session lifecycle knobs: command timeouts, limits, policy timers.
    pub service: ServiceConfig,
    /// Secure-element / dynamic-STS provisioning parameters.
    pub secure: SecureConfig,
    /// OWR-AoA pointed-target criteria.
    pub advertise: AdvertiseConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Timeouts and limits governing the session manager event loop.
pub struct ServiceConfig {
    #[serde(rename = "RangingSessionOpenThresholdMs", with = "serde_millis")]
    /// Bound on each await during the init→setConfig→idle open round-trip.
    pub open_threshold: Duration,

    #[serde(rename = "RangingSessionStartThresholdMs", with = "serde_millis")]
    /// Bound on the Idle→Active wait after START_RANGING.
    pub start_threshold: Duration,

    #[serde(rename = "RangingSessionStopThresholdMs", with = "serde_millis")]
    /// Base bound on the Active→Idle wait; scaled up to 2× the current
    /// ranging interval for long beacon periods.
    pub stop_threshold: Duration,

    #[serde(rename = "RangingSessionCloseThresholdMs", with = "serde_millis")]
    /// Bound on the wait for SESSION_DEINIT to be acknowledged.
    pub close_threshold: Duration,

    #[serde(rename = "BackgroundAppTimeoutMs", with = "serde_millis")]
    /// How long a non-privileged app may keep ranging from the
    /// background before the session is stopped.
    pub background_timeout: Duration,

    #[serde(rename = "RangingErrorStreakTimeoutMs", with = "serde_millis")]
    /// Default per-session error-streak watchdog, overridable per
    /// session through its open parameters.
    pub ranging_error_streak_timeout: Duration,

    #[serde(rename = "MaxSessionsFallback")]
    /// Session cap used when the device does not report one.
    pub max_sessions_fallback: u32,

    #[serde(rename = "RecentlyClosedCapacity")]
    /// Bounded LRU of closed-session snapshots kept for diagnostics.
    pub recently_closed_capacity: usize,

    #[serde(rename = "SupportsRangeDataNtfConfig")]
    /// Device capability gate for the foreground/background
    /// notification-policy reconfiguration.
    pub supports_range_data_ntf_config: YesNo,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Parameters of the FiRa applet dialog.
pub struct SecureConfig {
    #[serde(rename = "AppletAid")]
    /// AID of the FiRa applet, hex encoded.
    pub applet_aid: String,

    #[serde(rename = "TunnelTimeoutMs", with = "serde_millis")]
    /// Per tunneled request: how long the initiator waits for the
    /// peer's reply before aborting the secure session.
    pub tunnel_timeout: Duration,

    #[serde(rename = "SessionDataRetryDelayMs", with = "serde_millis")]
    /// Controlee-initiator retry cadence while session data is not yet
    /// available on the peer.
    pub session_data_retry_delay: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// When an OWR-AoA remote counts as "pointed at".
pub struct AdvertiseConfig {
    #[serde(rename = "AoaAzimuthDegrees")]
    pub aoa_azimuth_degrees: u16,

    #[serde(rename = "AoaElevationDegrees")]
    pub aoa_elevation_degrees: u16,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.service.max_sessions_fallback >= 1,
            "MaxSessionsFallback must be >= 1"
        );
        ensure!(
            !self.secure.applet_aid.is_empty(),
            "AppletAid must not be empty"
        );
        self.secure
            .applet_aid_bytes()
            .context("AppletAid must be valid hex")?;
        ensure!(
            self.secure.tunnel_timeout >= Duration::from_millis(100),
            "TunnelTimeoutMs must be >= 100"
        );
        Ok(())
    }
}

impl SecureConfig {
    pub fn applet_aid_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(self.applet_aid.trim())
            .map_err(|e| anyhow::anyhow!("bad AppletAid: {e}"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                open_threshold: Duration::from_millis(10_000),
                start_threshold: Duration::from_millis(3_000),
                stop_threshold: Duration::from_millis(3_000),
                close_threshold: Duration::from_millis(3_000),
                background_timeout: Duration::from_millis(120_000),
                ranging_error_streak_timeout: Duration::from_millis(30_000),
                max_sessions_fallback: 5,
                recently_closed_capacity: 5,
                supports_range_data_ntf_config: YesNo::Yes,
            },
            secure: SecureConfig {
                applet_aid: "A000000867460001".to_string(),
                tunnel_timeout: Duration::from_millis(2_000),
                session_data_retry_delay: Duration::from_millis(100),
            },
            advertise: AdvertiseConfig {
                aoa_azimuth_degrees: 10,
                aoa_elevation_degrees: 10,
            },
        }
    }
}

mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where S: Serializer {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where D: Deserializer<'de> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
