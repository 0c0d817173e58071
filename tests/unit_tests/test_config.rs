// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use uwb_ranging_rs::cfg::{cli::resolve_config_path, config::Config};

// resolve_config_path honours the UWB_SERVICE_CONFIG override, so
// config tests must not interleave with anything touching it.
#[test]
#[serial]
fn test_load_config_from_yaml() -> Result<()> {
    let cfg =
        resolve_config_path("tests/config.yaml").and_then(Config::load_from_file)?;

    assert_eq!(cfg.service.open_threshold, Duration::from_millis(10_000));
    assert_eq!(cfg.service.background_timeout, Duration::from_millis(120_000));
    assert_eq!(cfg.service.max_sessions_fallback, 5);
    assert!(cfg.service.supports_range_data_ntf_config.as_bool());
    assert_eq!(
        cfg.secure.applet_aid_bytes()?,
        vec![0xA0, 0x00, 0x00, 0x08, 0x67, 0x46, 0x00, 0x01]
    );
    assert_eq!(cfg.secure.tunnel_timeout, Duration::from_millis(2_000));
    assert_eq!(cfg.advertise.aoa_azimuth_degrees, 10);
    Ok(())
}

#[test]
fn test_validation_rejects_bad_aid() {
    let mut cfg = Config::default();
    cfg.secure.applet_aid = "not-hex".to_string();
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.secure.tunnel_timeout = Duration::from_millis(10);
    assert!(cfg.validate().is_err());
}
