use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::discovery::{CameraConnection, DEFAULT_RTSP_PORT};
use crate::engine::{PtzLimitMode, PtzLimitOptions};
use crate::LayoutOptions;

const DEFAULT_TARGET_DWELL_MS: u64 = 200;
const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 5000;
const DEFAULT_STREAM_OPTIMIZATION: &str = "balanced";
const MAX_TILT_DEGREES: f32 = 90.0;

#[derive(Debug, Deserialize, Default)]
struct ViewerConfigFile {
    cameras: Option<Vec<CameraConnection>>,
    layout: Option<LayoutOptions>,
    camera_tilt: Option<CameraTiltFile>,
    ptz: Option<PtzFile>,
    stream_optimization: Option<String>,
    show_fps: Option<bool>,
    target_dwell_ms: Option<u64>,
    rtsp_port: Option<u16>,
    discovery_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraTiltFile {
    angle_degrees: Option<f32>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct PtzFile {
    limit_mode: Option<PtzLimitMode>,
    auto_zoom_in: Option<bool>,
    auto_zoom_out: Option<bool>,
    auto_pan_tilt: Option<bool>,
}

/// Viewer settings, passed explicitly to the session manager and navigation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewerConfig {
    pub layout: LayoutOptions,
    /// Forwarded to the engine untouched.
    pub stream_optimization: String,
    pub show_fps: bool,
    pub target_dwell_ms: u64,
    pub rtsp_port: u16,
    pub discovery_timeout_ms: u64,
    pub camera_tilt: CameraTiltSettings,
    pub ptz: PtzSettings,
    pub cameras: Vec<CameraConnection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CameraTiltSettings {
    pub angle_degrees: f32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PtzSettings {
    pub limit_mode: PtzLimitMode,
    pub auto_zoom_in: bool,
    pub auto_zoom_out: bool,
    pub auto_pan_tilt: bool,
}

impl PtzSettings {
    pub fn limit_options(&self) -> PtzLimitOptions {
        PtzLimitOptions {
            limit_mode: self.limit_mode,
            auto_zoom_in: self.auto_zoom_in,
            auto_zoom_out: self.auto_zoom_out,
            auto_pan_tilt: self.auto_pan_tilt,
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self::from_file(ViewerConfigFile::default())
    }
}

impl ViewerConfig {
    /// File named by `PANOVIEW_CONFIG` (if any), then environment overrides, then
    /// validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PANOVIEW_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// A single file, without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ViewerConfigFile) -> Self {
        let tilt = file.camera_tilt.unwrap_or_default();
        let ptz = file.ptz.unwrap_or_default();
        let defaults = PtzLimitOptions::default();
        Self {
            cameras: file.cameras.unwrap_or_default(),
            layout: file.layout.unwrap_or_default(),
            camera_tilt: CameraTiltSettings {
                angle_degrees: tilt.angle_degrees.unwrap_or(0.0),
                enabled: tilt.enabled.unwrap_or(false),
            },
            ptz: PtzSettings {
                limit_mode: ptz.limit_mode.unwrap_or(defaults.limit_mode),
                auto_zoom_in: ptz.auto_zoom_in.unwrap_or(defaults.auto_zoom_in),
                auto_zoom_out: ptz.auto_zoom_out.unwrap_or(defaults.auto_zoom_out),
                auto_pan_tilt: ptz.auto_pan_tilt.unwrap_or(defaults.auto_pan_tilt),
            },
            stream_optimization: file
                .stream_optimization
                .unwrap_or_else(|| DEFAULT_STREAM_OPTIMIZATION.to_string()),
            show_fps: file.show_fps.unwrap_or(false),
            target_dwell_ms: file.target_dwell_ms.unwrap_or(DEFAULT_TARGET_DWELL_MS),
            rtsp_port: file.rtsp_port.unwrap_or(DEFAULT_RTSP_PORT),
            discovery_timeout_ms: file
                .discovery_timeout_ms
                .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT_MS),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(layout) = std::env::var("PANOVIEW_LAYOUT") {
            if !layout.trim().is_empty() {
                self.layout = layout.parse()?;
            }
        }
        if let Ok(show_fps) = std::env::var("PANOVIEW_SHOW_FPS") {
            self.show_fps = parse_bool(&show_fps)
                .ok_or_else(|| anyhow!("PANOVIEW_SHOW_FPS must be true/false"))?;
        }
        if let Ok(tilt) = std::env::var("PANOVIEW_TILT_DEGREES") {
            let degrees: f32 = tilt
                .trim()
                .parse()
                .map_err(|_| anyhow!("PANOVIEW_TILT_DEGREES must be a number of degrees"))?;
            self.camera_tilt.angle_degrees = degrees;
            self.camera_tilt.enabled = true;
        }
        if let Ok(port) = std::env::var("PANOVIEW_RTSP_PORT") {
            self.rtsp_port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("PANOVIEW_RTSP_PORT must be a port number"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.camera_tilt.angle_degrees.is_finite()
            || self.camera_tilt.angle_degrees.abs() > MAX_TILT_DEGREES
        {
            return Err(anyhow!(
                "camera tilt must be within ±{} degrees",
                MAX_TILT_DEGREES
            ));
        }
        if self.rtsp_port == 0 {
            return Err(anyhow!("rtsp_port must be non-zero"));
        }
        for camera in &self.cameras {
            if camera.ip_address.trim().is_empty() {
                return Err(anyhow!("camera '{}' has no address", camera.name));
            }
        }
        Ok(())
    }

    /// Write the configuration: TOML for `.toml` paths, pretty JSON otherwise.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = if is_toml(path) {
            toml::to_string_pretty(self).context("serialize config as TOML")?
        } else {
            serde_json::to_string_pretty(self).context("serialize config as JSON")?
        };
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }

    pub fn find_camera(&self, key: &str) -> Option<&CameraConnection> {
        self.cameras
            .iter()
            .find(|camera| camera.name == key || camera.ip_address == key)
    }

    pub fn target_dwell(&self) -> Duration {
        Duration::from_millis(self.target_dwell_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

fn read_config_file(path: &Path) -> Result<ViewerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if is_toml(path) {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
