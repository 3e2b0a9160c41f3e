use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{BackendKind, DetectorSettings};

const DEFAULT_SOURCE_NAME: &str = "camera1";
const DEFAULT_SOURCE_URL: &str = "stub://camera1";
const DEFAULT_TARGET_FPS: u32 = 10;
const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_TELEGRAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "peakwatch";
const DEFAULT_MQTT_CLIENT_ID: &str = "peakwatchd";

// ----------------------------------------------------------------------------
// File layout (everything optional, merged over defaults)
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PeakwatchConfigFile {
    detection: Option<DetectionConfigFile>,
    sources: Option<Vec<SourceConfigFile>>,
    exporters: Option<ExportersConfigFile>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    save_threshold: Option<f32>,
    notify_threshold: Option<f32>,
    peak_detection_threshold: Option<f32>,
    immediate_threshold: Option<f32>,
    max_screenshots: Option<usize>,
    min_collection_time: Option<f64>,
    #[serde(alias = "collection_time")]
    max_collection_time: Option<f64>,
    inactivity_stop_time: Option<f64>,
    min_high_confidence_detections: Option<usize>,
    cooldown_period: Option<f64>,
    sound_every_n_notifications: Option<u64>,
    process_every_n_frames: Option<u64>,
    history_capacity: Option<usize>,
    peak_detection_enabled: Option<bool>,
    annotate_live: Option<bool>,
    send_annotated_images: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    name: String,
    url: String,
    target_fps: Option<u32>,
    backend: Option<String>,
    model: Option<PathBuf>,
    input_size: Option<u32>,
    confidence_floor: Option<f32>,
    classes: Option<Vec<u32>>,
    script: Option<Vec<f32>>,
    detection: Option<DetectionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ExportersConfigFile {
    disk: Option<DiskConfigFile>,
    telegram: Option<TelegramConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DiskConfigFile {
    directory: PathBuf,
    group_by_event: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TelegramConfigFile {
    bot_token: Option<String>,
    chat_ids: Option<Vec<String>>,
    timeout_secs: Option<u64>,
    api_base: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MqttConfigFile {
    broker: String,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    publish_snapshot: Option<bool>,
}

// ----------------------------------------------------------------------------
// Resolved configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PeakwatchConfig {
    pub sources: Vec<SourceSettings>,
    pub exporters: ExporterSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub name: String,
    pub url: String,
    pub target_fps: u32,
    pub detector: DetectorSettings,
    pub detection: DetectionSettings,
}

/// Event windowing, selection and throttle parameters for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    /// A frame at or above this confidence opens or extends an event.
    pub save_threshold: f32,
    /// Frames at or above this confidence count towards the export gate.
    pub notify_threshold: f32,
    /// First crossing latches the window's peak flag.
    pub peak_detection_threshold: f32,
    /// Closes the window after one second when crossed.
    pub immediate_threshold: f32,
    pub max_screenshots: usize,
    pub min_collection_time: Duration,
    pub max_collection_time: Duration,
    pub inactivity_stop_time: Duration,
    pub min_high_confidence_detections: usize,
    pub cooldown_period: Duration,
    pub sound_every_n_notifications: u64,
    pub process_every_n_frames: u64,
    pub history_capacity: usize,
    /// `false` selects the minimal profile: no history, no peak latch, no
    /// inactivity timer, best frame only, fixed collection time.
    pub peak_detection_enabled: bool,
    pub annotate_live: bool,
    pub send_annotated_images: bool,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            save_threshold: 0.7,
            notify_threshold: 0.84,
            peak_detection_threshold: 0.89,
            immediate_threshold: 0.85,
            max_screenshots: 2,
            min_collection_time: Duration::from_secs(4),
            max_collection_time: Duration::from_secs(50),
            inactivity_stop_time: Duration::from_secs(6),
            min_high_confidence_detections: 3,
            cooldown_period: Duration::from_secs(40),
            sound_every_n_notifications: 5,
            process_every_n_frames: 2,
            history_capacity: crate::frame::DEFAULT_HISTORY_CAPACITY,
            peak_detection_enabled: true,
            annotate_live: false,
            send_annotated_images: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExporterSettings {
    pub disk: Option<DiskSettings>,
    pub telegram: Option<TelegramSettings>,
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Clone)]
pub struct DiskSettings {
    pub directory: PathBuf,
    /// Put each event's images in its own seconds-precision directory.
    pub group_by_event: bool,
}

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_ids: Vec<String>,
    pub timeout: Duration,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publish_snapshot: bool,
}

impl PeakwatchConfig {
    /// Load from the file named by `PEAKWATCH_CONFIG` (if any), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var("PEAKWATCH_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => PeakwatchConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PeakwatchConfigFile) -> Result<Self> {
        let global = match &file.detection {
            Some(detection) => detection.apply(DetectionSettings::default())?,
            None => DetectionSettings::default(),
        };

        let sources = match file.sources {
            Some(sources) => sources
                .into_iter()
                .map(|src| src.resolve(&global))
                .collect::<Result<Vec<_>>>()?,
            None => vec![SourceSettings {
                name: DEFAULT_SOURCE_NAME.to_string(),
                url: DEFAULT_SOURCE_URL.to_string(),
                target_fps: DEFAULT_TARGET_FPS,
                detector: DetectorSettings::default(),
                detection: global.clone(),
            }],
        };

        let exporters_file = file.exporters.unwrap_or_default();
        let disk = exporters_file.disk.map(|disk| DiskSettings {
            directory: disk.directory,
            group_by_event: disk.group_by_event.unwrap_or(true),
        });
        let telegram = match exporters_file.telegram {
            Some(tg) => Some(TelegramSettings {
                bot_token: tg.bot_token.unwrap_or_default(),
                chat_ids: tg.chat_ids.unwrap_or_default(),
                timeout: Duration::from_secs(
                    tg.timeout_secs.unwrap_or(DEFAULT_TELEGRAM_TIMEOUT_SECS),
                ),
                api_base: tg
                    .api_base
                    .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
            }),
            None => None,
        };
        let mqtt = exporters_file.mqtt.map(|mqtt| MqttSettings {
            broker: mqtt.broker,
            topic_prefix: mqtt
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
            client_id: mqtt
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            username: mqtt.username,
            password: mqtt.password,
            publish_snapshot: mqtt.publish_snapshot.unwrap_or(true),
        });

        Ok(Self {
            sources,
            exporters: ExporterSettings {
                disk,
                telegram,
                mqtt,
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("PEAKWATCH_SAVE_DIR") {
            if !dir.trim().is_empty() {
                let group_by_event = self
                    .exporters
                    .disk
                    .as_ref()
                    .map_or(true, |disk| disk.group_by_event);
                self.exporters.disk = Some(DiskSettings {
                    directory: PathBuf::from(dir),
                    group_by_event,
                });
            }
        }
        if let Ok(token) = std::env::var("PEAKWATCH_TELEGRAM_TOKEN") {
            if !token.trim().is_empty() {
                self.telegram_mut().bot_token = token;
            }
        }
        if let Ok(chat_ids) = std::env::var("PEAKWATCH_TELEGRAM_CHAT_IDS") {
            let parsed = split_csv(&chat_ids);
            if !parsed.is_empty() {
                self.telegram_mut().chat_ids = parsed;
            }
        }
        if let Ok(broker) = std::env::var("PEAKWATCH_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                match self.exporters.mqtt.as_mut() {
                    Some(mqtt) => mqtt.broker = broker,
                    None => {
                        self.exporters.mqtt = Some(MqttSettings {
                            broker,
                            topic_prefix: DEFAULT_MQTT_TOPIC_PREFIX.to_string(),
                            client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
                            username: None,
                            password: None,
                            publish_snapshot: true,
                        })
                    }
                }
            }
        }
        if let Ok(cooldown) = std::env::var("PEAKWATCH_COOLDOWN_SECS") {
            let seconds: f64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("PEAKWATCH_COOLDOWN_SECS must be a number of seconds")
            })?;
            let cooldown = seconds_to_duration("cooldown_period", seconds)?;
            for source in &mut self.sources {
                source.detection.cooldown_period = cooldown;
            }
        }
        Ok(())
    }

    fn telegram_mut(&mut self) -> &mut TelegramSettings {
        self.exporters
            .telegram
            .get_or_insert_with(|| TelegramSettings {
                bot_token: String::new(),
                chat_ids: Vec::new(),
                timeout: Duration::from_secs(DEFAULT_TELEGRAM_TIMEOUT_SECS),
                api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            })
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!("at least one source must be configured"));
        }
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(anyhow!("source names must not be empty"));
            }
            if !names.insert(source.name.as_str()) {
                return Err(anyhow!("duplicate source name '{}'", source.name));
            }
            if source.url.trim().is_empty() {
                return Err(anyhow!("source '{}' has an empty url", source.name));
            }
            check_unit("confidence_floor", source.detector.confidence_floor)
                .map_err(|e| anyhow!("source '{}': {}", source.name, e))?;
            source
                .detection
                .validate()
                .map_err(|e| anyhow!("source '{}': {}", source.name, e))?;
        }
        if let Some(tg) = &self.exporters.telegram {
            if tg.bot_token.trim().is_empty() {
                return Err(anyhow!("telegram exporter requires a bot token"));
            }
            if tg.chat_ids.is_empty() {
                return Err(anyhow!("telegram exporter requires at least one chat id"));
            }
        }
        if let Some(mqtt) = &self.exporters.mqtt {
            if mqtt.topic_prefix.trim().is_empty() {
                return Err(anyhow!("mqtt topic prefix must not be empty"));
            }
        }
        Ok(())
    }
}

impl DetectionSettings {
    pub fn validate(&self) -> Result<()> {
        check_unit("save_threshold", self.save_threshold)?;
        check_unit("notify_threshold", self.notify_threshold)?;
        check_unit("peak_detection_threshold", self.peak_detection_threshold)?;
        check_unit("immediate_threshold", self.immediate_threshold)?;
        if self.save_threshold > self.notify_threshold {
            return Err(anyhow!(
                "save_threshold ({}) must not exceed notify_threshold ({})",
                self.save_threshold,
                self.notify_threshold
            ));
        }
        if self.min_collection_time > self.max_collection_time {
            return Err(anyhow!(
                "min_collection_time must not exceed max_collection_time"
            ));
        }
        if self.max_screenshots == 0 {
            return Err(anyhow!("max_screenshots must be at least 1"));
        }
        if self.sound_every_n_notifications == 0 {
            return Err(anyhow!("sound_every_n_notifications must be at least 1"));
        }
        if self.process_every_n_frames == 0 {
            return Err(anyhow!("process_every_n_frames must be at least 1"));
        }
        if self.history_capacity == 0 {
            return Err(anyhow!("history_capacity must be at least 1"));
        }
        if !self.peak_detection_enabled && self.min_high_confidence_detections > 1 {
            return Err(anyhow!(
                "min_high_confidence_detections must be 0 or 1 when peak_detection_enabled is false"
            ));
        }
        Ok(())
    }
}

impl DetectionConfigFile {
    fn apply(&self, mut s: DetectionSettings) -> Result<DetectionSettings> {
        if let Some(v) = self.save_threshold {
            s.save_threshold = v;
        }
        if let Some(v) = self.notify_threshold {
            s.notify_threshold = v;
        }
        if let Some(v) = self.peak_detection_threshold {
            s.peak_detection_threshold = v;
        }
        if let Some(v) = self.immediate_threshold {
            s.immediate_threshold = v;
        }
        if let Some(v) = self.max_screenshots {
            s.max_screenshots = v;
        }
        if let Some(v) = self.min_collection_time {
            s.min_collection_time = seconds_to_duration("min_collection_time", v)?;
        }
        if let Some(v) = self.max_collection_time {
            s.max_collection_time = seconds_to_duration("max_collection_time", v)?;
        }
        if let Some(v) = self.inactivity_stop_time {
            s.inactivity_stop_time = seconds_to_duration("inactivity_stop_time", v)?;
        }
        if let Some(v) = self.min_high_confidence_detections {
            s.min_high_confidence_detections = v;
        }
        if let Some(v) = self.cooldown_period {
            s.cooldown_period = seconds_to_duration("cooldown_period", v)?;
        }
        if let Some(v) = self.sound_every_n_notifications {
            s.sound_every_n_notifications = v;
        }
        if let Some(v) = self.process_every_n_frames {
            s.process_every_n_frames = v;
        }
        if let Some(v) = self.history_capacity {
            s.history_capacity = v;
        }
        if let Some(v) = self.peak_detection_enabled {
            s.peak_detection_enabled = v;
        }
        if let Some(v) = self.annotate_live {
            s.annotate_live = v;
        }
        if let Some(v) = self.send_annotated_images {
            s.send_annotated_images = v;
        }
        Ok(s)
    }
}

impl SourceConfigFile {
    fn resolve(self, global: &DetectionSettings) -> Result<SourceSettings> {
        let detection = match &self.detection {
            Some(overrides) => overrides.apply(global.clone())?,
            None => global.clone(),
        };
        let defaults = DetectorSettings::default();
        let backend = match self.backend.as_deref() {
            Some(name) => name.parse::<BackendKind>()?,
            None if self.model.is_some() => BackendKind::Tract,
            None => BackendKind::Stub,
        };
        Ok(SourceSettings {
            name: self.name,
            url: self.url,
            target_fps: self.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            detector: DetectorSettings {
                backend,
                model: self.model,
                input_size: self.input_size.unwrap_or(defaults.input_size),
                confidence_floor: self.confidence_floor.unwrap_or(defaults.confidence_floor),
                classes: self.classes,
                script: self.script,
            },
            detection,
        })
    }
}

fn read_config_file(path: &Path) -> Result<PeakwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e)),
        Some("toml") => toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e)),
        other => Err(anyhow!(
            "unsupported config format {:?} for {} (expected .json or .toml)",
            other.unwrap_or(""),
            path.display()
        )),
    }
}

fn seconds_to_duration(field: &str, seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds", field))
}

fn check_unit(field: &str, value: f32) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within 0.0..=1.0, got {}", field, value));
    }
    Ok(())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DetectionSettings::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let settings = DetectionSettings {
            notify_threshold: 1.2,
            ..DetectionSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_save_above_notify() {
        let settings = DetectionSettings {
            save_threshold: 0.9,
            notify_threshold: 0.8,
            ..DetectionSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn durations_out_of_range_are_errors() {
        assert_eq!(
            seconds_to_duration("cooldown_period", 2.5).unwrap(),
            Duration::from_millis(2500)
        );
        for bad in [1e20, f64::MAX, f64::INFINITY, f64::NAN, -1.0] {
            let err = seconds_to_duration("cooldown_period", bad).unwrap_err();
            assert!(err.to_string().contains("cooldown_period"), "{}", err);
        }
    }

    #[test]
    fn minimal_profile_needs_single_frame_gate() {
        let settings = DetectionSettings {
            peak_detection_enabled: false,
            ..DetectionSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = DetectionSettings {
            peak_detection_enabled: false,
            min_high_confidence_detections: 1,
            ..DetectionSettings::default()
        };
        settings.validate().unwrap();
    }

    #[test]
    fn source_overrides_merge_over_global_settings() {
        let global = DetectionConfigFile {
            save_threshold: Some(0.6),
            cooldown_period: Some(10.0),
            ..DetectionConfigFile::default()
        }
        .apply(DetectionSettings::default())
        .unwrap();

        let source = SourceConfigFile {
            name: "barn".to_string(),
            url: "stub://barn".to_string(),
            target_fps: None,
            backend: None,
            model: None,
            input_size: None,
            confidence_floor: None,
            classes: None,
            script: None,
            detection: Some(DetectionConfigFile {
                cooldown_period: Some(2.5),
                ..DetectionConfigFile::default()
            }),
        }
        .resolve(&global)
        .unwrap();

        assert_eq!(source.detection.save_threshold, 0.6);
        assert_eq!(source.detection.cooldown_period, Duration::from_millis(2500));
        assert_eq!(source.detector.backend, BackendKind::Stub);
    }

    #[test]
    fn negative_durations_are_rejected() {
        assert!(seconds_to_duration("cooldown_period", -1.0).is_err());
        assert!(seconds_to_duration("cooldown_period", f64::NAN).is_err());
    }

    #[test]
    fn split_csv_trims_entries() {
        assert_eq!(split_csv(" 1, 2 ,,3"), vec!["1", "2", "3"]);
    }
}
