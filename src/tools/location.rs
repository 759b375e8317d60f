//! 设备位置服务与 get_device_location 工具
//!
//! LocationService 由调用方构造并注入（`Arc<LocationService>`），持有前端上报的最近一次设备位置，
//! 设备位置不可用时退回配置中的位置。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::tools::Tool;

pub const LOCATION_TOOL: &str = "get_device_location";

/// 配置中的兜底位置（[location] 段）
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfiguredLocation {
    pub city: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

/// 设备上报的位置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// 米
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub address: String,
    /// 毫秒时间戳
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 查询结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationReport {
    pub available: bool,
    /// device / config / unavailable
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub city: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub human_readable: String,
}

/// 位置服务
#[derive(Debug, Default)]
pub struct LocationService {
    current: RwLock<Option<DeviceLocation>>,
    fallback: Option<ConfiguredLocation>,
}

impl LocationService {
    pub fn new(fallback: Option<ConfiguredLocation>) -> Self {
        Self {
            current: RwLock::new(None),
            fallback: fallback.filter(|f| !f.city.trim().is_empty()),
        }
    }

    /// 前端上报位置
    pub async fn update(&self, mut location: DeviceLocation) {
        if location.timestamp == 0 {
            location.timestamp = Utc::now().timestamp_millis();
        }
        tracing::debug!(city = %location.city, available = location.available, "device location updated");
        *self.current.write().await = Some(location);
    }

    pub async fn current(&self) -> Option<DeviceLocation> {
        self.current.read().await.clone()
    }

    /// 设备位置优先，其次配置位置
    pub async fn report(&self) -> LocationReport {
        let device = self.current().await;
        if let Some(loc) = device.as_ref().filter(|l| l.available) {
            let human_readable = if !loc.city.is_empty() && !loc.country.is_empty() {
                format!("当前位置: {}, {} (精度: {:.0}米)", loc.city, loc.country, loc.accuracy)
            } else if !loc.address.is_empty() {
                format!("当前位置: {} (精度: {:.0}米)", loc.address, loc.accuracy)
            } else {
                format!(
                    "当前位置: 纬度 {:.6}, 经度 {:.6} (精度: {:.0}米)",
                    loc.latitude, loc.longitude, loc.accuracy
                )
            };
            return LocationReport {
                available: true,
                source: "device".into(),
                latitude: Some(loc.latitude),
                longitude: Some(loc.longitude),
                accuracy_meters: Some(loc.accuracy),
                city: loc.city.clone(),
                country: loc.country.clone(),
                address: loc.address.clone(),
                error: None,
                human_readable,
            };
        }

        if let Some(cfg) = &self.fallback {
            return LocationReport {
                available: true,
                source: "config".into(),
                latitude: Some(cfg.latitude),
                longitude: Some(cfg.longitude),
                city: cfg.city.clone(),
                country: cfg.country.clone(),
                human_readable: format!("用户设置位置: {}, {}", cfg.city, cfg.country),
                ..Default::default()
            };
        }

        let error = device.and_then(|d| d.error).unwrap_or_else(|| {
            "Location not available. User may need to grant location permission or configure location in settings."
                .to_string()
        });
        LocationReport {
            available: false,
            source: "unavailable".into(),
            error: Some(error),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct LocationArgs {
    /// coordinates（仅经纬度）、city（城市与国家）或 full（默认）
    #[serde(default)]
    pub query_type: Option<String>,
}

pub struct LocationTool {
    service: Arc<LocationService>,
}

impl LocationTool {
    pub fn new(service: Arc<LocationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Tool for LocationTool {
    fn name(&self) -> &str {
        LOCATION_TOOL
    }

    fn description(&self) -> &str {
        "Get the current device location. Returns latitude, longitude, city and country. \
         Use this when the user asks about their location, nearby places or local weather."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(LocationArgs)).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: LocationArgs = serde_json::from_value(args).unwrap_or_default();
        let mut report = self.service.report().await;

        match args.query_type.as_deref() {
            Some("coordinates") => {
                report.city.clear();
                report.country.clear();
                report.address.clear();
            }
            Some("city") => {
                report.latitude = None;
                report.longitude = None;
                report.accuracy_meters = None;
            }
            _ => {}
        }

        serde_json::to_string(&report).map_err(|e| e.to_string())
    }
}
