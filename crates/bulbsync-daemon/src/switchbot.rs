//! SwitchBot cloud API (v1.1) client.
//!
//! Every request is signed: `sign = base64(HMAC-SHA256(secret, token + t + nonce))`
//! where `t` is the epoch time in milliseconds and `nonce` a random string.
//! Responses come wrapped in `{statusCode, message, body}`; anything other than
//! `statusCode == 100` is an error even when the HTTP status is 200.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bulbsync_proto::color::Rgb;
use bulbsync_proto::config::SwitchBotConfig;
use bulbsync_proto::protocol::{Device, DeviceStatus};
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use crate::error::{ApiError, ApiResult};

/// Device types that understand the lighting command set.
pub const LIGHTING_CATALOG: &[&str] = &[
    "Color Bulb",
    "Strip Light",
    "Strip Light 3",
    "Ceiling Light",
    "Ceiling Light Pro",
    "Floor Lamp",
    "RGBICWW Strip Light",
    "RGBICWW Floor Lamp",
];

const STATUS_OK: i64 = 100;

/// Device cloud operations the sync core depends on.
#[allow(async_fn_in_trait)]
pub trait DeviceApi {
    async fn list_devices(&self) -> ApiResult<Vec<Device>>;
    async fn get_status(&self, device_id: &str) -> ApiResult<DeviceStatus>;
    async fn send_command(&self, device_id: &str, command: &str, parameter: &str)
        -> ApiResult<()>;
}

pub struct SwitchBotClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    secret: String,
}

impl SwitchBotClient {
    pub fn new(config: &SwitchBotConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            secret: config.secret.clone(),
        })
    }

    fn signed(&self, req: RequestBuilder) -> RequestBuilder {
        let t = chrono::Utc::now().timestamp_millis().to_string();
        let nonce = format!("{:016x}", rand::thread_rng().gen::<u64>());
        let sign = sign_request(&self.token, &self.secret, &t, &nonce);
        req.header("Authorization", &self.token)
            .header("sign", sign)
            .header("t", t)
            .header("nonce", nonce)
    }

    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder) -> ApiResult<Option<T>> {
        let response = self.signed(req).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16()));
        }
        let text = response.text().await?;
        parse_envelope(&text)
    }
}

impl DeviceApi for SwitchBotClient {
    async fn list_devices(&self) -> ApiResult<Vec<Device>> {
        let url = format!("{}/devices", self.api_base);
        let body: Option<DeviceListBody> = self.call(self.http.get(url)).await?;
        let devices = body.map(lighting_devices).unwrap_or_default();
        debug!("SwitchBot: {} lighting devices", devices.len());
        Ok(devices)
    }

    async fn get_status(&self, device_id: &str) -> ApiResult<DeviceStatus> {
        let url = format!("{}/devices/{}/status", self.api_base, device_id);
        let body: Option<StatusBody> = self.call(self.http.get(url)).await?;
        Ok(body.map(DeviceStatus::from).unwrap_or_default())
    }

    async fn send_command(
        &self,
        device_id: &str,
        command: &str,
        parameter: &str,
    ) -> ApiResult<()> {
        let url = format!("{}/devices/{}/commands", self.api_base, device_id);
        let payload = serde_json::json!({
            "command": command,
            "parameter": parameter,
            "commandType": "command",
        });
        let _: Option<serde_json::Value> = self.call(self.http.post(url).json(&payload)).await?;
        Ok(())
    }
}

pub fn sign_request(token: &str, secret: &str, t: &str, nonce: &str) -> String {
    type HmacSha256 = Hmac<Sha256>;
    // HMAC takes keys of any length.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(token.as_bytes());
    mac.update(t.as_bytes());
    mac.update(nonce.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

// ── wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    status_code: i64,
    #[serde(default)]
    message: String,
    body: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceListBody {
    #[serde(default)]
    device_list: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceEntry {
    device_id: String,
    #[serde(default)]
    device_name: String,
    #[serde(default)]
    device_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    power: Option<String>,
    brightness: Option<u8>,
    color: Option<String>,
    color_temperature: Option<u16>,
}

impl From<StatusBody> for DeviceStatus {
    fn from(body: StatusBody) -> Self {
        DeviceStatus {
            power: body.power.map(|p| p.eq_ignore_ascii_case("on")),
            brightness: body.brightness,
            color: body.color.as_deref().and_then(Rgb::from_command_param),
            color_temperature: body.color_temperature,
        }
    }
}

fn parse_envelope<T: DeserializeOwned>(text: &str) -> ApiResult<Option<T>> {
    let envelope: Envelope<T> = serde_json::from_str(text)?;
    if envelope.status_code != STATUS_OK {
        return Err(ApiError::Api {
            code: envelope.status_code,
            message: envelope.message,
        });
    }
    Ok(envelope.body)
}

fn lighting_devices(body: DeviceListBody) -> Vec<Device> {
    body.device_list
        .into_iter()
        .filter(|d| LIGHTING_CATALOG.contains(&d.device_type.as_str()))
        .map(|d| Device {
            id: d.device_id,
            name: d.device_name,
            device_type: d.device_type,
            is_selected: false,
        })
        .collect()
}
