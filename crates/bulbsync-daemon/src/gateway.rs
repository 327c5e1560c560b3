//! Device Command Gateway: deduplicated dispatch, independent per device.
//!
//! The gateway remembers the last command signature (name + parameter) that
//! each device accepted.  A command whose signature equals that record is not
//! transmitted at all, so however often the resolver recomputes the same
//! colour, a device never receives the same command twice in a row.
//!
//! Failures are not recorded: the next resolver pass that produces the same
//! command retries it naturally.  All sends of one batch run concurrently and
//! one device's error never affects its siblings.

use std::collections::HashMap;

use bulbsync_proto::color::Rgb;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::switchbot::DeviceApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    TurnOn,
    TurnOff,
    SetColor(Rgb),
    /// 1..=100
    SetBrightness(u8),
    /// Kelvin, 2700..=6500
    SetColorTemperature(u16),
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::TurnOn => "turnOn",
            DeviceCommand::TurnOff => "turnOff",
            DeviceCommand::SetColor(_) => "setColor",
            DeviceCommand::SetBrightness(_) => "setBrightness",
            DeviceCommand::SetColorTemperature(_) => "setColorTemperature",
        }
    }

    pub fn parameter(&self) -> String {
        match self {
            DeviceCommand::TurnOn | DeviceCommand::TurnOff => "default".to_string(),
            DeviceCommand::SetColor(c) => c.command_param(),
            DeviceCommand::SetBrightness(b) => b.to_string(),
            DeviceCommand::SetColorTemperature(k) => k.to_string(),
        }
    }

    pub fn signature(&self) -> String {
        format!("{}:{}", self.name(), self.parameter())
    }
}

/// Outcome of one dispatch batch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Device ids that accepted their command.
    pub sent: Vec<String>,
    /// Commands suppressed because they matched the last accepted one.
    pub skipped: usize,
    pub failed: Vec<(String, ApiError)>,
}

impl DispatchReport {
    pub fn rate_limited(&self) -> bool {
        self.failed
            .iter()
            .any(|(_, e)| matches!(e, ApiError::RateLimited))
    }
}

pub struct CommandGateway<A> {
    api: A,
    last_sent: HashMap<String, String>,
}

impl<A: DeviceApi> CommandGateway<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            last_sent: HashMap::new(),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    #[cfg(test)]
    pub fn last_sent(&self, device_id: &str) -> Option<&str> {
        self.last_sent.get(device_id).map(String::as_str)
    }

    #[cfg(test)]
    pub async fn send(&mut self, device_id: &str, command: DeviceCommand) -> DispatchReport {
        self.dispatch(vec![(device_id.to_string(), command)]).await
    }

    /// Send one command per device, concurrently, skipping repeats.
    pub async fn dispatch(&mut self, batch: Vec<(String, DeviceCommand)>) -> DispatchReport {
        let mut report = DispatchReport::default();

        let pending: Vec<(String, DeviceCommand, String)> = batch
            .into_iter()
            .filter_map(|(id, cmd)| {
                let sig = cmd.signature();
                if self.last_sent.get(&id) == Some(&sig) {
                    report.skipped += 1;
                    None
                } else {
                    Some((id, cmd, sig))
                }
            })
            .collect();

        if pending.is_empty() {
            return report;
        }

        let api = &self.api;
        let results = join_all(pending.iter().map(|(id, cmd, _)| async move {
            api.send_command(id, cmd.name(), &cmd.parameter()).await
        }))
        .await;

        for ((id, cmd, sig), result) in pending.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    debug!("Gateway: {} -> {} {}", id, cmd.name(), cmd.parameter());
                    self.last_sent.insert(id.clone(), sig);
                    report.sent.push(id);
                }
                Err(e) => {
                    warn!("Gateway: {} failed for {}: {}", cmd.name(), id, e);
                    report.failed.push((id, e));
                }
            }
        }

        report
    }
}
