//! Control-loop events and the boundary checks applied to them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{MendloopError, MendloopResult};
use crate::types::{EventStatus, TargetType};

/// Enrichment keys understood by the engine
pub mod keys {
    pub const VM_NAME: &str = "VM_NAME";
    pub const VNF_NAME: &str = "VNF_NAME";
    pub const VSERVER_VSERVER_NAME: &str = "vserver.vserver-name";
    pub const GENERIC_VNF_VNF_ID: &str = "generic-vnf.vnf-id";
    pub const GENERIC_VNF_VNF_NAME: &str = "generic-vnf.vnf-name";
    pub const PNF_NAME: &str = "pnf.pnf-name";
    pub const VSERVER_IS_CLOSED_LOOP_DISABLED: &str = "vserver.is-closed-loop-disabled";
    pub const GENERIC_VNF_IS_CLOSED_LOOP_DISABLED: &str = "generic-vnf.is-closed-loop-disabled";
    pub const PNF_IS_IN_MAINT: &str = "pnf.in-maint";
    pub const VSERVER_PROV_STATUS: &str = "vserver.prov-status";
    pub const GENERIC_VNF_PROV_STATUS: &str = "generic-vnf.prov-status";
}

pub const PROV_STATUS_ACTIVE: &str = "ACTIVE";

const VALID_TARGETS: [&str; 6] = [
    keys::VM_NAME,
    keys::VNF_NAME,
    keys::VSERVER_VSERVER_NAME,
    keys::GENERIC_VNF_VNF_ID,
    keys::GENERIC_VNF_VNF_NAME,
    keys::PNF_NAME,
];

const TRUE_VALUES: [&str; 4] = ["true", "t", "yes", "y"];

/// A fault event as received from the transport.
///
/// Every field is optional on the wire so that malformed events can be
/// classified as syntax errors instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlLoopEvent {
    #[serde(default)]
    pub closed_loop_control_name: Option<String>,
    #[serde(default, rename = "requestID", alias = "requestId")]
    pub request_id: Option<Uuid>,
    #[serde(default)]
    pub closed_loop_event_status: Option<EventStatus>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default, rename = "target_type")]
    pub target_type: Option<TargetType>,
    #[serde(default, rename = "AAI")]
    pub aai: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub closed_loop_alarm_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_loop_alarm_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub policy_name: Option<String>,
}

impl ControlLoopEvent {
    /// Builds a minimal onset event.
    pub fn onset(
        control_loop_name: impl Into<String>,
        request_id: Uuid,
        target: impl Into<String>,
        target_type: TargetType,
        aai: BTreeMap<String, String>,
    ) -> Self {
        Self {
            closed_loop_control_name: Some(control_loop_name.into()),
            request_id: Some(request_id),
            closed_loop_event_status: Some(EventStatus::Onset),
            target: Some(target.into()),
            target_type: Some(target_type),
            aai: Some(aai),
            closed_loop_alarm_start: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Builds the abatement matching this event.
    pub fn abatement(&self) -> Self {
        Self {
            closed_loop_event_status: Some(EventStatus::Abated),
            closed_loop_alarm_end: Some(Utc::now()),
            ..self.clone()
        }
    }

    pub fn control_loop_name(&self) -> &str {
        self.closed_loop_control_name.as_deref().unwrap_or_default()
    }

    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or_default()
    }

    /// Looks up an enrichment value.
    pub fn aai_value(&self, key: &str) -> Option<&str> {
        self.aai
            .as_ref()
            .and_then(|aai| aai.get(key))
            .map(String::as_str)
    }

    /// Value of the enrichment entry named by the event's target field.
    pub fn target_value(&self) -> Option<&str> {
        self.target.as_deref().and_then(|t| self.aai_value(t))
    }

    pub fn is_onset(&self) -> bool {
        self.closed_loop_event_status == Some(EventStatus::Onset)
    }
}

/// Validates the fields required to track an event.
///
/// Abatements only need their identity; onsets also need a usable target.
pub fn check_event_syntax(event: &ControlLoopEvent) -> MendloopResult<()> {
    let status = event
        .closed_loop_event_status
        .ok_or_else(|| MendloopError::syntax("Invalid value in closedLoopEventStatus"))?;

    if is_blank(event.closed_loop_control_name.as_deref()) {
        return Err(MendloopError::syntax("No control loop name"));
    }
    if event.request_id.is_none() {
        return Err(MendloopError::syntax("No request ID"));
    }
    if status == EventStatus::Abated {
        return Ok(());
    }

    let target = match event.target.as_deref() {
        Some(target) if !target.trim().is_empty() => target,
        _ => return Err(MendloopError::syntax("No target field")),
    };
    if !VALID_TARGETS.iter().any(|t| t.eq_ignore_ascii_case(target)) {
        return Err(MendloopError::syntax("target field invalid"));
    }

    validate_aai_data(event)
}

fn validate_aai_data(event: &ControlLoopEvent) -> MendloopResult<()> {
    let aai = event
        .aai
        .as_ref()
        .ok_or_else(|| MendloopError::syntax("AAI is null"))?;
    let target_type = event
        .target_type
        .ok_or_else(|| MendloopError::syntax("The Target type is null"))?;

    match target_type {
        TargetType::Vm | TargetType::Vnf => {
            if !aai.contains_key(keys::GENERIC_VNF_VNF_ID)
                && !aai.contains_key(keys::VSERVER_VSERVER_NAME)
                && !aai.contains_key(keys::GENERIC_VNF_VNF_NAME)
            {
                return Err(MendloopError::syntax(
                    "generic-vnf.vnf-id or generic-vnf.vnf-name or vserver.vserver-name information missing",
                ));
            }
            Ok(())
        }
        TargetType::Pnf => {
            if !aai.contains_key(keys::PNF_NAME) {
                return Err(MendloopError::syntax("AAI PNF object key pnf-name is missing"));
            }
            Ok(())
        }
        TargetType::VfModule => Err(MendloopError::UnsupportedTargetType {
            target_type: target_type.to_string(),
        }),
    }
}

/// True when the enrichment marks the target as excluded from closed-loop control.
pub fn is_closed_loop_disabled(event: &ControlLoopEvent) -> bool {
    [
        keys::VSERVER_IS_CLOSED_LOOP_DISABLED,
        keys::GENERIC_VNF_IS_CLOSED_LOOP_DISABLED,
        keys::PNF_IS_IN_MAINT,
    ]
    .iter()
    .any(|key| is_aai_true(event.aai_value(key)))
}

/// True when a provisioning status is present and anything other than ACTIVE.
pub fn is_prov_status_inactive(event: &ControlLoopEvent) -> bool {
    [keys::VSERVER_PROV_STATUS, keys::GENERIC_VNF_PROV_STATUS]
        .iter()
        .filter_map(|key| event.aai_value(key))
        .any(|status| status != PROV_STATUS_ACTIVE)
}

/// Checks applied before a manager is created for an onset.
pub fn check_activation(event: &ControlLoopEvent) -> MendloopResult<()> {
    if is_closed_loop_disabled(event) {
        return Err(MendloopError::invalid_target(
            "is-closed-loop-disabled is set to true on VServer or VNF",
        ));
    }
    if is_prov_status_inactive(event) {
        return Err(MendloopError::invalid_target(
            "prov-status is not ACTIVE on VServer or VNF",
        ));
    }
    Ok(())
}

fn is_aai_true(value: Option<&str>) -> bool {
    value
        .map(|v| TRUE_VALUES.iter().any(|t| t.eq_ignore_ascii_case(v.trim())))
        .unwrap_or(false)
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}
