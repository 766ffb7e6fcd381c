//! Resolution of a policy's concrete target entity from event enrichment

use serde_json::Value;

use crate::error::{MendloopError, MendloopResult};
use crate::event::{keys, ControlLoopEvent};
use crate::policy::Policy;
use crate::types::TargetType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetResolution {
    /// The entity is known from the event itself.
    Resolved(String),
    /// The VNF id has to be looked up with a custom query first.
    NeedsCustomQuery,
}

/// Determines the entity a policy's operation acts on.
pub fn resolve_target(policy: &Policy, event: &ControlLoopEvent) -> MendloopResult<TargetResolution> {
    let target_type = policy
        .target
        .target_type
        .ok_or_else(|| MendloopError::invalid_target("The target type is null"))?;

    match target_type {
        TargetType::Pnf => resolve_pnf(event),
        TargetType::Vm | TargetType::Vnf | TargetType::VfModule => resolve_vf_module(event),
    }
}

fn resolve_pnf(event: &ControlLoopEvent) -> MendloopResult<TargetResolution> {
    if !event.target_name().eq_ignore_ascii_case(keys::PNF_NAME) {
        return Err(MendloopError::invalid_target(
            "Target does not match target type",
        ));
    }
    event
        .aai_value(keys::PNF_NAME)
        .map(|name| TargetResolution::Resolved(name.to_string()))
        .ok_or_else(|| {
            MendloopError::invalid_target(format!("AAI section is missing {}", keys::PNF_NAME))
        })
}

fn resolve_vf_module(event: &ControlLoopEvent) -> MendloopResult<TargetResolution> {
    let target = event.target.as_deref().ok_or_else(|| MendloopError::invalid_target("Target is null"))?;
    let key = target.to_ascii_lowercase();

    let field = match key.as_str() {
        k if k == keys::VSERVER_VSERVER_NAME || k.eq_ignore_ascii_case(keys::VM_NAME) => {
            keys::VSERVER_VSERVER_NAME
        }
        k if k == keys::GENERIC_VNF_VNF_ID => keys::GENERIC_VNF_VNF_ID,
        k if k == keys::GENERIC_VNF_VNF_NAME || k.eq_ignore_ascii_case(keys::VNF_NAME) => {
            // an enriched vnf-id makes the lookup unnecessary
            return Ok(match event.aai_value(keys::GENERIC_VNF_VNF_ID) {
                Some(id) => TargetResolution::Resolved(id.to_string()),
                None => TargetResolution::NeedsCustomQuery,
            });
        }
        _ => {
            return Err(MendloopError::invalid_target(
                "Target does not match target type",
            ))
        }
    };

    event
        .aai_value(field)
        .map(|v| TargetResolution::Resolved(v.to_string()))
        .ok_or_else(|| MendloopError::invalid_target(format!("Enrichment data is missing {}", target)))
}

/// Pulls the VNF id out of a custom query response.
///
/// Accepts either a flat `{"generic-vnf.vnf-id": ...}` map or a nested
/// `{"generic-vnf": {"vnf-id": ...}}` object.
pub fn extract_vnf_id(response: Option<&Value>) -> MendloopResult<String> {
    let response = response.ok_or_else(|| MendloopError::invalid_target("No vnf-id found"))?;

    response
        .get(keys::GENERIC_VNF_VNF_ID)
        .or_else(|| response.get("generic-vnf").and_then(|vnf| vnf.get("vnf-id")))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| MendloopError::invalid_target("No vnf-id found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn event(target: &str, target_type: TargetType, aai: &[(&str, &str)]) -> ControlLoopEvent {
        let aai: BTreeMap<String, String> = aai
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ControlLoopEvent::onset("cl-1", Uuid::new_v4(), target, target_type, aai)
    }

    fn policy(target_type: TargetType) -> Policy {
        Policy::new("p1", "APPC", "Restart").with_target(target_type)
    }

    #[rstest]
    #[case(keys::VSERVER_VSERVER_NAME, TargetType::Vm, &[(keys::VSERVER_VSERVER_NAME, "vm-01")], "vm-01")]
    #[case("VM_NAME", TargetType::Vm, &[(keys::VSERVER_VSERVER_NAME, "vm-02")], "vm-02")]
    #[case(keys::GENERIC_VNF_VNF_ID, TargetType::Vnf, &[(keys::GENERIC_VNF_VNF_ID, "vnf-9")], "vnf-9")]
    #[case(keys::GENERIC_VNF_VNF_NAME, TargetType::Vnf, &[(keys::GENERIC_VNF_VNF_NAME, "n"), (keys::GENERIC_VNF_VNF_ID, "vnf-3")], "vnf-3")]
    #[case(keys::PNF_NAME, TargetType::Pnf, &[(keys::PNF_NAME, "pnf-1")], "pnf-1")]
    fn test_resolved(
        #[case] target: &str,
        #[case] target_type: TargetType,
        #[case] aai: &[(&str, &str)],
        #[case] expected: &str,
    ) {
        let event = event(target, target_type, aai);
        assert_eq!(
            resolve_target(&policy(target_type), &event).unwrap(),
            TargetResolution::Resolved(expected.to_string())
        );
    }

    #[test]
    fn test_vnf_name_needs_query() {
        let event = event(
            keys::GENERIC_VNF_VNF_NAME,
            TargetType::Vnf,
            &[(keys::GENERIC_VNF_VNF_NAME, "vnf-name")],
        );
        assert_eq!(
            resolve_target(&policy(TargetType::Vnf), &event).unwrap(),
            TargetResolution::NeedsCustomQuery
        );
    }

    #[rstest]
    #[case(keys::VSERVER_VSERVER_NAME, TargetType::Vm, &[(keys::GENERIC_VNF_VNF_ID, "x")], "Enrichment data is missing")]
    #[case(keys::VSERVER_VSERVER_NAME, TargetType::Pnf, &[(keys::PNF_NAME, "x")], "Target does not match")]
    #[case(keys::PNF_NAME, TargetType::Pnf, &[], "AAI section is missing")]
    fn test_invalid(
        #[case] target: &str,
        #[case] policy_type: TargetType,
        #[case] aai: &[(&str, &str)],
        #[case] expected: &str,
    ) {
        let event = event(target, TargetType::Vm, aai);
        let err = resolve_target(&policy(policy_type), &event).unwrap_err();
        assert!(err.to_string().contains(expected), "{}", err);
    }

    #[test]
    fn test_policy_without_target_type() {
        let event = event(keys::VSERVER_VSERVER_NAME, TargetType::Vm, &[]);
        let policy = Policy::new("p1", "APPC", "Restart");
        assert!(resolve_target(&policy, &event).is_err());
    }

    #[test]
    fn test_extract_vnf_id() {
        assert_eq!(
            extract_vnf_id(Some(&json!({"generic-vnf.vnf-id": "vnf-1"}))).unwrap(),
            "vnf-1"
        );
        assert_eq!(
            extract_vnf_id(Some(&json!({"generic-vnf": {"vnf-id": "vnf-2"}}))).unwrap(),
            "vnf-2"
        );
        assert!(extract_vnf_id(Some(&json!({"generic-vnf": {}}))).is_err());
        assert!(extract_vnf_id(None).is_err());
    }
}
