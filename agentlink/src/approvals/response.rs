//! Reply payloads for approval requests.

use serde::Serialize;
use serde_json::{Map, Value};

use super::{ApprovalError, ApprovalKind, Decision};

/// Result body sent back for an approval request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_settings: Option<Map<String, Value>>,
}

impl ApprovalResponse {
    /// A decline without settings.
    #[must_use]
    pub const fn decline() -> Self {
        Self {
            decision: Decision::Decline,
            accept_settings: None,
        }
    }
}

impl From<Decision> for ApprovalResponse {
    fn from(decision: Decision) -> Self {
        Self {
            decision,
            accept_settings: None,
        }
    }
}

/// Builds the reply for an approval decision.
///
/// Settings are only attached to an accepted command execution with
/// non-blank settings text.
///
/// # Errors
///
/// [`ApprovalError::InvalidSettingsJson`] if the settings text is not JSON,
/// [`ApprovalError::SettingsNotObject`] if it is JSON but not an object.
pub fn build_response(
    kind: ApprovalKind,
    decision: Decision,
    settings_json: Option<&str>,
) -> Result<ApprovalResponse, ApprovalError> {
    let bare = ApprovalResponse::from(decision);
    if decision == Decision::Decline || kind != ApprovalKind::CommandExecution {
        return Ok(bare);
    }
    let raw = settings_json.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Ok(bare);
    }
    let parsed: Value =
        serde_json::from_str(raw).map_err(|_| ApprovalError::InvalidSettingsJson)?;
    let Value::Object(settings) = parsed else {
        return Err(ApprovalError::SettingsNotObject);
    };
    Ok(ApprovalResponse {
        decision,
        accept_settings: Some(settings),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decline_never_carries_settings() {
        let response = build_response(
            ApprovalKind::CommandExecution,
            Decision::Decline,
            Some(r#"{"sandbox":"off"}"#),
        )
        .unwrap();
        assert_eq!(serde_json::to_value(&response).unwrap(), json!({ "decision": "decline" }));
    }

    #[test]
    fn file_change_accept_ignores_settings() {
        let response =
            build_response(ApprovalKind::FileChange, Decision::Accept, Some("not json")).unwrap();
        assert_eq!(serde_json::to_value(&response).unwrap(), json!({ "decision": "accept" }));
    }

    #[test]
    fn accepted_command_attaches_settings() {
        let response = build_response(
            ApprovalKind::CommandExecution,
            Decision::Accept,
            Some(r#"  {"forSession": true}  "#),
        )
        .unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "decision": "accept", "acceptSettings": { "forSession": true } })
        );
    }

    #[test]
    fn blank_settings_are_omitted() {
        let response =
            build_response(ApprovalKind::CommandExecution, Decision::Accept, Some("   ")).unwrap();
        assert!(response.accept_settings.is_none());
    }

    #[test]
    fn invalid_settings() {
        assert_eq!(
            build_response(ApprovalKind::CommandExecution, Decision::Accept, Some("{oops"))
                .unwrap_err()
                .to_string(),
            "acceptSettings must be valid JSON."
        );
        assert_eq!(
            build_response(ApprovalKind::CommandExecution, Decision::Accept, Some("[1]"))
                .unwrap_err()
                .to_string(),
            "acceptSettings JSON must be an object."
        );
    }
}
