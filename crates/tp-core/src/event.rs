// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lifecycle event frames carried by the broker.
//!
//! Every computation state transition is published as a
//! [`ComputeCommandResult`] on the fan-out exchange; subscribers receive
//! future frames only — there is no backlog replay.

use crate::aoi::AoiFeature;
use crate::computation::ComputationState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the fan-out exchange carrying lifecycle events.
pub const NOTIFY_EXCHANGE: &str = "notify";

/// The payload dispatched to a plugin worker to run one computation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputeCommand {
    /// Canonical identifier of the computation; doubles as the task id.
    pub correlation_uuid: Uuid,
    /// Target area of interest.
    pub aoi: AoiFeature,
    /// Raw computation parameters.
    pub params: serde_json::Value,
}

/// A lifecycle state transition, published on every change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputeCommandResult {
    /// The computation this frame belongs to.
    pub correlation_uuid: Uuid,
    /// The state entered.
    pub status: ComputationState,
    /// Message accompanying the transition (e.g. a failure reason).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

impl ComputeCommandResult {
    /// A frame for `status` stamped with the current time.
    pub fn now(correlation_uuid: Uuid, status: ComputationState, message: Option<String>) -> Self {
        Self {
            correlation_uuid,
            status,
            message,
            timestamp: Utc::now(),
        }
    }
}

/// An info request addressed to a plugin's reply queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoCommand {
    /// Correlates the reply with the request.
    pub correlation_uuid: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aoi::{AoiProperties, MultiPolygon};

    #[test]
    fn compute_command_roundtrip() {
        let command = ComputeCommand {
            correlation_uuid: Uuid::new_v4(),
            aoi: AoiFeature::new(
                MultiPolygon::bounding_box(0.0, 0.0, 1.0, 1.0),
                AoiProperties::new("Box", "box-1"),
            ),
            params: serde_json::json!({"id": 1}),
        };
        let json = serde_json::to_string(&command).unwrap();
        let back: ComputeCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, command);
    }

    #[test]
    fn result_omits_absent_message() {
        let frame =
            ComputeCommandResult::now(Uuid::nil(), ComputationState::Pending, None);
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("message").is_none());
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn result_roundtrip_with_message() {
        let frame = ComputeCommandResult::now(
            Uuid::new_v4(),
            ComputationState::Failure,
            Some("boom".into()),
        );
        let json = serde_json::to_string(&frame).unwrap();
        let back: ComputeCommandResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }
}
