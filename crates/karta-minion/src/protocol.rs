//! Newline-delimited JSON-RPC messages exchanged with minions.

use karta_core::chaos::ChaosAction;
use karta_core::types::{TestExecutionContext, TestStep};
use serde::{Deserialize, Serialize};

use crate::service::ScenarioRequest;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const METHOD_RUN_STEP: &str = "run_step";
pub const METHOD_PERFORM_CHAOS_ACTION: &str = "perform_chaos_action";
pub const METHOD_RUN_SCENARIO: &str = "run_scenario";
pub const METHOD_HEALTH: &str = "health";

/// Largest request line a minion accepts, newline included.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStepParams {
    pub plugin: String,
    pub step: TestStep,
    pub context: TestExecutionContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosActionParams {
    pub plugin: String,
    pub action: ChaosAction,
    pub context: TestExecutionContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunScenarioParams {
    pub request: ScenarioRequest,
}
