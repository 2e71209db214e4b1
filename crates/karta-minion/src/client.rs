use karta_core::chaos::ChaosAction;
use karta_core::results::ScenarioResult;
use karta_core::types::{TestExecutionContext, TestStep};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::MinionError;
use crate::protocol::{
    ChaosActionParams, RpcRequest, RpcResponse, RunScenarioParams, RunStepParams, METHOD_HEALTH,
    METHOD_PERFORM_CHAOS_ACTION, METHOD_RUN_SCENARIO, METHOD_RUN_STEP,
};
use crate::service::{MinionHealth, MinionService, RemoteStepOutcome, ScenarioRequest};

/// Calls a minion over TCP, one connection per call.
#[derive(Debug)]
pub struct TcpMinionClient {
    address: String,
    read_timeout: Option<Duration>,
    next_id: AtomicU64,
}

impl TcpMinionClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            read_timeout: None,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, MinionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params).map_err(|source| MinionError::Json { source })?,
        };
        let mut line =
            serde_json::to_string(&request).map_err(|source| MinionError::Json { source })?;
        line.push('\n');

        let mut stream = TcpStream::connect(&self.address).map_err(|source| self.transport(source))?;
        stream
            .set_read_timeout(self.read_timeout)
            .map_err(|source| self.transport(source))?;
        stream
            .write_all(line.as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|source| self.transport(source))?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        let read = reader
            .read_line(&mut reply)
            .map_err(|source| self.transport(source))?;
        if read == 0 {
            return Err(MinionError::ConnectionClosed {
                address: self.address.clone(),
            });
        }

        let response: RpcResponse = serde_json::from_str(reply.trim_end()).map_err(|err| {
            MinionError::Protocol {
                message: format!("malformed response from {}: {err}", self.address),
            }
        })?;
        if response.id != id {
            return Err(MinionError::Protocol {
                message: format!("expected response id {id}, got {}", response.id),
            });
        }
        if let Some(error) = response.error {
            return Err(MinionError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        let result = response.result.ok_or_else(|| MinionError::Protocol {
            message: format!("response {id} carries neither result nor error"),
        })?;
        serde_json::from_value(result).map_err(|err| MinionError::Protocol {
            message: format!("unexpected {method} result: {err}"),
        })
    }

    fn transport(&self, source: std::io::Error) -> MinionError {
        MinionError::Transport {
            address: self.address.clone(),
            source,
        }
    }
}

impl MinionService for TcpMinionClient {
    fn run_step(
        &self,
        plugin: &str,
        step: &TestStep,
        context: &TestExecutionContext,
    ) -> Result<RemoteStepOutcome, MinionError> {
        self.call(
            METHOD_RUN_STEP,
            &RunStepParams {
                plugin: plugin.to_string(),
                step: step.clone(),
                context: context.clone(),
            },
        )
    }

    fn perform_chaos_action(
        &self,
        plugin: &str,
        action: &ChaosAction,
        context: &TestExecutionContext,
    ) -> Result<RemoteStepOutcome, MinionError> {
        self.call(
            METHOD_PERFORM_CHAOS_ACTION,
            &ChaosActionParams {
                plugin: plugin.to_string(),
                action: action.clone(),
                context: context.clone(),
            },
        )
    }

    fn run_scenario(&self, request: &ScenarioRequest) -> Result<ScenarioResult, MinionError> {
        self.call(
            METHOD_RUN_SCENARIO,
            &RunScenarioParams {
                request: request.clone(),
            },
        )
    }

    fn health(&self) -> Result<MinionHealth, MinionError> {
        self.call(METHOD_HEALTH, &serde_json::Value::Null)
    }
}
