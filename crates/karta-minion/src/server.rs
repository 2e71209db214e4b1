use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::MinionError;
use crate::protocol::{
    ChaosActionParams, RpcRequest, RpcResponse, RunScenarioParams, RunStepParams, INTERNAL_ERROR,
    INVALID_PARAMS, INVALID_REQUEST, MAX_FRAME_BYTES, METHOD_HEALTH, METHOD_NOT_FOUND,
    METHOD_PERFORM_CHAOS_ACTION, METHOD_RUN_SCENARIO, METHOD_RUN_STEP, PARSE_ERROR,
};
use crate::service::MinionService;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const CONNECTION_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    max_frame_bytes: usize,
    read_timeout: Duration,
}

/// Serves a [`MinionService`] over newline-delimited JSON-RPC, one thread per connection.
pub struct MinionServer {
    listener: TcpListener,
    service: Arc<dyn MinionService>,
    shutdown: Arc<AtomicBool>,
    limits: ConnectionLimits,
}

impl MinionServer {
    pub fn bind(address: &str, service: Arc<dyn MinionService>) -> Result<Self, MinionError> {
        let transport = |source| MinionError::Transport {
            address: address.to_string(),
            source,
        };
        let listener = TcpListener::bind(address).map_err(transport)?;
        listener.set_nonblocking(true).map_err(transport)?;
        Ok(Self {
            listener,
            service,
            shutdown: Arc::new(AtomicBool::new(false)),
            limits: ConnectionLimits {
                max_frame_bytes: MAX_FRAME_BYTES,
                read_timeout: CONNECTION_READ_TIMEOUT,
            },
        })
    }

    /// Connections sending a longer request line get an error reply and are closed.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.limits.max_frame_bytes = max_frame_bytes.max(1);
        self
    }

    /// How long a connection may sit without sending a complete request.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.limits.read_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, MinionError> {
        self.listener
            .local_addr()
            .map_err(|source| MinionError::Transport {
                address: "listener".to_string(),
                source,
            })
    }

    /// Flag that stops [`MinionServer::serve`] once set.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Accepts connections until the shutdown flag is set.
    pub fn serve(&self) -> Result<(), MinionError> {
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let service = self.service.clone();
                    let limits = self.limits;
                    thread::spawn(move || {
                        if let Err(err) = handle_connection(stream, service.as_ref(), limits) {
                            tracing::warn!(%peer, error = %err, "minion connection error");
                        }
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(MinionError::Transport {
                        address: "listener".to_string(),
                        source,
                    })
                }
            }
        }
        tracing::info!("minion server stopped");
        Ok(())
    }

    /// Runs [`MinionServer::serve`] on a background thread.
    pub fn spawn(self) -> Result<MinionServerHandle, MinionError> {
        let address = self.local_addr()?;
        let shutdown = self.shutdown_flag();
        let thread = thread::spawn(move || self.serve());
        Ok(MinionServerHandle {
            address,
            shutdown,
            thread: Some(thread),
        })
    }
}

pub struct MinionServerHandle {
    address: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), MinionError>>>,
}

impl MinionServerHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(mut self) -> Result<(), MinionError> {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> Result<(), MinionError> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| MinionError::Protocol {
                message: "minion server thread panicked".to_string(),
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for MinionServerHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop_inner() {
            tracing::warn!(error = %err, "minion server did not stop cleanly");
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    service: &dyn MinionService,
    limits: ConnectionLimits,
) -> Result<(), MinionError> {
    let io_error = |source| MinionError::Transport {
        address: "peer".to_string(),
        source,
    };
    stream.set_nonblocking(false).map_err(io_error)?;
    stream
        .set_read_timeout(Some(limits.read_timeout))
        .map_err(io_error)?;
    let mut writer = stream.try_clone().map_err(io_error)?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader
            .by_ref()
            .take(limits.max_frame_bytes as u64 + 1)
            .read_line(&mut line);
        match read {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                tracing::debug!("minion connection idle past its read timeout; closing");
                return Ok(());
            }
            Err(source) => return Err(io_error(source)),
        }

        if line.len() > limits.max_frame_bytes {
            let message = format!("request frame exceeds {} bytes", limits.max_frame_bytes);
            let response = RpcResponse::failure(0, INVALID_REQUEST, message.clone());
            write_response(&mut writer, &response).map_err(io_error)?;
            return Err(MinionError::Protocol { message });
        }
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(service, &line);
        write_response(&mut writer, &response).map_err(io_error)?;
    }
}

fn write_response(writer: &mut TcpStream, response: &RpcResponse) -> std::io::Result<()> {
    let mut payload =
        serde_json::to_string(response).unwrap_or_else(|err| fallback_response(response.id, &err));
    payload.push('\n');
    writer.write_all(payload.as_bytes())?;
    writer.flush()
}

/// Decodes one request line and dispatches it to `service`.
pub fn handle_line(service: &dyn MinionService, line: &str) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => return RpcResponse::failure(0, PARSE_ERROR, format!("parse error: {err}")),
    };
    let id = request.id;

    let outcome = match request.method.as_str() {
        METHOD_RUN_STEP => decode::<RunStepParams>(request.params)
            .and_then(|p| encode(service.run_step(&p.plugin, &p.step, &p.context))),
        METHOD_PERFORM_CHAOS_ACTION => decode::<ChaosActionParams>(request.params).and_then(|p| {
            encode(service.perform_chaos_action(&p.plugin, &p.action, &p.context))
        }),
        METHOD_RUN_SCENARIO => decode::<RunScenarioParams>(request.params)
            .and_then(|p| encode(service.run_scenario(&p.request))),
        METHOD_HEALTH => encode(service.health()),
        other => Err((METHOD_NOT_FOUND, format!("unknown method '{other}'"))),
    };

    match outcome {
        Ok(result) => RpcResponse::success(id, result),
        Err((code, message)) => RpcResponse::failure(id, code, message),
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> Result<T, (i64, String)> {
    serde_json::from_value(params).map_err(|err| (INVALID_PARAMS, format!("invalid params: {err}")))
}

fn encode<T: serde::Serialize>(
    outcome: Result<T, MinionError>,
) -> Result<serde_json::Value, (i64, String)> {
    let value = outcome.map_err(|err| (INTERNAL_ERROR, err.to_string()))?;
    serde_json::to_value(value).map_err(|err| (INTERNAL_ERROR, err.to_string()))
}

fn fallback_response(id: u64, err: &serde_json::Error) -> String {
    format!(
        "{{\"id\":{id},\"error\":{{\"code\":{INTERNAL_ERROR},\"message\":\"failed to serialize response: {}\"}}}}",
        err.to_string().replace('"', "'")
    )
}
