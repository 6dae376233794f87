use crate::machine::MachineInfo;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const METHOD_NOT_FOUND: &str = "method_not_found";
pub const INVALID_PARAMS: &str = "invalid_params";
pub const MAX_WAIT_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct CommandFailure {
    pub code: String,
    pub message: String,
}

impl CommandFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Executes relay requests. Runs on a blocking worker, so implementations
/// may block.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, method: &str, params: &Value) -> Result<Value, CommandFailure>;
}

pub struct BuiltinHandler {
    machine: MachineInfo,
    started: Instant,
}

impl BuiltinHandler {
    pub fn new(machine: MachineInfo) -> Self {
        Self {
            machine,
            started: Instant::now(),
        }
    }

    fn tools() -> Value {
        json!({
            "tools": [
                {
                    "name": "system_info",
                    "description": "Machine identity, OS and hardware summary",
                    "inputSchema": {"type": "object", "properties": {}}
                },
                {
                    "name": "wait",
                    "description": "Sleep for the given number of milliseconds",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"ms": {"type": "integer", "maximum": MAX_WAIT_MS}},
                        "required": ["ms"]
                    }
                },
                {
                    "name": "echo",
                    "description": "Return the supplied text",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                        "required": ["text"]
                    }
                }
            ]
        })
    }

    fn system_info(&self) -> Value {
        json!({
            "machineId": self.machine.machine_id,
            "machineName": self.machine.machine_name,
            "osType": self.machine.os_type,
            "osVersion": self.machine.os_version,
            "arch": self.machine.arch,
            "cpuModel": self.machine.cpu_model,
            "macAddresses": self.machine.mac_addresses,
            "agentVersion": env!("CARGO_PKG_VERSION"),
            "uptimeSeconds": self.started.elapsed().as_secs(),
        })
    }

    fn wait(params: &Value) -> Result<Value, CommandFailure> {
        let ms = params
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| CommandFailure::new(INVALID_PARAMS, "wait requires integer ms"))?;
        if ms > MAX_WAIT_MS {
            return Err(CommandFailure::new(
                INVALID_PARAMS,
                format!("ms must be at most {MAX_WAIT_MS}"),
            ));
        }
        std::thread::sleep(Duration::from_millis(ms));
        Ok(json!({"waited": ms}))
    }

    fn echo(params: &Value) -> Result<Value, CommandFailure> {
        let text = params
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| CommandFailure::new(INVALID_PARAMS, "echo requires text"))?;
        Ok(json!({"text": text}))
    }

    fn call_tool(&self, params: &Value) -> Result<Value, CommandFailure> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| CommandFailure::new(INVALID_PARAMS, "tools/call requires name"))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let output = match name {
            "system_info" => self.system_info(),
            "wait" => Self::wait(&arguments)?,
            "echo" => Self::echo(&arguments)?,
            other => {
                return Err(CommandFailure::new(
                    METHOD_NOT_FOUND,
                    format!("unknown tool: {other}"),
                ))
            }
        };
        Ok(json!({
            "content": [{"type": "text", "text": output.to_string()}],
            "isError": false,
        }))
    }
}

impl CommandHandler for BuiltinHandler {
    fn handle(&self, method: &str, params: &Value) -> Result<Value, CommandFailure> {
        match method {
            "tools/list" => Ok(Self::tools()),
            "tools/call" => self.call_tool(params),
            "system_info" => Ok(self.system_info()),
            "wait" => Self::wait(params),
            "echo" => Self::echo(params),
            other => Err(CommandFailure::new(
                METHOD_NOT_FOUND,
                format!("unknown method: {other}"),
            )),
        }
    }
}
