//! RPC method dispatch (C9): the seven methods, matched on the request's
//! `command` field.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::executor::Executor;
use crate::registry::{Field, Registry, Template, Terminal};

use super::ServerState;

#[derive(Debug, Serialize)]
struct ModuleDefinition {
    id: String,
    version: String,
    name: String,
    description: String,
    inputs: Vec<Terminal>,
    outputs: Vec<Terminal>,
    fields: Vec<Field>,
}

#[derive(Debug, Serialize)]
struct InstrumentDefinition {
    id: String,
    name: String,
    datatypes: Vec<String>,
    modules: Vec<ModuleDefinition>,
    templates: Vec<Template>,
}

fn error_response(request_id: Option<Value>, err: impl std::fmt::Display) -> Value {
    let mut map = Map::new();
    map.insert("success".to_string(), Value::Bool(false));
    map.insert("error".to_string(), Value::String(err.to_string()));
    if let Some(id) = request_id {
        map.insert("requestId".to_string(), id);
    }
    Value::Object(map)
}

fn ok_response(request_id: Option<Value>, result: Value) -> Value {
    let mut map = Map::new();
    map.insert("success".to_string(), Value::Bool(true));
    map.insert("result".to_string(), result);
    if let Some(id) = request_id {
        map.insert("requestId".to_string(), id);
    }
    Value::Object(map)
}

/// Parses one newline-delimited request line and dispatches it. Never
/// returns an `Err` itself — any failure, including an unknown command,
/// is folded into a `success:false` response so a single bad request
/// never drops the connection.
pub fn handle_request(line: &str, state: &ServerState) -> Value {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return error_response(None, EngineError::Protocol { message: e.to_string() }),
    };

    let request_id = request.get("requestId").cloned();
    let command = match request.get("command").and_then(Value::as_str) {
        Some(c) => c.to_string(),
        None => {
            return error_response(
                request_id,
                EngineError::Protocol {
                    message: "request is missing a 'command' field".to_string(),
                },
            )
        }
    };

    match run_command(&command, &request, state) {
        Ok(result) => ok_response(request_id, result),
        Err(e) => error_response(request_id, e),
    }
}

fn run_command(command: &str, request: &Value, state: &ServerState) -> EngineResult<Value> {
    match command {
        "get_instrument" => get_instrument(request, &state.registry),
        "list_instruments" => Ok(json!(state.registry.list_instruments())),
        "list_datasources" => Err(unsupported("list_datasources", "no data-source catalog is built into this engine")),
        "calc_template" => calc_template(request, state),
        "calc_terminal" => calc_terminal(request, state),
        "find_calculated" => find_calculated(request, state),
        "get_file_metadata" => Err(unsupported(
            "get_file_metadata",
            "file-format and fetch/HTTP-cache access are outside this engine's scope",
        )),
        other => Err(EngineError::Protocol {
            message: format!("unknown command '{other}'"),
        }),
    }
}

fn unsupported(command: &str, reason: &str) -> EngineError {
    EngineError::Protocol {
        message: format!("'{command}' is not implemented: {reason}"),
    }
}

fn required_str<'a>(request: &'a Value, key: &str) -> EngineResult<&'a str> {
    request.get(key).and_then(Value::as_str).ok_or_else(|| EngineError::Protocol {
        message: format!("request is missing required string field '{key}'"),
    })
}

fn required_u64(request: &Value, key: &str) -> EngineResult<u64> {
    request.get(key).and_then(Value::as_u64).ok_or_else(|| EngineError::Protocol {
        message: format!("request is missing required integer field '{key}'"),
    })
}

fn required_template(request: &Value) -> EngineResult<Template> {
    let raw = request.get("template").ok_or_else(|| EngineError::Protocol {
        message: "request is missing required field 'template'".to_string(),
    })?;
    serde_json::from_value(raw.clone())
        .map_err(|e| EngineError::Protocol { message: format!("malformed 'template': {e}") })
}

fn config_map(request: &Value) -> Map<String, Value> {
    request
        .get("config")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn get_instrument(request: &Value, registry: &Registry) -> EngineResult<Value> {
    let id = required_str(request, "instrumentId").or_else(|_| required_str(request, "instrument_id"))?;
    let instrument = registry.lookup_instrument(id)?;

    let mut modules = Vec::new();
    for (_, module_ids) in &instrument.menu {
        for module_id in module_ids {
            let module = registry.lookup_module(module_id)?;
            modules.push(ModuleDefinition {
                id: module.id.clone(),
                version: module.version.clone(),
                name: module.name.clone(),
                description: module.description.clone(),
                inputs: module.inputs.clone(),
                outputs: module.outputs.clone(),
                fields: module.fields.clone(),
            });
        }
    }

    let definition = InstrumentDefinition {
        id: instrument.id.clone(),
        name: instrument.name.clone(),
        datatypes: instrument.datatypes.clone(),
        modules,
        templates: instrument.templates.clone(),
    };

    serde_json::to_value(definition).map_err(EngineError::from)
}

fn bundles_to_json(bundles: &std::collections::BTreeMap<(usize, String), crate::registry::Bundle>) -> Value {
    let mut by_node: std::collections::BTreeMap<usize, Map<String, Value>> = std::collections::BTreeMap::new();
    for ((node, terminal), bundle) in bundles {
        by_node.entry(*node).or_default().insert(
            terminal.clone(),
            json!({ "datatype": bundle.datatype, "values": bundle.values }),
        );
    }
    let mut out = Map::new();
    for (node, terminals) in by_node {
        out.insert(node.to_string(), Value::Object(terminals));
    }
    Value::Object(out)
}

fn calc_template(request: &Value, state: &ServerState) -> EngineResult<Value> {
    let template = required_template(request)?;
    let config = config_map(request);
    let bundles = Executor::run(&state.registry, state.cache.clone(), &template, &config, None)?;
    Ok(bundles_to_json(&bundles))
}

fn calc_terminal(request: &Value, state: &ServerState) -> EngineResult<Value> {
    let template = required_template(request)?;
    let config = config_map(request);
    let node = required_u64(request, "node")? as usize;
    let terminal = required_str(request, "terminal")?.to_string();

    if let Some(return_type) = request.get("returnType").and_then(Value::as_str) {
        if return_type != "full" {
            return Err(unsupported(
                "calc_terminal",
                &format!("return_type '{return_type}' requires plotting/export support this engine does not build"),
            ));
        }
    }

    let bundles = Executor::run(&state.registry, state.cache.clone(), &template, &config, Some((node, terminal)))?;
    let (_, bundle) = bundles.into_iter().next().ok_or_else(|| EngineError::Validation {
        message: format!("node {node} produced no result"),
    })?;
    Ok(json!({ "datatype": bundle.datatype, "values": bundle.values }))
}

fn find_calculated(request: &Value, state: &ServerState) -> EngineResult<Value> {
    let template = required_template(request)?;
    let config = config_map(request);
    let flags = Executor::find_calculated(&state.registry, state.cache.clone(), &template, &config)?;
    Ok(json!(flags))
}
