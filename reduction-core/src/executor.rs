//! Executor (C8): walks the ordered sub-graph, pulls inputs
//! from cache or recomputes, invokes the operation with correct arity,
//! stores outputs, and returns the requested terminal. Grounded in
//! `original_source/dataflow/calc.py`'s `process_template`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::codec;
use crate::deps;
use crate::error::{EngineError, EngineResult};
use crate::fingerprint::fingerprint_template;
use crate::registry::{ActionContext, Bundle, Module, ParamMap, Registry, Template};

/// `calc_template`/`calc_terminal`'s shared target selector: `None` runs
/// the whole template; `Some((node, terminal))` runs only the
/// backward-reachable subset.
pub type Target = Option<(usize, String)>;

pub struct Executor<'a> {
    registry: &'a Registry,
    cache: Arc<dyn Cache>,
    template: &'a Template,
    fingerprints: HashMap<usize, String>,
    node_outputs: BTreeMap<usize, BTreeMap<String, Bundle>>,
}

impl<'a> Executor<'a> {
    fn new(registry: &'a Registry, cache: Arc<dyn Cache>, template: &'a Template, order: &[usize], overrides: &Map<String, Value>) -> Self {
        let fingerprints = fingerprint_template(template, overrides, order);
        Self {
            registry,
            cache,
            template,
            fingerprints,
            node_outputs: BTreeMap::new(),
        }
    }

    /// Runs `template` under `overrides` and returns either the single
    /// requested `(node, terminal)` bundle or the full `{(node,terminal)
    /// -> Bundle}` map.
    pub fn run(
        registry: &Registry,
        cache: Arc<dyn Cache>,
        template: &Template,
        overrides: &Map<String, Value>,
        target: Target,
    ) -> EngineResult<BTreeMap<(usize, String), Bundle>> {
        let pairs = template.edge_pairs();
        let order = match &target {
            Some((node, _)) => deps::scoped_order(template.node_count(), &pairs, *node)?,
            None => deps::processing_order(template.node_count(), &pairs)?,
        };

        let mut executor = Executor::new(registry, cache, template, &order, overrides);

        for &node in &order {
            executor.ensure_node_executed(node, overrides)?;
        }

        let mut result = BTreeMap::new();
        match target {
            Some((node, terminal)) => {
                executor.ensure_loaded(node)?;
                let bundle = executor
                    .node_outputs
                    .get(&node)
                    .and_then(|outputs| outputs.get(&terminal))
                    .cloned()
                    .ok_or_else(|| EngineError::Validation {
                        message: format!("node {node} has no terminal '{terminal}'"),
                    })?;
                result.insert((node, terminal), bundle);
            }
            None => {
                for &node in &order {
                    executor.ensure_loaded(node)?;
                    if let Some(outputs) = executor.node_outputs.get(&node) {
                        for (terminal, bundle) in outputs {
                            result.insert((node, terminal.clone()), bundle.clone());
                        }
                    }
                }
            }
        }

        Ok(result)
    }

    /// Returns `true` for exactly the nodes whose fingerprint is already
    /// in the cache — the contract `find_calculated` relies on.
    pub fn find_calculated(
        registry: &Registry,
        cache: Arc<dyn Cache>,
        template: &Template,
        overrides: &Map<String, Value>,
    ) -> EngineResult<Vec<bool>> {
        let pairs = template.edge_pairs();
        let order = deps::processing_order(template.node_count(), &pairs)?;
        let fingerprints = fingerprint_template(template, overrides, &order);
        let _ = registry;
        Ok((0..template.node_count())
            .map(|node| cache.exists(&fingerprints[&node]))
            .collect())
    }

    fn fingerprint_of(&self, node: usize) -> &str {
        self.fingerprints
            .get(&node)
            .expect("every node this executor touches was included in `order`")
    }

    /// Loads node `node`'s output map into memory, either from a prior
    /// in-process computation this call, or lazily from the cache. A
    /// decode failure on a supposedly-cached node is treated as a miss
    /// and recomputed.
    fn ensure_loaded(&mut self, node: usize) -> EngineResult<()> {
        if self.node_outputs.contains_key(&node) {
            return Ok(());
        }

        let fp = self.fingerprint_of(node).to_string();
        if let Some(bytes) = self.cache.get(&fp) {
            match codec::decode_outputs(self.registry, &bytes) {
                Ok(decoded) => {
                    self.node_outputs.insert(node, decoded);
                    return Ok(());
                }
                Err(e) => {
                    warn!(node, fingerprint = %fp, error = %e, "cached bundle failed to decode, treating as a miss");
                }
            }
        }

        // Not cached (or failed to decode): this node was apparently
        // skipped as "already cached" upstream but isn't usable. Recompute
        // it directly with an empty overrides map.
        self.execute_node(node, &Map::new())
    }

    fn ensure_node_executed(&mut self, node: usize, overrides: &Map<String, Value>) -> EngineResult<()> {
        let fp = self.fingerprint_of(node).to_string();
        if self.cache.exists(&fp) {
            debug!(node, fingerprint = %fp, "cache hit, skipping invocation");
            return Ok(());
        }
        self.execute_node(node, overrides)
    }

    fn execute_node(&mut self, node: usize, overrides: &Map<String, Value>) -> EngineResult<()> {
        let template_module = &self.template.modules[node];
        let module = self.registry.lookup_module(&template_module.module)?;

        let mut input_values: std::collections::HashMap<String, Vec<Value>> = std::collections::HashMap::new();
        for wire in self.template.wires_into(node) {
            self.ensure_loaded(wire.source.0)?;
            let source_outputs = self
                .node_outputs
                .get(&wire.source.0)
                .expect("ensure_loaded populated this node");
            let bundle = source_outputs.get(&wire.source.1).ok_or_else(|| EngineError::Validation {
                message: format!(
                    "node {}: source terminal '{}' produced no output",
                    wire.source.0, wire.source.1
                ),
            })?;
            input_values
                .entry(wire.target.1.clone())
                .or_default()
                .extend(bundle.values.clone());
        }

        let mut effective_fields = template_module.config.clone();
        if let Some(Value::Object(node_overrides)) = overrides.get(&node.to_string()) {
            for field in &module.fields {
                if let Some(value) = node_overrides.get(&field.id) {
                    effective_fields.insert(field.id.clone(), value.clone());
                }
            }
        }

        debug!(node, module_id = %module.id, "invoking action");

        let outputs = invoke(&module, node, &effective_fields, &input_values)?;

        let bytes = codec::encode_outputs(&outputs)?;
        self.cache.set(self.fingerprint_of(node), bytes);
        self.node_outputs.insert(node, outputs);
        Ok(())
    }
}

fn field_value(module: &Module, fields: &ParamMap, id: &str) -> Value {
    fields
        .get(id)
        .cloned()
        .or_else(|| module.get_field_by_id(id).and_then(|f| f.default.clone()))
        .unwrap_or(Value::Null)
}

/// Resolves one element `i` out of `n` for a length-bearing value (field
/// default/config, or an accumulated input bundle): array length `n` ->
/// element `i`; length 1 -> broadcast element 0; length 0 -> `None`
/// (caller decides whether that's an error); any other length -> a hard
/// `ArityMismatch`. A non-array scalar
/// broadcasts to every index unconditionally.
fn resolve_indexed(
    value: &Value,
    n: usize,
    i: usize,
    node: usize,
    terminal: &str,
) -> EngineResult<Option<Value>> {
    match value {
        Value::Array(items) => match items.len() {
            len if len == n => Ok(Some(items[i].clone())),
            1 => Ok(Some(items[0].clone())),
            0 => Ok(None),
            actual => Err(EngineError::ArityMismatch {
                node,
                terminal: terminal.to_string(),
                expected: n,
                actual,
            }),
        },
        Value::Null => Ok(None),
        other => Ok(Some(other.clone())),
    }
}

fn invoke(
    module: &Module,
    node: usize,
    fields: &ParamMap,
    input_values: &std::collections::HashMap<String, Vec<Value>>,
) -> EngineResult<BTreeMap<String, Bundle>> {
    let has_inputs = !module.inputs.is_empty();
    let all_multiple = module.inputs.iter().all(|t| t.multiple);

    let mut accum: std::collections::HashMap<String, Vec<Value>> = std::collections::HashMap::new();

    if !has_inputs || all_multiple {
        let mut params = Map::new();
        for field in &module.fields {
            params.insert(field.id.clone(), field_value(module, fields, &field.id));
        }
        for terminal in &module.inputs {
            let values = input_values.get(&terminal.id).cloned().unwrap_or_default();
            params.insert(terminal.id.clone(), Value::Array(values));
        }

        let returned = call_action(module, node, &params)?;
        collect_single(module, returned, &mut accum)?;
    } else {
        let first = &module.inputs[0];
        let n = input_values.get(&first.id).map(Vec::len).unwrap_or(0);

        for i in 0..n {
            let mut params = Map::new();

            for field in &module.fields {
                let value = field_value(module, fields, &field.id);
                let resolved = if field.multiple {
                    Some(value)
                } else {
                    resolve_indexed(&value, n, i, node, &field.id)?
                };
                match resolved {
                    Some(v) => {
                        params.insert(field.id.clone(), v);
                    }
                    None if field.required => {
                        return Err(EngineError::MissingRequiredInput {
                            node,
                            terminal: field.id.clone(),
                        })
                    }
                    None => {}
                }
            }

            for terminal in &module.inputs {
                let values = input_values.get(&terminal.id).cloned().unwrap_or_default();
                if terminal.multiple {
                    params.insert(terminal.id.clone(), Value::Array(values));
                    continue;
                }
                let as_value = Value::Array(values);
                let resolved = resolve_indexed(&as_value, n, i, node, &terminal.id)?;
                match resolved {
                    Some(v) => {
                        params.insert(terminal.id.clone(), v);
                    }
                    None if terminal.required => {
                        return Err(EngineError::MissingRequiredInput {
                            node,
                            terminal: terminal.id.clone(),
                        })
                    }
                    None => {
                        params.insert(terminal.id.clone(), Value::Null);
                    }
                }
            }

            let returned = call_action(module, node, &params)?;
            collect_per_element(module, returned, &mut accum)?;
        }
    }

    Ok(module
        .outputs
        .iter()
        .map(|terminal| {
            let values = accum.remove(&terminal.id).unwrap_or_default();
            (terminal.id.clone(), Bundle::new(terminal.datatype.clone(), values))
        })
        .collect())
}

fn call_action(module: &Module, node: usize, params: &ParamMap) -> EngineResult<Vec<Value>> {
    (module.action)(&ActionContext, params).map_err(|e| EngineError::ActionFailed {
        node,
        module_id: module.id.clone(),
        cause: e.to_string(),
    })
}

fn collect_single(
    module: &Module,
    returned: Vec<Value>,
    accum: &mut std::collections::HashMap<String, Vec<Value>>,
) -> EngineResult<()> {
    if returned.len() != module.outputs.len() {
        return Err(EngineError::Validation {
            message: format!(
                "module '{}': action returned {} values, expected {}",
                module.id,
                returned.len(),
                module.outputs.len()
            ),
        });
    }
    for (terminal, value) in module.outputs.iter().zip(returned.into_iter()) {
        if terminal.multiple {
            let values = match value {
                Value::Array(items) => items,
                other => vec![other],
            };
            accum.insert(terminal.id.clone(), values);
        } else {
            accum.insert(terminal.id.clone(), vec![value]);
        }
    }
    Ok(())
}

fn collect_per_element(
    module: &Module,
    returned: Vec<Value>,
    accum: &mut std::collections::HashMap<String, Vec<Value>>,
) -> EngineResult<()> {
    if returned.len() != module.outputs.len() {
        return Err(EngineError::Validation {
            message: format!(
                "module '{}': action returned {} values, expected {}",
                module.id,
                returned.len(),
                module.outputs.len()
            ),
        });
    }
    for (terminal, value) in module.outputs.iter().zip(returned.into_iter()) {
        let entry = accum.entry(terminal.id.clone()).or_default();
        if terminal.multiple {
            match value {
                Value::Array(items) => entry.extend(items),
                other => entry.push(other),
            }
        } else {
            entry.push(value);
        }
    }
    Ok(())
}
