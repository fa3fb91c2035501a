//! Template builder (C3).
//!
//! Converts a human-authored diagram — an ordered list of
//! `(action-string, config-map)` entries — into a validated [`Template`]
//! of modules and wires, resolved against an [`Instrument`]'s module menu.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::registry::{Instrument, Module, Registry, Template, TemplateModule, Wire};

/// One entry of the diagram: `"<name>"` or `"<name> => <alias>"`, plus its
/// config map (field defaults and wire specifications, keyed by field or
/// input-terminal id).
pub type DiagramStep = (String, serde_json::Map<String, Value>);

fn validation(message: String) -> EngineError {
    EngineError::Validation { message }
}

fn instrument_modules(registry: &Registry, instrument: &Instrument) -> EngineResult<Vec<std::sync::Arc<Module>>> {
    let mut modules = Vec::new();
    for (_, ids) in &instrument.menu {
        for id in ids {
            modules.push(registry.lookup_module(id)?);
        }
    }
    Ok(modules)
}

/// Builds a `Template` from `diagram` against `instrument`'s module menu.
pub fn make_template(
    registry: &Registry,
    name: &str,
    description: &str,
    diagram: &[DiagramStep],
    instrument: &Instrument,
    version: &str,
) -> EngineResult<Template> {
    let available = instrument_modules(registry, instrument)?;

    let mut modules: Vec<TemplateModule> = Vec::new();
    let mut wires: Vec<Wire> = Vec::new();
    let mut aliases: HashMap<String, usize> = HashMap::new();
    let mut by_module_id: HashMap<String, Vec<usize>> = HashMap::new();
    // target (node, terminal) -> number of wires resolved to it so far,
    // used to enforce the single-wire-unless-multiple rule.
    let mut wire_counts: HashMap<(usize, String), usize> = HashMap::new();

    for (step_index, (action_string, config_map)) in diagram.iter().enumerate() {
        let (module_name, alias) = match action_string.split_once("=>") {
            Some((name, alias)) => (name.trim().to_string(), Some(alias.trim().to_string())),
            None => (action_string.trim().to_string(), None),
        };

        let module = available
            .iter()
            .find(|m| m.id == module_name)
            .ok_or_else(|| validation(format!("unresolved module name '{module_name}' in diagram")))?;

        if let Some(alias) = &alias {
            if aliases.contains_key(alias) {
                return Err(validation(format!("alias '{alias}' redefined")));
            }
            aliases.insert(alias.clone(), step_index);
        }
        by_module_id.entry(module.id.clone()).or_default().push(step_index);

        let mut field_config = serde_json::Map::new();
        let mut wire_specs: Vec<(String, String)> = Vec::new(); // (target terminal id, spec)

        for (key, value) in config_map {
            if module.get_output(key).is_some() {
                return Err(validation(format!(
                    "step {step_index} ('{module_name}'): output terminal '{key}' cannot be configured"
                )));
            } else if module.get_input(key).is_some() {
                let spec = value.as_str().ok_or_else(|| {
                    validation(format!(
                        "step {step_index}: wire spec for '{key}' must be a string"
                    ))
                })?;
                wire_specs.push((key.clone(), spec.to_string()));
            } else if module.get_field_by_id(key).is_some() {
                field_config.insert(key.clone(), value.clone());
            } else {
                return Err(validation(format!(
                    "step {step_index} ('{module_name}'): unknown config key '{key}'"
                )));
            }
        }

        for (target_terminal, spec) in &wire_specs {
            let terminal = module.get_input(target_terminal).expect("checked above");

            for source_spec in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let source_node = resolve_source(source_spec, step_index, &aliases, &by_module_id)?;
                let source_module_id = &modules[source_node].module;
                let source_module = available
                    .iter()
                    .find(|m| &m.id == source_module_id)
                    .expect("every template node's module was resolved from `available`");

                let (source_terminal_id, source_output) = split_source_terminal(source_spec, source_module)?;

                if source_output.datatype != terminal.datatype {
                    return Err(validation(format!(
                        "step {step_index}: wire '{spec}' datatype mismatch ('{}' vs '{}')",
                        source_output.datatype, terminal.datatype
                    )));
                }

                let key = (step_index, target_terminal.clone());
                let count = wire_counts.entry(key).or_insert(0);
                *count += 1;
                if !terminal.multiple && *count > 1 {
                    return Err(validation(format!(
                        "step {step_index}: terminal '{target_terminal}' is not `multiple` but has more than one wire"
                    )));
                }

                wires.push(Wire {
                    source: (source_node, source_terminal_id),
                    target: (step_index, target_terminal.clone()),
                });
            }
        }

        for terminal in &module.inputs {
            if terminal.required && !wire_specs.iter().any(|(t, _)| t == &terminal.id) {
                return Err(validation(format!(
                    "step {step_index} ('{module_name}'): missing wire to required input '{}'",
                    terminal.id
                )));
            }
        }

        modules.push(TemplateModule {
            module: module.id.clone(),
            version: module.version.clone(),
            config: field_config,
        });
    }

    Ok(Template {
        name: name.to_string(),
        description: description.to_string(),
        version: version.to_string(),
        instrument: instrument.id.clone(),
        modules,
        wires,
    })
}

fn resolve_source(
    source_spec: &str,
    step_index: usize,
    aliases: &HashMap<String, usize>,
    by_module_id: &HashMap<String, Vec<usize>>,
) -> EngineResult<usize> {
    let (source_ref, _terminal) = source_spec
        .split_once('.')
        .ok_or_else(|| validation(format!("malformed wire spec '{source_spec}' (expected 'source.terminal')")))?;

    if source_ref == "-" {
        if step_index == 0 {
            return Err(validation("step 0: '-' has no preceding step".to_string()));
        }
        return Ok(step_index - 1);
    }

    if let Some(&node) = aliases.get(source_ref) {
        return Ok(node);
    }

    match by_module_id.get(source_ref) {
        Some(steps) if steps.len() == 1 => Ok(steps[0]),
        Some(steps) if steps.len() > 1 => Err(validation(format!(
            "wire spec '{source_spec}': module '{source_ref}' appears more than once; use an alias"
        ))),
        _ => Err(validation(format!(
            "wire spec '{source_spec}': unresolved source '{source_ref}'"
        ))),
    }
}

fn split_source_terminal<'a>(
    source_spec: &str,
    source_module: &'a Module,
) -> EngineResult<(String, &'a crate::registry::Terminal)> {
    let (_, terminal_id) = source_spec
        .split_once('.')
        .ok_or_else(|| validation(format!("malformed wire spec '{source_spec}'")))?;
    let terminal = source_module
        .get_output(terminal_id)
        .ok_or_else(|| validation(format!("wire spec '{source_spec}': unknown output terminal '{terminal_id}'")))?;
    Ok((terminal_id.to_string(), terminal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DataType, Terminal};
    use std::sync::Arc;

    fn test_module(id: &str, has_input: bool) -> Module {
        Module {
            id: id.to_string(),
            version: "1".to_string(),
            name: id.to_string(),
            description: String::new(),
            inputs: if has_input {
                vec![Terminal {
                    id: "data".to_string(),
                    datatype: "demo.data".to_string(),
                    required: true,
                    multiple: false,
                    label: "Data".to_string(),
                    description: String::new(),
                }]
            } else {
                vec![]
            },
            outputs: vec![Terminal {
                id: "output".to_string(),
                datatype: "demo.data".to_string(),
                required: false,
                multiple: false,
                label: "Output".to_string(),
                description: String::new(),
            }],
            fields: vec![],
            action_id: format!("{id}::action"),
            action: Arc::new(|_, _| Ok(vec![Value::Null])),
        }
    }

    fn setup() -> (Registry, Instrument) {
        let registry = Registry::new();
        registry.register_datatype(DataType::json("demo.data", "1")).unwrap();
        registry.register_module(test_module("demo.loader", false)).unwrap();
        registry.register_module(test_module("demo.scaler", true)).unwrap();
        let instrument = Instrument {
            id: "demo".to_string(),
            name: "Demo".to_string(),
            menu: vec![(
                "ops".to_string(),
                vec!["demo.loader".to_string(), "demo.scaler".to_string()],
            )],
            datatypes: vec!["demo.data".to_string()],
            templates: vec![],
        };
        (registry, instrument)
    }

    #[test]
    fn builds_a_two_step_chain() {
        let (registry, instrument) = setup();
        let mut scaler_config = serde_json::Map::new();
        scaler_config.insert("data".to_string(), Value::String("-.output".to_string()));

        let diagram = vec![
            ("demo.loader".to_string(), serde_json::Map::new()),
            ("demo.scaler".to_string(), scaler_config),
        ];

        let template = make_template(&registry, "t", "d", &diagram, &instrument, "1.0").unwrap();
        assert_eq!(template.modules.len(), 2);
        assert_eq!(template.wires.len(), 1);
        assert_eq!(template.wires[0].source, (0, "output".to_string()));
        assert_eq!(template.wires[0].target, (1, "data".to_string()));
    }

    #[test]
    fn missing_required_wire_fails() {
        let (registry, instrument) = setup();
        let diagram = vec![
            ("demo.loader".to_string(), serde_json::Map::new()),
            ("demo.scaler".to_string(), serde_json::Map::new()),
        ];
        let err = make_template(&registry, "t", "d", &diagram, &instrument, "1.0").unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn dash_at_step_zero_fails() {
        let (registry, instrument) = setup();
        let mut config = serde_json::Map::new();
        config.insert("data".to_string(), Value::String("-.output".to_string()));
        let diagram = vec![("demo.scaler".to_string(), config)];
        let err = make_template(&registry, "t", "d", &diagram, &instrument, "1.0").unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn configuring_an_output_terminal_fails() {
        let (registry, instrument) = setup();
        let mut config = serde_json::Map::new();
        config.insert("output".to_string(), Value::from(1));
        let diagram = vec![("demo.loader".to_string(), config)];
        let err = make_template(&registry, "t", "d", &diagram, &instrument, "1.0").unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn alias_allows_repeated_module_as_a_wire_source() {
        let (registry, instrument) = setup();
        let mut scaler_config = serde_json::Map::new();
        scaler_config.insert("data".to_string(), Value::String("loader1.output".to_string()));

        let diagram = vec![
            ("demo.loader => loader1".to_string(), serde_json::Map::new()),
            ("demo.scaler".to_string(), scaler_config),
        ];
        let template = make_template(&registry, "t", "d", &diagram, &instrument, "1.0").unwrap();
        assert_eq!(template.wires[0].source.0, 0);
    }
}
