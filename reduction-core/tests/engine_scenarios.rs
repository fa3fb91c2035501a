//! End-to-end coverage of cache/arity/cycle behavior, driven through the
//! public API (registry -> template -> executor) with an in-process
//! cache, never touching executor/template/registry internals directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use reduction_core::cache::memory::InProcessCache;
use reduction_core::cache::Cache;
use reduction_core::error::EngineError;
use reduction_core::executor::Executor;
use reduction_core::registry::{
    ActionContext, Field, FieldDatatype, Module, ParamMap, Registry, Template, TemplateModule,
    Terminal, TypeAttr, Wire,
};

fn terminal(id: &str, datatype: &str, required: bool, multiple: bool) -> Terminal {
    Terminal {
        id: id.to_string(),
        datatype: datatype.to_string(),
        required,
        multiple,
        label: id.to_string(),
        description: String::new(),
    }
}

fn factor_field(default: f64) -> Field {
    Field {
        id: "factor".to_string(),
        datatype: FieldDatatype::Float,
        typeattr: TypeAttr::Float {
            units: String::new(),
            min: -1e300,
            max: 1e300,
        },
        default: Some(json!(default)),
        required: false,
        multiple: false,
        length: 1,
        label: "Factor".to_string(),
    }
}

fn counting_module(
    id: &str,
    inputs: Vec<Terminal>,
    outputs: Vec<Terminal>,
    fields: Vec<Field>,
    calls: Arc<AtomicUsize>,
    action: impl Fn(&ActionContext, &ParamMap) -> reduction_core::EngineResult<Vec<Value>> + Send + Sync + 'static,
) -> Module {
    Module {
        id: id.to_string(),
        version: "1".to_string(),
        name: id.to_string(),
        description: String::new(),
        inputs,
        outputs,
        fields,
        action_id: format!("{id}::action"),
        action: Arc::new(move |ctx, params| {
            calls.fetch_add(1, Ordering::SeqCst);
            action(ctx, params)
        }),
    }
}

fn node(module: &str, config: ParamMap) -> TemplateModule {
    TemplateModule {
        module: module.to_string(),
        version: "1".to_string(),
        config,
    }
}

fn empty_config() -> ParamMap {
    Map::new()
}

#[test]
fn two_step_chain_executes_once_and_caches_on_rerun() {
    let registry = Registry::new();
    let loader_calls = Arc::new(AtomicUsize::new(0));
    let scaler_calls = Arc::new(AtomicUsize::new(0));

    registry
        .register_module(counting_module(
            "demo.loader",
            vec![],
            vec![terminal("output", "demo.data", false, false)],
            vec![],
            loader_calls.clone(),
            |_, _| Ok(vec![json!(10.0)]),
        ))
        .unwrap();

    registry
        .register_module(counting_module(
            "demo.scaler",
            vec![terminal("data", "demo.data", true, false)],
            vec![terminal("output", "demo.data", false, false)],
            vec![factor_field(1.0)],
            scaler_calls.clone(),
            |_, params| {
                let data = params["data"].as_f64().unwrap();
                let factor = params["factor"].as_f64().unwrap();
                Ok(vec![json!(data * factor)])
            },
        ))
        .unwrap();

    let mut scaler_config = empty_config();
    scaler_config.insert("factor".to_string(), json!(2.0));

    let template = Template {
        name: "chain".to_string(),
        description: String::new(),
        version: "1".to_string(),
        instrument: "demo".to_string(),
        modules: vec![node("demo.loader", empty_config()), node("demo.scaler", scaler_config)],
        wires: vec![Wire {
            source: (0, "output".to_string()),
            target: (1, "data".to_string()),
        }],
    };

    let cache: Arc<dyn Cache> = Arc::new(InProcessCache::new());
    let overrides = empty_config();

    let first = Executor::run(&registry, cache.clone(), &template, &overrides, Some((1, "output".to_string()))).unwrap();
    let bundle = &first[&(1, "output".to_string())];
    assert_eq!(bundle.values, vec![json!(20.0)]);
    assert_eq!(loader_calls.load(Ordering::SeqCst), 1);
    assert_eq!(scaler_calls.load(Ordering::SeqCst), 1);

    let second = Executor::run(&registry, cache.clone(), &template, &overrides, Some((1, "output".to_string()))).unwrap();
    assert_eq!(second[&(1, "output".to_string())].values, vec![json!(20.0)]);
    // A second identical run executes zero actions.
    assert_eq!(loader_calls.load(Ordering::SeqCst), 1);
    assert_eq!(scaler_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn per_element_broadcast_runs_the_action_once_per_bundle_value() {
    let registry = Registry::new();
    let loader_calls = Arc::new(AtomicUsize::new(0));
    let scaler_calls = Arc::new(AtomicUsize::new(0));

    registry
        .register_module(counting_module(
            "demo.multi_loader",
            vec![],
            vec![terminal("output", "demo.data", false, true)],
            vec![],
            loader_calls.clone(),
            |_, _| Ok(vec![json!([1.0, 2.0, 3.0])]),
        ))
        .unwrap();

    registry
        .register_module(counting_module(
            "demo.scaler",
            vec![terminal("data", "demo.data", true, false)],
            vec![terminal("output", "demo.data", false, false)],
            vec![factor_field(1.0)],
            scaler_calls.clone(),
            |_, params| {
                let data = params["data"].as_f64().unwrap();
                let factor = params["factor"].as_f64().unwrap();
                Ok(vec![json!(data * factor)])
            },
        ))
        .unwrap();

    let mut scaler_config = empty_config();
    scaler_config.insert("factor".to_string(), json!(2.0));

    let template = Template {
        name: "broadcast".to_string(),
        description: String::new(),
        version: "1".to_string(),
        instrument: "demo".to_string(),
        modules: vec![node("demo.multi_loader", empty_config()), node("demo.scaler", scaler_config)],
        wires: vec![Wire {
            source: (0, "output".to_string()),
            target: (1, "data".to_string()),
        }],
    };

    let cache: Arc<dyn Cache> = Arc::new(InProcessCache::new());
    let result = Executor::run(&registry, cache, &template, &empty_config(), Some((1, "output".to_string()))).unwrap();

    let bundle = &result[&(1, "output".to_string())];
    assert_eq!(bundle.values, vec![json!(2.0), json!(4.0), json!(6.0)]);
    assert_eq!(loader_calls.load(Ordering::SeqCst), 1);
    assert_eq!(scaler_calls.load(Ordering::SeqCst), 3);
}

#[test]
fn upstream_results_are_not_recomputed_when_a_downstream_target_is_requested() {
    let registry = Registry::new();
    let loader_calls = Arc::new(AtomicUsize::new(0));
    let scaler_calls = Arc::new(AtomicUsize::new(0));
    let doubler_calls = Arc::new(AtomicUsize::new(0));

    registry
        .register_module(counting_module(
            "demo.loader",
            vec![],
            vec![terminal("output", "demo.data", false, false)],
            vec![],
            loader_calls.clone(),
            |_, _| Ok(vec![json!(10.0)]),
        ))
        .unwrap();
    registry
        .register_module(counting_module(
            "demo.scaler",
            vec![terminal("data", "demo.data", true, false)],
            vec![terminal("output", "demo.data", false, false)],
            vec![factor_field(1.0)],
            scaler_calls.clone(),
            |_, params| {
                let data = params["data"].as_f64().unwrap();
                let factor = params["factor"].as_f64().unwrap();
                Ok(vec![json!(data * factor)])
            },
        ))
        .unwrap();
    registry
        .register_module(counting_module(
            "demo.doubler",
            vec![terminal("data", "demo.data", true, false)],
            vec![terminal("output", "demo.data", false, false)],
            vec![],
            doubler_calls.clone(),
            |_, params| Ok(vec![json!(params["data"].as_f64().unwrap() * 2.0)]),
        ))
        .unwrap();

    let mut scaler_config = empty_config();
    scaler_config.insert("factor".to_string(), json!(2.0));

    let template = Template {
        name: "growing".to_string(),
        description: String::new(),
        version: "1".to_string(),
        instrument: "demo".to_string(),
        modules: vec![
            node("demo.loader", empty_config()),
            node("demo.scaler", scaler_config),
            node("demo.doubler", empty_config()),
        ],
        wires: vec![
            Wire {
                source: (0, "output".to_string()),
                target: (1, "data".to_string()),
            },
            Wire {
                source: (1, "output".to_string()),
                target: (2, "data".to_string()),
            },
        ],
    };

    let cache: Arc<dyn Cache> = Arc::new(InProcessCache::new());
    Executor::run(&registry, cache.clone(), &template, &empty_config(), Some((1, "output".to_string()))).unwrap();
    assert_eq!(loader_calls.load(Ordering::SeqCst), 1);
    assert_eq!(scaler_calls.load(Ordering::SeqCst), 1);

    let result = Executor::run(&registry, cache, &template, &empty_config(), Some((2, "output".to_string()))).unwrap();
    assert_eq!(result[&(2, "output".to_string())].values, vec![json!(40.0)]);
    // node 0 and node 1 were already cached from the first run.
    assert_eq!(loader_calls.load(Ordering::SeqCst), 1);
    assert_eq!(scaler_calls.load(Ordering::SeqCst), 1);
    assert_eq!(doubler_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn a_wire_cycle_is_rejected_with_the_exact_error() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    registry
        .register_module(counting_module(
            "demo.echo",
            vec![terminal("data", "demo.data", true, false)],
            vec![terminal("output", "demo.data", false, false)],
            vec![],
            calls,
            |_, params| Ok(vec![params["data"].clone()]),
        ))
        .unwrap();

    let template = Template {
        name: "cyclic".to_string(),
        description: String::new(),
        version: "1".to_string(),
        instrument: "demo".to_string(),
        modules: vec![node("demo.echo", empty_config()), node("demo.echo", empty_config())],
        wires: vec![
            Wire {
                source: (0, "output".to_string()),
                target: (1, "data".to_string()),
            },
            Wire {
                source: (1, "output".to_string()),
                target: (0, "data".to_string()),
            },
        ],
    };

    let cache: Arc<dyn Cache> = Arc::new(InProcessCache::new());
    let err = Executor::run(&registry, cache, &template, &empty_config(), None).unwrap_err();
    match err {
        EngineError::Cycle { nodes } => assert_eq!(nodes, vec![0, 1]),
        other => panic!("expected a Cycle error, got {other:?}"),
    }
}

#[test]
fn non_finite_output_values_survive_a_cache_round_trip() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    registry
        .register_module(counting_module(
            "demo.overflow",
            vec![],
            vec![terminal("output", "demo.data", false, false)],
            vec![],
            calls.clone(),
            |_, _| Ok(vec![reduction_core::codec::float_to_value(f64::INFINITY)]),
        ))
        .unwrap();

    let template = Template {
        name: "overflow".to_string(),
        description: String::new(),
        version: "1".to_string(),
        instrument: "demo".to_string(),
        modules: vec![node("demo.overflow", empty_config())],
        wires: vec![],
    };

    let cache: Arc<dyn Cache> = Arc::new(InProcessCache::new());

    // The first run never touches the cache's decode path (the action's
    // own return value is installed directly), and the second is a cache
    // hit read back through `decode_outputs`. Both are the same sentinel
    // `Value` either way -- `value_to_float` reads the float back from
    // it, since `serde_json::Value` has no numeric form infinity could
    // survive being converted into.
    let first = Executor::run(&registry, cache.clone(), &template, &empty_config(), Some((0, "output".to_string()))).unwrap();
    let first_value = &first[&(0, "output".to_string())].values[0];
    assert_eq!(reduction_core::codec::value_to_float(first_value), Some(f64::INFINITY));

    let second = Executor::run(&registry, cache, &template, &empty_config(), Some((0, "output".to_string()))).unwrap();
    let second_value = &second[&(0, "output".to_string())].values[0];
    assert_eq!(reduction_core::codec::value_to_float(second_value), Some(f64::INFINITY));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn find_calculated_reports_exactly_the_cached_nodes() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    registry
        .register_module(counting_module(
            "demo.loader",
            vec![],
            vec![terminal("output", "demo.data", false, false)],
            vec![],
            calls,
            |_, _| Ok(vec![json!(1.0)]),
        ))
        .unwrap();

    let template = Template {
        name: "single".to_string(),
        description: String::new(),
        version: "1".to_string(),
        instrument: "demo".to_string(),
        modules: vec![node("demo.loader", empty_config())],
        wires: vec![],
    };

    let cache: Arc<dyn Cache> = Arc::new(InProcessCache::new());
    let before = Executor::find_calculated(&registry, cache.clone(), &template, &empty_config()).unwrap();
    assert_eq!(before, vec![false]);

    Executor::run(&registry, cache.clone(), &template, &empty_config(), None).unwrap();

    let after = Executor::find_calculated(&registry, cache, &template, &empty_config()).unwrap();
    assert_eq!(after, vec![true]);
}
