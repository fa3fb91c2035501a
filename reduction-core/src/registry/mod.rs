//! Process-wide registry (C1).
//!
//! Three concurrent maps — modules, datatypes, instruments — each keyed by
//! id. Lookups never contend with registration: a `DashMap` shards its
//! buckets instead of taking one process-wide lock, so the hot read path
//! (executor / RPC dispatch) never blocks behind a startup-time
//! registration burst.

pub mod types;

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
pub use types::{
    ActionContext, Bundle, DataType, Field, FieldDatatype, Instrument, JsonValue, Module,
    ParamMap, RangeAxis, Template, TemplateModule, Terminal, TypeAttr, Wire,
};

/// Owns the three process-wide tables. Passed explicitly rather than
/// reached for through a global, since initialization order across
/// compilation units can't be relied on; `default_registry()` below is
/// the package-level convenience accessor for callers that have no
/// natural place to thread one through.
#[derive(Default)]
pub struct Registry {
    modules: DashMap<String, Arc<Module>>,
    datatypes: DashMap<String, Arc<DataType>>,
    instruments: DashMap<String, Arc<Instrument>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a module whose id already exists succeeds silently when
    /// the new definition equals the existing one. When they differ, the
    /// We log a warning and keep the original rather than erroring or
    /// overwriting.
    pub fn register_module(&self, module: Module) -> EngineResult<()> {
        let id = module.id.clone();
        match self.modules.get(&id) {
            Some(existing) if existing.as_ref() == &module => Ok(()),
            Some(_) => {
                warn!(
                    module_id = %id,
                    "module re-registered with a differing definition; keeping the original"
                );
                Ok(())
            }
            None => {
                self.modules.insert(id, Arc::new(module));
                Ok(())
            }
        }
    }

    pub fn lookup_module(&self, id: &str) -> EngineResult<Arc<Module>> {
        self.modules
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::ModuleNotFound { id: id.to_string() })
    }

    /// Registering a datatype under an existing, non-equal id fails —
    /// unlike modules, there is no silent-ignore path.
    pub fn register_datatype(&self, datatype: DataType) -> EngineResult<()> {
        let id = datatype.id.clone();
        match self.datatypes.get(&id) {
            Some(existing) if existing.as_ref() == &datatype => Ok(()),
            Some(_) => Err(EngineError::RegistryConflict { id }),
            None => {
                self.datatypes.insert(id, Arc::new(datatype));
                Ok(())
            }
        }
    }

    pub fn lookup_datatype(&self, id: &str) -> EngineResult<Arc<DataType>> {
        self.datatypes
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::DataTypeNotFound { id: id.to_string() })
    }

    /// Registering an instrument implicitly registers all of its modules
    /// and datatypes, then validates the instrument's own invariants
    /// (datatypes used == datatypes declared, unique module names) before
    /// it becomes visible to lookups.
    pub fn register_instrument(
        &self,
        instrument: Instrument,
        modules: Vec<Module>,
        datatypes: Vec<DataType>,
    ) -> EngineResult<()> {
        for datatype in datatypes {
            self.register_datatype(datatype)?;
        }
        for module in &modules {
            self.register_module(module.clone())?;
        }

        let resolved: Vec<Arc<Module>> = modules
            .iter()
            .map(|m| self.lookup_module(&m.id))
            .collect::<EngineResult<_>>()?;
        instrument.check(&resolved)?;

        self.instruments
            .insert(instrument.id.clone(), Arc::new(instrument));
        Ok(())
    }

    pub fn lookup_instrument(&self, id: &str) -> EngineResult<Arc<Instrument>> {
        self.instruments
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::InstrumentNotFound { id: id.to_string() })
    }

    pub fn list_instruments(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instruments.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

static DEFAULT_REGISTRY: once_cell::sync::Lazy<Registry> = once_cell::sync::Lazy::new(Registry::new);

/// Package-level convenience accessor forwarding to a default instance.
/// Prefer an explicit `&Registry` in new code; this exists for callers
/// (e.g. module-registration macros) that have no natural place to
/// thread one through.
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn sample_module(id: &str, version: &str) -> Module {
        Module {
            id: id.to_string(),
            version: version.to_string(),
            name: "Sample".to_string(),
            description: "a sample module".to_string(),
            inputs: vec![],
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
            action: StdArc::new(|_, _| Ok(vec![serde_json::Value::Null])),
        }
    }

    #[test]
    fn register_and_lookup_module() {
        let registry = Registry::new();
        registry.register_module(sample_module("demo.loader", "1")).unwrap();
        let found = registry.lookup_module("demo.loader").unwrap();
        assert_eq!(found.version, "1");
    }

    #[test]
    fn lookup_missing_module_fails() {
        let registry = Registry::new();
        let err = registry.lookup_module("nope").unwrap_err();
        assert!(matches!(err, EngineError::ModuleNotFound { .. }));
    }

    #[test]
    fn reregister_same_definition_is_noop() {
        let registry = Registry::new();
        registry.register_module(sample_module("demo.loader", "1")).unwrap();
        registry.register_module(sample_module("demo.loader", "1")).unwrap();
        assert_eq!(registry.lookup_module("demo.loader").unwrap().version, "1");
    }

    #[test]
    fn reregister_differing_definition_silently_keeps_first() {
        let registry = Registry::new();
        registry.register_module(sample_module("demo.loader", "1")).unwrap();
        registry.register_module(sample_module("demo.loader", "2")).unwrap();
        // Keep the first registration, do not error.
        assert_eq!(registry.lookup_module("demo.loader").unwrap().version, "1");
    }

    #[test]
    fn datatype_conflict_fails() {
        let registry = Registry::new();
        registry
            .register_datatype(DataType::json("demo.data", "1"))
            .unwrap();
        let err = registry
            .register_datatype(DataType::json("demo.data", "2"))
            .unwrap_err();
        assert!(matches!(err, EngineError::RegistryConflict { .. }));
    }

    #[test]
    fn instrument_registration_checks_datatype_usage() {
        let registry = Registry::new();
        let instrument = Instrument {
            id: "demo".to_string(),
            name: "Demo".to_string(),
            menu: vec![],
            datatypes: vec!["demo.unused".to_string()],
            templates: vec![],
        };
        let err = registry
            .register_instrument(instrument, vec![sample_module("demo.loader", "1")], vec![])
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn instrument_registration_succeeds_when_datatypes_match() {
        let registry = Registry::new();
        let instrument = Instrument {
            id: "demo".to_string(),
            name: "Demo".to_string(),
            menu: vec![("loaders".to_string(), vec!["demo.loader".to_string()])],
            datatypes: vec!["demo.data".to_string()],
            templates: vec![],
        };
        registry
            .register_instrument(instrument, vec![sample_module("demo.loader", "1")], vec![])
            .unwrap();
        assert_eq!(registry.list_instruments(), vec!["demo".to_string()]);
    }
}
