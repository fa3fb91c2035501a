//! Core data model: DataType, Terminal, Field, Module, Wire,
//! Template, Instrument, Bundle.
//!
//! Config and field values are represented as `serde_json::Value` rather
//! than a hand-rolled algebraic type: every value that crosses a module
//! boundary is, by §6, "any JSON-compatible term", and expressing it that
//! way lets the fingerprinter's ordered-normalization pass (C5) and the
//! bundle codec (C7) operate on one shape instead of two.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};

/// A pluggable domain value flowing on a wire. Implementors only need to
/// know how to turn themselves into a JSON term; the engine never inspects
/// their internals.
pub trait DomainValue: fmt::Debug + Send + Sync {
    fn serialize(&self) -> Value;
}

/// The simplest possible `DomainValue`: a JSON term that serializes to
/// itself. Most instrument-specific datatypes in practice are thin wrappers
/// over a JSON-shaped struct, so this covers them without per-datatype
/// boilerplate; datatypes needing richer behavior implement `DomainValue`
/// directly and register a `DataType` around their own `new`/`load`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonValue(pub Value);

impl DomainValue for JsonValue {
    fn serialize(&self) -> Value {
        self.0.clone()
    }
}

type NewFn = dyn Fn() -> Box<dyn DomainValue> + Send + Sync;
type LoadFn = dyn Fn(Value) -> EngineResult<Box<dyn DomainValue>> + Send + Sync;

/// `{ id, cls }`: identifies an edge's payload type. `cls` is
/// realized as a pair of factory functions rather than a class reference.
#[derive(Clone)]
pub struct DataType {
    pub id: String,
    /// Identity/version token used for equality (closures aren't
    /// comparable, so re-registration conflicts are judged on this).
    pub version: String,
    pub new_value: Arc<NewFn>,
    pub load_value: Arc<LoadFn>,
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataType")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish()
    }
}

impl PartialEq for DataType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.version == other.version
    }
}

impl DataType {
    /// A datatype backed by plain JSON terms: `new()` is an empty value,
    /// `load(state)` hydrates from whatever JSON the producer serialized.
    pub fn json(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            new_value: Arc::new(|| Box::new(JsonValue(Value::Null))),
            load_value: Arc::new(|state| Ok(Box::new(JsonValue(state)))),
        }
    }
}

/// A typed port on a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminal {
    pub id: String,
    pub datatype: String,
    pub required: bool,
    pub multiple: bool,
    pub label: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeAxis {
    X,
    Y,
    Xy,
}

/// Datatype-specific constraint grammar parsed from a docstring `typeattr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeAttr {
    None,
    Bool {
        label: String,
    },
    Int {
        min: i64,
        max: i64,
    },
    Float {
        units: String,
        min: f64,
        max: f64,
    },
    /// `(label, value)` pairs; `open` marks a trailing `...` entry.
    Opt {
        choices: Vec<(String, String)>,
        open: bool,
    },
    Regex {
        pattern: String,
    },
    Range {
        axis: RangeAxis,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldDatatype {
    Str,
    Bool,
    Int,
    Float,
    Opt,
    Regex,
    Range,
    Index,
    Coordinate,
    FileInfo,
}

/// A typed scalar/vector configuration parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: String,
    pub datatype: FieldDatatype,
    pub typeattr: TypeAttr,
    pub default: Option<Value>,
    pub required: bool,
    pub multiple: bool,
    /// 0 = vector of any length; n >= 1 = fixed length; 1 = scalar.
    pub length: usize,
    pub label: String,
}

/// The per-request keyword map an action is invoked with: field and input
/// terminal ids to values (or, for `multiple` ports, lists of values).
pub type ParamMap = Map<String, Value>;

pub struct ActionContext;

type ActionFn = dyn Fn(&ActionContext, &ParamMap) -> EngineResult<Vec<Value>> + Send + Sync;

/// A registered operation. `action_id` is a descriptive,
/// fully-qualified symbol path kept for diagnostics and fingerprint
/// provenance — unlike the pickled-Python original, Rust modules never
/// cross a process boundary and so never need `action` rebound from it
/// (see SPEC_FULL.md §9, "New" design note on `action_id`).
#[derive(Clone)]
pub struct Module {
    pub id: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub inputs: Vec<Terminal>,
    pub outputs: Vec<Terminal>,
    pub fields: Vec<Field>,
    pub action_id: String,
    pub action: Arc<ActionFn>,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("fields", &self.fields)
            .field("action_id", &self.action_id)
            .finish()
    }
}

impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.version == other.version
            && self.name == other.name
            && self.description == other.description
            && self.inputs == other.inputs
            && self.outputs == other.outputs
            && self.fields == other.fields
            && self.action_id == other.action_id
    }
}

impl Module {
    pub fn get_terminal_by_id(&self, id: &str) -> Option<&Terminal> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|t| t.id == id)
    }

    pub fn get_field_by_id(&self, id: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn get_output(&self, id: &str) -> Option<&Terminal> {
        self.outputs.iter().find(|t| t.id == id)
    }

    pub fn get_input(&self, id: &str) -> Option<&Terminal> {
        self.inputs.iter().find(|t| t.id == id)
    }
}

/// `{ source: (node, terminal), target: (node, terminal) }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wire {
    pub source: (usize, String),
    pub target: (usize, String),
}

/// A node in a Template: which module, and its per-instance default config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateModule {
    pub module: String,
    pub version: String,
    pub config: ParamMap,
}

/// A declarative acyclic graph of Modules connected by Wires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub description: String,
    pub version: String,
    pub instrument: String,
    pub modules: Vec<TemplateModule>,
    pub wires: Vec<Wire>,
}

impl Template {
    /// (from, to) node-index pairs implied by this template's wires, for
    /// the dependency resolver (C4).
    pub fn edge_pairs(&self) -> Vec<(usize, usize)> {
        self.wires
            .iter()
            .map(|w| (w.source.0, w.target.0))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.modules.len()
    }

    /// Wires feeding a given node, in declaration order (the order that is
    /// part of the node's fingerprint).
    pub fn wires_into(&self, node: usize) -> impl Iterator<Item = &Wire> {
        self.wires.iter().filter(move |w| w.target.0 == node)
    }
}

/// A named, versioned bundle of Modules, DataTypes, and Templates.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub id: String,
    pub name: String,
    /// (menu group label, module ids in that group)
    pub menu: Vec<(String, Vec<String>)>,
    pub datatypes: Vec<String>,
    pub templates: Vec<Template>,
}

impl Instrument {
    /// Validates the construction invariants: every datatype
    /// referenced by a module terminal is declared, every declared
    /// datatype is referenced, and module display names are unique.
    pub fn check(&self, modules: &[Arc<Module>]) -> EngineResult<()> {
        use std::collections::HashSet;

        let declared: HashSet<&str> = self.datatypes.iter().map(String::as_str).collect();
        let mut used: HashSet<&str> = HashSet::new();
        let mut names: HashSet<&str> = HashSet::new();

        for module in modules {
            if !names.insert(module.name.as_str()) {
                return Err(EngineError::Validation {
                    message: format!(
                        "instrument '{}': duplicate module display name '{}'",
                        self.id, module.name
                    ),
                });
            }
            for terminal in module.inputs.iter().chain(module.outputs.iter()) {
                used.insert(terminal.datatype.as_str());
                if !declared.contains(terminal.datatype.as_str()) {
                    return Err(EngineError::Validation {
                        message: format!(
                            "instrument '{}': datatype '{}' used by module '{}' is not declared",
                            self.id, terminal.datatype, module.id
                        ),
                    });
                }
            }
        }

        for datatype in &declared {
            if !used.contains(datatype) {
                return Err(EngineError::Validation {
                    message: format!(
                        "instrument '{}': datatype '{}' is declared but never used",
                        self.id, datatype
                    ),
                });
            }
        }

        Ok(())
    }
}

/// `{ datatype, values }` — all edges carry bundles, even length-1 ones.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub datatype: String,
    pub values: Vec<Value>,
}

impl Bundle {
    pub fn new(datatype: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            datatype: datatype.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
