//! Module introspection (C2).
//!
//! Derives a `Module` definition from two things supplied at registration
//! time: an [`ActionSignature`] (the Rust stand-in for reflecting over a
//! Python function's `inspect.getargspec`) and a structured documentation
//! string following the grammar below.
//!
//! ```text
//! <description paragraph(s)>
//!
//! **Inputs**
//!
//! name (datatype[length]multiplicity:typeattr) : description [default]
//!
//! **Returns**
//!
//! name (datatype[length]multiplicity:typeattr) : description
//!
//! 2024-01-01 Jane Researcher
//! ```

use std::sync::Arc;
use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::registry::{Field, FieldDatatype, Module, RangeAxis, Terminal, TypeAttr};

/// The Rust stand-in for a Python function's argument list: positional
/// parameters with no default become input terminals; keyword parameters
/// (each carrying a default `Value`) become fields. `*args`/`**kwargs`
/// have no Rust equivalent and so are simply not expressible here — the
/// signature/doc consistency check (below) is what would reject them in
/// the original.
#[derive(Debug, Clone)]
pub struct ActionSignature {
    pub positional: Vec<String>,
    pub keyword: Vec<(String, Value)>,
}

type ActionFn = dyn Fn(&crate::registry::ActionContext, &crate::registry::ParamMap) -> EngineResult<Vec<Value>>
    + Send
    + Sync;

/// Parses `doc` against `signature` and produces a fully-typed `Module`,
/// wiring in `action` as the callable and `action_id` as its descriptive
/// symbol path.
pub fn auto_module(
    id: &str,
    action_id: &str,
    signature: &ActionSignature,
    doc: &str,
    action: Arc<ActionFn>,
) -> EngineResult<Module> {
    let parsed = parse_doc(doc)?;

    let mut described: HashSet<&str> = HashSet::new();
    for p in parsed.inputs.iter().chain(parsed.outputs.iter()) {
        if !described.insert(p.name.as_str()) {
            return Err(validation(format!(
                "parameter '{}' described more than once across Inputs/Returns",
                p.name
            )));
        }
    }

    let mut signature_names: HashSet<&str> = HashSet::new();
    for name in &signature.positional {
        signature_names.insert(name.as_str());
    }
    for (name, _) in &signature.keyword {
        signature_names.insert(name.as_str());
    }

    for p in &parsed.inputs {
        if !signature_names.contains(p.name.as_str()) {
            return Err(validation(format!(
                "'{}' is documented under Inputs but not a signature argument",
                p.name
            )));
        }
    }
    for name in &signature.positional {
        if !parsed.inputs.iter().any(|p| &p.name == name) {
            return Err(validation(format!(
                "signature argument '{name}' has no Inputs documentation"
            )));
        }
    }
    for (name, _) in &signature.keyword {
        if !parsed.inputs.iter().any(|p| &p.name == name) {
            return Err(validation(format!(
                "signature keyword argument '{name}' has no Inputs documentation"
            )));
        }
    }

    let mut inputs = Vec::new();
    let mut fields = Vec::new();
    for p in &parsed.inputs {
        let is_field = signature.keyword.iter().any(|(name, _)| name == &p.name);
        if is_field {
            let sig_default = signature
                .keyword
                .iter()
                .find(|(name, _)| name == &p.name)
                .map(|(_, v)| v.clone());
            fields.push(parameter_to_field(p, sig_default)?);
        } else {
            inputs.push(parameter_to_terminal(p)?);
        }
    }

    let outputs = parsed
        .outputs
        .iter()
        .map(parameter_to_terminal)
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(Module {
        id: id.to_string(),
        version: parsed.version,
        name: unsplit_name(id),
        description: parsed.description,
        inputs,
        outputs,
        fields,
        action_id: action_id.to_string(),
        action,
    })
}

fn validation(message: String) -> EngineError {
    EngineError::Validation { message }
}

/// snake_case -> Title Case, per `original_source/dataflow/core.py`'s
/// `_unsplit_name`.
fn unsplit_name(id: &str) -> String {
    let last = id.rsplit('.').next().unwrap_or(id);
    last.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Multiplicity {
    RequiredSingle,
    OptionalSingle,
    OptionalMultiple,
    RequiredMultiple,
}

impl Multiplicity {
    fn required(self) -> bool {
        matches!(self, Multiplicity::RequiredSingle | Multiplicity::RequiredMultiple)
    }

    fn multiple(self) -> bool {
        matches!(self, Multiplicity::OptionalMultiple | Multiplicity::RequiredMultiple)
    }
}

struct ParsedParameter {
    name: String,
    datatype: String,
    length: usize,
    multiplicity: Multiplicity,
    typeattr_raw: Option<String>,
    description: String,
    default: Option<String>,
}

struct ParsedDoc {
    description: String,
    inputs: Vec<ParsedParameter>,
    outputs: Vec<ParsedParameter>,
    version: String,
}

static PARAMETER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?xs)
        ^\s*
        (?P<name>[A-Za-z_][A-Za-z0-9_]*)
        \s*
        (?:\(
            (?P<datatype>[A-Za-z_][A-Za-z0-9_.]*)?
            (?:\[(?P<length>\d*)\])?
            (?P<mult>[?*+])?
            (?:\s*:\s*(?P<typeattr>[^)]*))?
        \))?
        \s*:\s*
        (?P<description>[^\[]*?)
        \s*
        (?:\[(?P<default>[^\]]*)\])?
        \s*$
        ",
    )
    .expect("parameter_re is a static, validated pattern")
});

static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<date>\d{4}-\d{2}-\d{2})\s+(?P<author>.+)$").expect("date_re is static")
});

/// Splits a block of text into paragraphs: runs of non-blank lines joined
/// by spaces, separated by blank lines.
fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(line.trim());
        }
    }
    if !current.is_empty() {
        out.push(current.join(" "));
    }
    out
}

fn parse_parameter(text: &str) -> EngineResult<ParsedParameter> {
    let caps = PARAMETER_RE
        .captures(text)
        .ok_or_else(|| validation(format!("unparseable parameter doc: '{text}'")))?;

    let name = caps["name"].to_string();
    let datatype = caps
        .name("datatype")
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "str".to_string());

    let length = match caps.name("length") {
        None => 1,
        Some(m) if m.as_str().is_empty() => 0,
        Some(m) => m
            .as_str()
            .parse()
            .map_err(|_| validation(format!("parameter '{name}': invalid length")))?,
    };

    let multiplicity = match caps.name("mult").map(|m| m.as_str()) {
        None => Multiplicity::RequiredSingle,
        Some("?") => Multiplicity::OptionalSingle,
        Some("*") => Multiplicity::OptionalMultiple,
        Some("+") => Multiplicity::RequiredMultiple,
        Some(other) => {
            return Err(validation(format!(
                "parameter '{name}': unknown multiplicity marker '{other}'"
            )))
        }
    };

    let typeattr_raw = caps
        .name("typeattr")
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());

    let description = caps["description"].trim().to_string();
    let default = caps.name("default").map(|m| m.as_str().to_string());

    Ok(ParsedParameter {
        name,
        datatype,
        length,
        multiplicity,
        typeattr_raw,
        description,
        default,
    })
}

fn parse_section(text: &str) -> EngineResult<Vec<ParsedParameter>> {
    paragraphs(text).iter().map(|p| parse_parameter(p)).collect()
}

/// State-machine parse of the full docstring grammar.
fn parse_doc(doc: &str) -> EngineResult<ParsedDoc> {
    let mut description_lines: Vec<&str> = Vec::new();
    let mut inputs_lines: Vec<&str> = Vec::new();
    let mut returns_lines: Vec<&str> = Vec::new();
    let mut date_line: Option<&str> = None;

    #[derive(PartialEq)]
    enum State {
        Description,
        Inputs,
        Returns,
        Done,
    }
    let mut state = State::Description;

    for line in doc.lines() {
        let trimmed = line.trim();
        if date_line.is_some() {
            if !trimmed.is_empty() {
                return Err(validation(
                    "text found after the trailing date/author line".to_string(),
                ));
            }
            continue;
        }
        if DATE_RE.is_match(trimmed) {
            date_line = Some(trimmed);
            state = State::Done;
            continue;
        }
        match trimmed {
            "**Inputs**" => {
                state = State::Inputs;
                continue;
            }
            "**Returns**" => {
                state = State::Returns;
                continue;
            }
            _ => {}
        }
        match state {
            State::Description => description_lines.push(line),
            State::Inputs => inputs_lines.push(line),
            State::Returns => returns_lines.push(line),
            State::Done => {
                return Err(validation(
                    "text found after the trailing date/author line".to_string(),
                ))
            }
        }
    }

    let date_line = date_line.ok_or_else(|| {
        validation("doc is missing the trailing 'YYYY-MM-DD author' line".to_string())
    })?;
    let caps = DATE_RE.captures(date_line).expect("matched above");

    let description = paragraphs(&description_lines.join("\n")).join("\n\n");
    let inputs = parse_section(&inputs_lines.join("\n"))?;
    let outputs = parse_section(&returns_lines.join("\n"))?;

    Ok(ParsedDoc {
        description,
        inputs,
        outputs,
        version: caps["date"].to_string(),
    })
}

fn parameter_to_terminal(p: &ParsedParameter) -> EngineResult<Terminal> {
    Ok(Terminal {
        id: p.name.clone(),
        datatype: p.datatype.clone(),
        required: p.multiplicity.required(),
        multiple: p.multiplicity.multiple(),
        label: unsplit_name(&p.name),
        description: p.description.clone(),
    })
}

fn field_datatype(name: &str) -> EngineResult<FieldDatatype> {
    Ok(match name {
        "str" => FieldDatatype::Str,
        "bool" => FieldDatatype::Bool,
        "int" => FieldDatatype::Int,
        "float" => FieldDatatype::Float,
        "opt" => FieldDatatype::Opt,
        "regex" => FieldDatatype::Regex,
        "range" => FieldDatatype::Range,
        "index" => FieldDatatype::Index,
        "coordinate" => FieldDatatype::Coordinate,
        "fileinfo" => FieldDatatype::FileInfo,
        other => {
            return Err(validation(format!("unknown field datatype '{other}'")))
        }
    })
}

fn parse_typeattr(field_name: &str, datatype: FieldDatatype, raw: Option<&str>) -> EngineResult<TypeAttr> {
    match (datatype, raw) {
        (FieldDatatype::Str | FieldDatatype::FileInfo | FieldDatatype::Index | FieldDatatype::Coordinate, None) => {
            Ok(TypeAttr::None)
        }
        (FieldDatatype::Str | FieldDatatype::FileInfo | FieldDatatype::Index | FieldDatatype::Coordinate, Some(_)) => {
            Err(validation(format!(
                "field '{field_name}': this datatype permits no constraints"
            )))
        }
        (FieldDatatype::Bool, raw) => Ok(TypeAttr::Bool {
            label: raw.unwrap_or(field_name).to_string(),
        }),
        (FieldDatatype::Int, raw) => {
            let (min_s, max_s) = split_bounds(raw.unwrap_or(""));
            let min = if min_s.is_empty() {
                -1_000_000_000
            } else {
                min_s
                    .parse::<i64>()
                    .map_err(|_| validation(format!("field '{field_name}': int bound '{min_s}' not integral")))?
            };
            let max = if max_s.is_empty() {
                1_000_000_000
            } else {
                max_s
                    .parse::<i64>()
                    .map_err(|_| validation(format!("field '{field_name}': int bound '{max_s}' not integral")))?
            };
            if min >= max {
                return Err(validation(format!(
                    "field '{field_name}': int bounds must satisfy min < max"
                )));
            }
            Ok(TypeAttr::Int { min, max })
        }
        (FieldDatatype::Float, raw) => {
            let raw = raw.unwrap_or("");
            let (units, bounds) = match raw.find('<') {
                Some(idx) => (&raw[..idx], &raw[idx..]),
                None => (raw, ""),
            };
            let bounds = bounds.trim_start_matches('<').trim_end_matches('>');
            let (min_s, max_s) = split_bounds(bounds);
            let min = if min_s.is_empty() || min_s == "-inf" {
                -1e300
            } else {
                min_s
                    .parse::<f64>()
                    .map_err(|_| validation(format!("field '{field_name}': float bound '{min_s}' invalid")))?
            };
            let max = if max_s.is_empty() || max_s == "inf" {
                1e300
            } else {
                max_s
                    .parse::<f64>()
                    .map_err(|_| validation(format!("field '{field_name}': float bound '{max_s}' invalid")))?
            };
            Ok(TypeAttr::Float {
                units: units.to_string(),
                min,
                max,
            })
        }
        (FieldDatatype::Opt, raw) => {
            let raw = raw.ok_or_else(|| validation(format!("field '{field_name}': opt requires a choice list")))?;
            let mut choices = Vec::new();
            let mut open = false;
            for entry in raw.split('|') {
                let entry = entry.trim();
                if entry == "..." {
                    open = true;
                    continue;
                }
                if entry.is_empty() {
                    continue;
                }
                match entry.split_once('=') {
                    Some((label, value)) => choices.push((label.trim().to_string(), value.trim().to_string())),
                    None => choices.push((entry.to_string(), entry.to_string())),
                }
            }
            Ok(TypeAttr::Opt { choices, open })
        }
        (FieldDatatype::Regex, raw) => {
            let pattern = raw.unwrap_or("").to_string();
            if pattern.is_empty() {
                return Err(validation(format!("field '{field_name}': empty regex pattern")));
            }
            Regex::new(&pattern)
                .map_err(|e| validation(format!("field '{field_name}': invalid regex: {e}")))?;
            Ok(TypeAttr::Regex { pattern })
        }
        (FieldDatatype::Range, raw) => {
            let axis = match raw.unwrap_or("") {
                "x" => RangeAxis::X,
                "y" => RangeAxis::Y,
                "xy" => RangeAxis::Xy,
                other => {
                    return Err(validation(format!(
                        "field '{field_name}': range axis must be x, y, or xy (got '{other}')"
                    )))
                }
            };
            Ok(TypeAttr::Range { axis })
        }
    }
}

fn split_bounds(raw: &str) -> (&str, &str) {
    match raw.split_once(',') {
        Some((a, b)) => (a.trim(), b.trim()),
        None => ("", ""),
    }
}

fn parameter_to_field(p: &ParsedParameter, sig_default: Option<Value>) -> EngineResult<Field> {
    let datatype = field_datatype(&p.datatype)?;
    let typeattr = parse_typeattr(&p.name, datatype, p.typeattr_raw.as_deref())?;

    let default = match &p.default {
        Some(text) => Some(parse_default_literal(text)),
        None => sig_default,
    };

    Ok(Field {
        id: p.name.clone(),
        datatype,
        typeattr,
        default,
        required: p.multiplicity.required(),
        multiple: p.multiplicity.multiple(),
        length: p.length,
        label: unsplit_name(&p.name),
    })
}

fn parse_default_literal(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader_signature() -> ActionSignature {
        ActionSignature {
            positional: vec![],
            keyword: vec![],
        }
    }

    #[test]
    fn unsplit_name_converts_snake_case() {
        assert_eq!(unsplit_name("demo.scale_by_factor"), "Scale By Factor");
    }

    #[test]
    fn parses_minimal_loader_doc() {
        let doc = "\
Loads raw data from disk.

**Inputs**

**Returns**

output (demo.data) : the loaded dataset

2024-01-01 Jane Researcher";

        let module = auto_module(
            "demo.loader",
            "demo::loader",
            &loader_signature(),
            doc,
            Arc::new(|_, _| Ok(vec![Value::Null])),
        )
        .unwrap();

        assert_eq!(module.version, "2024-01-01");
        assert_eq!(module.outputs.len(), 1);
        assert_eq!(module.outputs[0].datatype, "demo.data");
        assert!(module.inputs.is_empty());
        assert!(module.fields.is_empty());
    }

    #[test]
    fn parses_scaler_with_field_and_input() {
        let doc = "\
Scales a dataset by a constant factor.

**Inputs**

data (demo.data) : the dataset to scale

factor (float:<0,>) : the scale factor [1.0]

**Returns**

output (demo.data) : the scaled dataset

2024-02-02 Jane Researcher";

        let signature = ActionSignature {
            positional: vec!["data".to_string()],
            keyword: vec![("factor".to_string(), Value::from(1.0))],
        };

        let module = auto_module(
            "demo.scaler",
            "demo::scaler",
            &signature,
            doc,
            Arc::new(|_, _| Ok(vec![Value::Null])),
        )
        .unwrap();

        assert_eq!(module.inputs.len(), 1);
        assert_eq!(module.inputs[0].id, "data");
        assert_eq!(module.fields.len(), 1);
        assert_eq!(module.fields[0].id, "factor");
        assert!(matches!(module.fields[0].typeattr, TypeAttr::Float { .. }));
    }

    #[test]
    fn rejects_signature_doc_mismatch() {
        let doc = "\
Does something.

**Inputs**

data (demo.data) : the dataset

**Returns**

output (demo.data) : the output

2024-03-03 Jane Researcher";

        let signature = ActionSignature {
            positional: vec!["data".to_string(), "extra".to_string()],
            keyword: vec![],
        };

        let err = auto_module(
            "demo.broken",
            "demo::broken",
            &signature,
            doc,
            Arc::new(|_, _| Ok(vec![Value::Null])),
        )
        .unwrap_err();

        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn rejects_text_after_date_line() {
        let doc = "\
Does something.

**Inputs**

**Returns**

output (demo.data) : the output

2024-03-03 Jane Researcher
trailing garbage";

        let err = auto_module(
            "demo.broken2",
            "demo::broken2",
            &loader_signature(),
            doc,
            Arc::new(|_, _| Ok(vec![Value::Null])),
        )
        .unwrap_err();

        assert!(matches!(err, EngineError::Validation { .. }));
    }
}
