//! `${dotted.path}` interpolation over a YAML tree.
//!
//! A string made of a single interpolation takes the referenced node as-is, so
//! `size: ${lit_model.board_size}` stays an integer. Interpolations embedded in
//! longer strings are rendered as text and must point at scalars.

use serde_yaml::{Mapping, Value};

use super::ConfigError;

enum Segment<'a> {
    Text(&'a str),
    Ref(&'a str),
}

fn segments(s: &str) -> Result<Vec<Segment<'_>>, ConfigError> {
    let mut out = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        if start > 0 {
            out.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigError::Unterminated(s.to_string()))?;
        out.push(Segment::Ref(after[..end].trim()));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    Ok(out)
}

/// Looks up `a.b.0.c`; numeric segments index into sequences.
pub fn get_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(root, |node, key| match node {
        Value::Mapping(m) => m.get(key),
        Value::Sequence(seq) => key.parse::<usize>().ok().and_then(|i| seq.get(i)),
        Value::Tagged(t) => match &t.value {
            Value::Mapping(m) => m.get(key),
            _ => None,
        },
        _ => None,
    })
}

struct Resolver<'v> {
    root: &'v Value,
    stack: Vec<String>,
}

impl Resolver<'_> {
    fn node(&mut self, node: &Value) -> Result<Value, ConfigError> {
        match node {
            Value::String(s) => self.string(s),
            Value::Sequence(seq) => seq
                .iter()
                .map(|v| self.node(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Sequence),
            Value::Mapping(m) => {
                let mut out = Mapping::new();
                for (k, v) in m {
                    out.insert(k.clone(), self.node(v)?);
                }
                Ok(Value::Mapping(out))
            }
            Value::Tagged(t) => {
                let mut t = t.as_ref().clone();
                t.value = self.node(&t.value)?;
                Ok(Value::Tagged(Box::new(t)))
            }
            other => Ok(other.clone()),
        }
    }

    fn string(&mut self, s: &str) -> Result<Value, ConfigError> {
        let segs = segments(s)?;
        match segs.as_slice() {
            [Segment::Ref(key)] => self.lookup(key),
            segs if segs.iter().all(|seg| matches!(seg, Segment::Text(_))) => {
                Ok(Value::String(s.to_string()))
            }
            segs => {
                let mut out = String::new();
                for seg in segs {
                    match seg {
                        Segment::Text(t) => out.push_str(t),
                        Segment::Ref(key) => match self.lookup(key)? {
                            Value::String(v) => out.push_str(&v),
                            Value::Number(n) => out.push_str(&n.to_string()),
                            Value::Bool(b) => out.push_str(&b.to_string()),
                            Value::Null => out.push_str("null"),
                            _ => {
                                return Err(ConfigError::NonScalarEmbed {
                                    key: key.to_string(),
                                    text: s.to_string(),
                                })
                            }
                        },
                    }
                }
                Ok(Value::String(out))
            }
        }
    }

    fn lookup(&mut self, key: &str) -> Result<Value, ConfigError> {
        if self.stack.iter().any(|k| k == key) {
            return Err(ConfigError::Cycle {
                key: key.to_string(),
            });
        }
        let target = get_path(self.root, key).ok_or_else(|| ConfigError::MissingKey {
            key: key.to_string(),
        })?;
        self.stack.push(key.to_string());
        let resolved = self.node(target);
        self.stack.pop();
        resolved
    }
}

/// Returns a copy of `root` with every interpolation replaced.
pub fn resolve(root: &Value) -> Result<Value, ConfigError> {
    Resolver {
        root,
        stack: Vec::new(),
    }
    .node(root)
}
