//! Field paths over untyped objects: `spec.replicas`, `spec.containers[0].image`,
//! `metadata.labels['app.kubernetes.io/name']`. A leading `$` / `.` is accepted.

use smallvec::SmallVec;

use crate::{Error, ResourceObject, Result};

/// Canonical form of "path matched nothing". Cannot collide with JSON text.
pub const ABSENT: &str = "<absent>";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathStep {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    steps: SmallVec<[PathStep; 4]>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let err = |reason| Error::InvalidFieldPath { path: raw.to_string(), reason };
        let mut s = raw.trim();
        s = s.strip_prefix('$').unwrap_or(s);
        s = s.strip_prefix('.').unwrap_or(s);
        if s.is_empty() {
            return Err(err("empty path"));
        }

        let bytes = s.as_bytes();
        let mut steps: SmallVec<[PathStep; 4]> = SmallVec::new();
        let mut i = 0usize;
        // true when the next token must be a field name (start, or right after '.')
        let mut expect_field = true;
        while i < bytes.len() {
            match bytes[i] {
                b'.' => {
                    if expect_field {
                        return Err(err("empty segment"));
                    }
                    expect_field = true;
                    i += 1;
                    if i == bytes.len() {
                        return Err(err("trailing '.'"));
                    }
                }
                b'[' => {
                    if expect_field && !steps.is_empty() {
                        return Err(err("empty segment"));
                    }
                    let close = s[i..].find(']').map(|p| p + i).ok_or_else(|| err("unclosed '['"))?;
                    let inner = &s[i + 1..close];
                    let quoted = inner.len() >= 2
                        && ((inner.starts_with('\'') && inner.ends_with('\''))
                            || (inner.starts_with('"') && inner.ends_with('"')));
                    if quoted {
                        steps.push(PathStep::Field(inner[1..inner.len() - 1].to_string()));
                    } else {
                        let idx = inner.parse::<usize>().map_err(|_| err("array index must be a non-negative integer"))?;
                        steps.push(PathStep::Index(idx));
                    }
                    expect_field = false;
                    i = close + 1;
                }
                b']' => return Err(err("unexpected ']'")),
                _ => {
                    if !expect_field {
                        return Err(err("missing '.' between segments"));
                    }
                    let end = s[i..].find(|c| matches!(c, '.' | '[' | ']')).map(|p| p + i).unwrap_or(s.len());
                    steps.push(PathStep::Field(s[i..end].to_string()));
                    expect_field = false;
                    i = end;
                }
            }
        }
        Ok(Self { raw: raw.to_string(), steps })
    }

    pub fn as_str(&self) -> &str { &self.raw }

    pub fn steps(&self) -> &[PathStep] { &self.steps }

    /// First value at this path, if any.
    pub fn eval<'a>(&self, root: &'a ResourceObject) -> Option<&'a ResourceObject> {
        let mut cur = root;
        for step in self.steps.iter() {
            cur = match step {
                PathStep::Field(key) => cur.as_object()?.get(key)?,
                PathStep::Index(i) => cur.as_array()?.get(*i)?,
            };
        }
        Some(cur)
    }

    /// Canonical string of the value at this path, [`ABSENT`] when missing.
    pub fn canonical_at(&self, root: &ResourceObject) -> String {
        canonical_value(self.eval(root))
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Compact JSON text of `value`. Objects serialize with sorted keys, so two
/// values compare equal exactly when their JSON text does: `3`, `3.0` and `"3"`
/// are three different values.
pub fn canonical_value(value: Option<&ResourceObject>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => ABSENT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps(p: &str) -> Vec<PathStep> {
        FieldPath::parse(p).unwrap().steps().to_vec()
    }

    #[test]
    fn parses_dotted_and_indexed_paths() {
        use PathStep::*;
        assert_eq!(steps("spec.replicas"), vec![Field("spec".into()), Field("replicas".into())]);
        assert_eq!(steps("$.spec.replicas"), steps("spec.replicas"));
        assert_eq!(steps(".spec.replicas"), steps("spec.replicas"));
        assert_eq!(
            steps("spec.containers[0].ports[1]"),
            vec![Field("spec".into()), Field("containers".into()), Index(0), Field("ports".into()), Index(1)]
        );
        assert_eq!(
            steps("metadata.labels['app.kubernetes.io/name']"),
            vec![Field("metadata".into()), Field("labels".into()), Field("app.kubernetes.io/name".into())]
        );
        assert_eq!(steps("[2]"), vec![Index(2)]);
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["", "$", "spec..x", "spec.", "spec[x]", "spec[0", "spec]", "a[0]b", "spec.[0]"] {
            assert!(FieldPath::parse(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn evaluates_against_objects() {
        let o = json!({
            "spec": {"replicas": 3, "containers": [{"name": "a"}, {"name": "b"}]},
            "metadata": {"labels": {"app.kubernetes.io/name": "web"}}
        });
        let p = FieldPath::parse("spec.containers[1].name").unwrap();
        assert_eq!(p.eval(&o), Some(&json!("b")));
        assert_eq!(FieldPath::parse("spec.containers[5]").unwrap().eval(&o), None);
        assert_eq!(FieldPath::parse("spec.replicas.x").unwrap().eval(&o), None);
        assert_eq!(
            FieldPath::parse("metadata.labels['app.kubernetes.io/name']").unwrap().canonical_at(&o),
            "\"web\""
        );
    }

    #[test]
    fn canonical_values_are_json_text() {
        assert_eq!(canonical_value(Some(&json!(3))), "3");
        assert_eq!(canonical_value(Some(&json!("3"))), "\"3\"");
        assert_ne!(canonical_value(Some(&json!(3.0))), canonical_value(Some(&json!(3))));
        assert_eq!(canonical_value(Some(&json!({"b": 1, "a": 2}))), r#"{"a":2,"b":1}"#);
        assert_eq!(canonical_value(None), ABSENT);
    }
}
