//! Chart values for the virtual cluster release

use serde_json::{Map, Value};

use crate::crd::HelmRelease;
use crate::Error;

/// Where the user's values come from
#[derive(Clone, Debug, PartialEq)]
pub enum ValueSource<'a> {
    /// Nothing set
    Empty,
    /// Raw YAML document from `values`
    Raw(&'a str),
    /// Structured `valuesObject`
    Object(&'a Value),
}

impl<'a> ValueSource<'a> {
    /// Pick the value source of a release; setting both fields is an error
    pub fn from_release(release: Option<&'a HelmRelease>) -> Result<Self, Error> {
        let Some(release) = release else {
            return Ok(Self::Empty);
        };
        match (release.values.is_empty(), release.values_object.as_ref()) {
            (false, Some(_)) => Err(Error::validation(
                "values and valuesObject are mutually exclusive, set only one",
            )),
            (false, None) => Ok(Self::Raw(&release.values)),
            (true, Some(obj)) => Ok(Self::Object(obj)),
            (true, None) => Ok(Self::Empty),
        }
    }

    fn to_value(&self) -> Result<Value, Error> {
        match self {
            Self::Empty => Ok(Value::Object(Map::new())),
            Self::Raw(raw) => {
                let parsed: Value = serde_yaml::from_str(raw)?;
                Ok(if parsed.is_null() {
                    Value::Object(Map::new())
                } else {
                    parsed
                })
            }
            Self::Object(obj) => Ok((*obj).clone()),
        }
    }
}

/// Recursively merge `overlay` onto `base`.
///
/// Maps merge key by key; any other overlay value replaces the base value.
pub fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing @ Value::Object(_)) if value.is_object() => {
                        merge_values(existing, value)
                    }
                    _ => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Render the values document passed to helm.
///
/// Without defaults a raw document is passed through untouched. With defaults
/// the user values are merged on top of them.
pub fn render_values(source: &ValueSource<'_>, defaults: Option<Value>) -> Result<String, Error> {
    match (source, defaults) {
        (ValueSource::Empty, None) => Ok(String::new()),
        (ValueSource::Raw(raw), None) => Ok((*raw).to_string()),
        (ValueSource::Object(obj), None) => Ok(serde_yaml::to_string(obj)?),
        (source, Some(defaults)) => {
            let merged = merge_values(defaults, source.to_value()?);
            Ok(serde_yaml::to_string(&merged)?)
        }
    }
}

/// Values for a release, with the host service CIDR underneath when known
pub fn resolve_values(
    release: Option<&HelmRelease>,
    service_cidr: Option<&str>,
) -> Result<String, Error> {
    let source = ValueSource::from_release(release)?;
    let defaults = service_cidr.map(|cidr| serde_json::json!({ "serviceCIDR": cidr }));
    render_values(&source, defaults)
}
