// A serde model of a telemetry batch, shaped like OTLP/JSON: resource -> scope -> records.
//
// Only attributes are interpreted.  Everything else on every level (names, timestamps, values, scope
// descriptions, ...) is kept in the `other` map of the level and written back unchanged.  Attribute
// maps are flattened to JSON objects, `{"gpu": "0", "UUID": "GPU-5e1c..."}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// An attribute value.  Integers are kept apart from doubles so that `"gpu": 3` survives a round trip.
/// Shapes the engine has no use for (null, objects, lists of anything but strings) are carried as
/// `Other` and written back as they came.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    List(Vec<String>),
    Other(Value),
}

impl AttrValue {
    /// The value as a lookup key: strings as they are, integers in decimal.  Other values are not
    /// keys.

    pub fn as_key(&self) -> Option<String> {
        match self {
            AttrValue::Str(s) => Some(s.clone()),
            AttrValue::Int(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> AttrValue {
        AttrValue::Str(s.to_string())
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// Anything that carries an attribute map.

pub trait Attributed {
    fn attributes(&self) -> &Attributes;
    fn attributes_mut(&mut self) -> &mut Attributes;
}

macro_rules! attributed {
    ($($t:ident),*) => {
        $(
            #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
            pub struct $t {
                #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
                pub attributes: Attributes,

                #[serde(flatten)]
                pub other: Map<String, Value>,
            }

            impl Attributed for $t {
                fn attributes(&self) -> &Attributes {
                    &self.attributes
                }

                fn attributes_mut(&mut self) -> &mut Attributes {
                    &mut self.attributes
                }
            }
        )*
    };
}

attributed!(
    Resource,
    Span,
    LogRecord,
    NumberDataPoint,
    HistogramDataPoint,
    ExponentialHistogramDataPoint,
    SummaryDataPoint
);

// Traces

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Traces {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpans {
    #[serde(default)]
    pub resource: Resource,

    #[serde(default)]
    pub scope_spans: Vec<ScopeSpans>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSpans {
    #[serde(default)]
    pub spans: Vec<Span>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

// Logs

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Logs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_logs: Vec<ResourceLogs>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLogs {
    #[serde(default)]
    pub resource: Resource,

    #[serde(default)]
    pub scope_logs: Vec<ScopeLogs>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeLogs {
    #[serde(default)]
    pub log_records: Vec<LogRecord>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

// Metrics

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_metrics: Vec<ResourceMetrics>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    #[serde(default)]
    pub resource: Resource,

    #[serde(default)]
    pub scope_metrics: Vec<ScopeMetrics>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeMetrics {
    #[serde(default)]
    pub metrics: Vec<Metric>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// A metric has data points of exactly one of the five kinds; a metric with none is passed through.

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gauge: Option<DataPoints<NumberDataPoint>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<DataPoints<NumberDataPoint>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram: Option<DataPoints<HistogramDataPoint>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exponential_histogram: Option<DataPoints<ExponentialHistogramDataPoint>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<DataPoints<SummaryDataPoint>>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoints<P> {
    #[serde(default = "Vec::new")]
    pub data_points: Vec<P>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

fn visit<P: Attributed>(points: &mut Option<DataPoints<P>>, f: &mut dyn FnMut(&mut dyn Attributed)) {
    if let Some(points) = points {
        for p in points.data_points.iter_mut() {
            f(p);
        }
    }
}

impl Metric {
    /// Apply `f` to every data point of the metric, whatever its kind.

    pub fn for_each_data_point(&mut self, mut f: impl FnMut(&mut dyn Attributed)) {
        visit(&mut self.gauge, &mut f);
        visit(&mut self.sum, &mut f);
        visit(&mut self.histogram, &mut f);
        visit(&mut self.exponential_histogram, &mut f);
        visit(&mut self.summary, &mut f);
    }
}
