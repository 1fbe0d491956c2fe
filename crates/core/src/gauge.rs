use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use prometheus::{
    core::{Collector, Desc},
    proto::MetricFamily,
    GaugeVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Values of one gauge family keyed by label values, in the family's label order.
pub type GaugeValues = BTreeMap<Vec<String>, f64>;

/// Static description of a gauge family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GaugeDescriptor {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
}

impl GaugeDescriptor {
    fn opts(&self) -> Opts {
        Opts::new(self.name, self.help)
    }
}

/// A gauge family whose entire value set is swapped on every update.
///
/// Each `replace` builds a fresh `GaugeVec` and swaps it in under the write
/// lock, so a gather sees either the old set or the new one.
pub struct GaugeFamily {
    descriptor: GaugeDescriptor,
    desc: Desc,
    published: RwLock<Published>,
}

struct Published {
    values: GaugeValues,
    vec: GaugeVec,
}

impl GaugeFamily {
    fn new(descriptor: GaugeDescriptor) -> Result<Self, RegistryError> {
        let desc = Desc::new(
            descriptor.name.to_string(),
            descriptor.help.to_string(),
            descriptor.labels.iter().map(|label| label.to_string()).collect(),
            HashMap::new(),
        )?;
        let vec = GaugeVec::new(descriptor.opts(), descriptor.labels)?;
        Ok(Self {
            descriptor,
            desc,
            published: RwLock::new(Published {
                values: GaugeValues::new(),
                vec,
            }),
        })
    }

    pub fn descriptor(&self) -> &GaugeDescriptor {
        &self.descriptor
    }

    /// Replaces every series of the family at once.
    ///
    /// The previous set is left untouched when any entry has the wrong number of
    /// label values.
    pub fn replace(&self, values: GaugeValues) -> Result<(), RegistryError> {
        let expected = self.descriptor.labels.len();
        if let Some(key) = values.keys().find(|key| key.len() != expected) {
            return Err(RegistryError::LabelArity {
                name: self.descriptor.name,
                expected,
                actual: key.len(),
            });
        }

        let vec = GaugeVec::new(self.descriptor.opts(), self.descriptor.labels)?;
        for (labels, value) in &values {
            let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
            vec.get_metric_with_label_values(&labels)?.set(*value);
        }

        *self.published.write().unwrap_or_else(PoisonError::into_inner) =
            Published { values, vec };
        Ok(())
    }

    pub fn snapshot(&self) -> GaugeValues {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values
            .clone()
    }
}

impl fmt::Debug for GaugeFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaugeFamily")
            .field("descriptor", &self.descriptor)
            .field("values", &self.snapshot())
            .finish()
    }
}

/// Registry handle for one family; the family itself stays shared with the caller.
struct Registered(Arc<GaugeFamily>);

impl Collector for Registered {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.0.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.0
            .published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .vec
            .collect()
    }
}

/// Set of gauge families registered at startup.
#[derive(Default)]
pub struct GaugeRegistry {
    registry: Registry,
}

impl GaugeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new family; names must be unique within the registry.
    pub fn register(&self, descriptor: GaugeDescriptor) -> Result<Arc<GaugeFamily>, RegistryError> {
        let family = Arc::new(GaugeFamily::new(descriptor)?);
        self.registry
            .register(Box::new(Registered(family.clone())))
            .map_err(|err| match err {
                prometheus::Error::AlreadyReg => RegistryError::Duplicate(descriptor.name),
                other => RegistryError::Prometheus(other),
            })?;
        Ok(family)
    }

    /// Encodes every non-empty family in the Prometheus text format.
    pub fn render(&self) -> Result<String, RegistryError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("gauge {0} is already registered")]
    Duplicate(&'static str),
    #[error("gauge {name} expects {expected} label values, got {actual}")]
    LabelArity {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const USAGE: GaugeDescriptor = GaugeDescriptor {
        name: "test_usage",
        help: "Usage by category.",
        labels: &["category", "usage_unit"],
    };

    fn values(entries: &[(&[&str], f64)]) -> GaugeValues {
        entries
            .iter()
            .map(|(labels, value)| (labels.iter().map(|l| l.to_string()).collect(), *value))
            .collect()
    }

    #[test]
    fn rejects_duplicate_registration() {
        let registry = GaugeRegistry::new();
        registry.register(USAGE).expect("first registration");
        let err = registry.register(USAGE).expect_err("duplicate should fail");
        assert!(matches!(err, RegistryError::Duplicate("test_usage")));
    }

    #[test]
    fn replace_drops_series_missing_from_new_set() {
        let registry = GaugeRegistry::new();
        let family = registry.register(USAGE).expect("register");

        family
            .replace(values(&[(&["calls", "minutes"], 3.0), (&["sms", "messages"], 1.0)]))
            .expect("replace");
        family
            .replace(values(&[(&["sms", "messages"], 4.0)]))
            .expect("replace");

        let snapshot = family.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.get(&vec!["sms".to_string(), "messages".to_string()]),
            Some(&4.0)
        );

        let body = registry.render().expect("render");
        assert!(body.contains("test_usage{category=\"sms\",usage_unit=\"messages\"} 4"));
        assert!(!body.contains("category=\"calls\""));
    }

    #[test]
    fn arity_mismatch_keeps_previous_values() {
        let registry = GaugeRegistry::new();
        let family = registry.register(USAGE).expect("register");
        family
            .replace(values(&[(&["calls", "minutes"], 3.0)]))
            .expect("replace");

        let err = family
            .replace(values(&[(&["calls"], 9.0)]))
            .expect_err("wrong arity");
        assert!(matches!(err, RegistryError::LabelArity { expected: 2, actual: 1, .. }));
        assert_eq!(family.snapshot().len(), 1);
        assert!(registry
            .render()
            .expect("render")
            .contains("test_usage{category=\"calls\",usage_unit=\"minutes\"} 3"));
    }

    #[test]
    fn renders_help_type_and_escaped_labels() {
        let registry = GaugeRegistry::new();
        let family = registry.register(USAGE).expect("register");
        family
            .replace(values(&[(&["say \"hi\"", "a\\b"], 1.5)]))
            .expect("replace");

        let body = registry.render().expect("render");
        assert!(body.contains("# HELP test_usage Usage by category."));
        assert!(body.contains("# TYPE test_usage gauge"));
        assert!(body.contains("test_usage{category=\"say \\\"hi\\\"\",usage_unit=\"a\\\\b\"} 1.5"));
    }

    #[test]
    fn empty_family_is_not_rendered() {
        let registry = GaugeRegistry::new();
        let family = registry.register(USAGE).expect("register");
        family
            .replace(values(&[(&["sms", "messages"], 1.0)]))
            .expect("replace");
        family.replace(GaugeValues::new()).expect("replace");

        assert!(!registry.render().expect("render").contains("test_usage"));
    }
}
