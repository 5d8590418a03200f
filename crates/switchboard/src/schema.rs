//! Schema document generation and the transforms applied before use.
//!
//! Documents are plain `serde_json::Value` trees. Typed handlers generate
//! theirs from a [`schemars::JsonSchema`] impl with every subschema inlined,
//! so emitted documents are fully self-contained; dynamic handlers bring
//! their own. Either way the same pipeline runs before a document is
//! compiled for validation: catalog transforms, optional strict mode, and
//! identifier stripping.

use std::sync::{Arc, OnceLock};

use schemars::{JsonSchema, generate::SchemaSettings};
use serde_json::Value;

use crate::error::{Error, Result};

type Transform = Arc<dyn Fn(&mut Value) + Send + Sync>;

static PROCESS_DEFAULT: OnceLock<SchemaCatalog> = OnceLock::new();

/// Ordered set of document rewrites applied right after generation.
///
/// A catalog customizes how types map to schema documents without touching
/// the types themselves, for example forcing a format annotation onto a
/// field the deriving crate does not know about. Transforms run in
/// registration order, before strict mode and identifier stripping.
///
/// Catalogs are injected per builder via
/// [`HandlerBuilder::catalog`](crate::builder::HandlerBuilder::catalog); a
/// process-wide default can be installed once, before concurrent use, with
/// [`SchemaCatalog::install_default`].
#[derive(Clone, Default)]
pub struct SchemaCatalog {
    transforms: Vec<Transform>,
}

impl SchemaCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transform, keeping registration order.
    #[must_use]
    pub fn with(mut self, transform: impl Fn(&mut Value) + Send + Sync + 'static) -> Self {
        self.transforms.push(Arc::new(transform));
        self
    }

    /// Runs every transform against the document, in order.
    pub fn apply(&self, document: &mut Value) {
        for transform in &self.transforms {
            transform(document);
        }
    }

    /// Installs this catalog as the process-wide default.
    ///
    /// The first installation wins and freezes the default; call this during
    /// startup, before handlers are built concurrently. Returns `false` when
    /// a default was already installed.
    pub fn install_default(self) -> bool {
        PROCESS_DEFAULT.set(self).is_ok()
    }

    /// Snapshot of the process-wide default catalog; empty if none was
    /// installed.
    #[must_use]
    pub fn process_default() -> Self {
        PROCESS_DEFAULT.get().cloned().unwrap_or_default()
    }
}

impl std::fmt::Debug for SchemaCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCatalog")
            .field("transforms", &self.transforms.len())
            .finish()
    }
}

/// Generates the schema document for `T` and runs the standard pipeline.
pub(crate) fn generate<T: JsonSchema>(catalog: &SchemaCatalog, strict: bool) -> Result<Value> {
    let mut settings = SchemaSettings::draft2020_12();
    settings.inline_subschemas = true;
    let schema = settings.into_generator().into_root_schema_for::<T>();
    let mut document = serde_json::to_value(schema).map_err(Error::system)?;
    catalog.apply(&mut document);
    if strict {
        apply_strict(&mut document);
    }
    strip_ids(&mut document);
    Ok(document)
}

/// Tightens every object level of the document: no undeclared properties,
/// and every declared property is required (sorted by name).
///
/// The walk visits every map value and array element rather than a fixed
/// keyword list, so subschemas in positions like `additionalProperties`
/// (map value types), `patternProperties`, `prefixItems`, or `then` are
/// tightened too. Nodes without a `properties` key are left open.
pub(crate) fn apply_strict(document: &mut Value) {
    match document {
        Value::Object(map) => {
            if let Some(properties) = map.get("properties") {
                let mut declared: Vec<String> = match properties {
                    Value::Object(properties) => properties.keys().cloned().collect(),
                    _ => Vec::new(),
                };
                map.insert("additionalProperties".to_string(), Value::Bool(false));
                if !declared.is_empty() {
                    declared.sort_unstable();
                    map.insert(
                        "required".to_string(),
                        Value::Array(declared.into_iter().map(Value::String).collect()),
                    );
                }
            }
            for child in map.values_mut() {
                apply_strict(child);
            }
        }
        Value::Array(items) => {
            for child in items {
                apply_strict(child);
            }
        }
        _ => {}
    }
}

/// Removes `$id`/`id` keys everywhere so compiled documents never collide
/// on base-URI resolution.
pub(crate) fn strip_ids(document: &mut Value) {
    match document {
        Value::Object(map) => {
            map.remove("$id");
            map.remove("id");
            for child in map.values_mut() {
                strip_ids(child);
            }
        }
        Value::Array(items) => {
            for child in items {
                strip_ids(child);
            }
        }
        _ => {}
    }
}

/// Compiles a document into a reusable validator.
pub(crate) fn compile(document: &Value) -> Result<jsonschema::Validator> {
    jsonschema::validator_for(document)
        .map_err(|err| Error::client(format!("invalid schema document: {err}")))
}
