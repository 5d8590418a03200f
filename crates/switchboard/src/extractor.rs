//! Typed payload extraction: structural validation first, business rules
//! second.
//!
//! An [`Extractor`] turns raw payload bytes into a typed input value in two
//! layers. Layer one is mechanical: parse the bytes as JSON and check them
//! against the input type's compiled schema. Layer two is semantic: run the
//! type's own [`Input::validate`] business rule, exactly once, and only
//! after layer one passed. Rules never see structurally invalid data, and a
//! structural failure never runs a rule.
//!
//! Both layers report client-class errors; a business-rule failure is
//! additionally tagged with the validation-failed sentinel so callers can
//! tell the two layers apart.

use std::marker::PhantomData;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    error::{Error, Result},
    schema::{self, SchemaCatalog},
};

/// An input shape handlers can be built around.
///
/// Implementing the trait is one line for shapes with no business rules:
///
/// ```
/// use switchboard::Input;
///
/// #[derive(serde::Deserialize, schemars::JsonSchema)]
/// struct Echo {
///     message: String,
/// }
///
/// impl Input for Echo {}
/// ```
///
/// Shapes with business rules override [`Input::validate`]; the default
/// accepts everything.
pub trait Input: DeserializeOwned + JsonSchema + Send {
    /// Business-rule validation, run after the structural layer passed.
    ///
    /// Return an error to reject input that is structurally sound but
    /// semantically wrong. The message is shown to the requester. To control
    /// classification (for example to mark the rejection retryable), return
    /// a [`crate::Error`] via `anyhow`; client-class errors pass through
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Implementations return an error to reject the input.
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Compiled extraction pipeline for one input type.
///
/// Construction generates and compiles the schema once; every call reuses
/// the compiled validator.
pub struct Extractor<T> {
    document: Value,
    validator: jsonschema::Validator,
    _input: PhantomData<fn() -> T>,
}

impl<T: Input> Extractor<T> {
    /// Builds an extractor using the process-default schema catalog.
    ///
    /// In strict mode the generated document forbids undeclared properties
    /// and requires every declared one.
    ///
    /// # Errors
    ///
    /// Returns a client-class error when the generated document does not
    /// compile (possible when a catalog transform rewrites it invalidly).
    pub fn new(strict: bool) -> Result<Self> {
        Self::with_catalog(strict, &SchemaCatalog::process_default())
    }

    /// Builds an extractor with an explicit schema catalog.
    ///
    /// # Errors
    ///
    /// Returns a client-class error when the generated document does not
    /// compile.
    pub fn with_catalog(strict: bool, catalog: &SchemaCatalog) -> Result<Self> {
        let document = schema::generate::<T>(catalog, strict)?;
        let validator = schema::compile(&document)?;
        Ok(Self {
            document,
            validator,
            _input: PhantomData,
        })
    }

    /// Returns an independent copy of the schema document.
    #[must_use]
    pub fn schema(&self) -> Value {
        self.document.clone()
    }

    /// Runs the full two-layer pipeline against a raw payload.
    ///
    /// # Errors
    ///
    /// All failures are client-class: malformed JSON and schema violations
    /// from the structural layer, and rule rejections from the business
    /// layer, the latter tagged with [`Error::ValidationFailed`] unless the
    /// rule already produced a client-class error of its own.
    pub fn parse_and_validate(&self, payload: &[u8]) -> Result<T> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| Error::client(format!("json parse error: {err}")))?;

        // The validator's own message is the caller-facing reason.
        self.validator
            .validate(&value)
            .map_err(|err| Error::client(err.to_string()))?;

        let input: T = serde_json::from_value(value)
            .map_err(|err| Error::client(format!("json parse error: {err}")))?;

        // The business rule runs at most once per payload, and only here.
        input.validate().map_err(reclassify_rule_failure)?;
        Ok(input)
    }
}

impl<T> std::fmt::Debug for Extractor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor").finish_non_exhaustive()
    }
}

fn reclassify_rule_failure(err: anyhow::Error) -> Error {
    match err.downcast::<Error>() {
        Ok(engine_err) if engine_err.is_client() => engine_err,
        Ok(engine_err) => Error::validation(engine_err.to_string()),
        Err(err) => Error::validation(format!("{err:#}")),
    }
}
