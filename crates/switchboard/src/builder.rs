//! Handler construction from plain async functions.
//!
//! [`HandlerBuilder`] turns a function into an `Arc<dyn Handler>` without
//! hand-implementing the trait. Four shapes are supported:
//!
//! - [`build`](HandlerBuilder::build): typed input, one serialized result.
//! - [`build_streaming`](HandlerBuilder::build_streaming): typed input,
//!   zero or more fragments through an [`Emitter`].
//! - [`build_dynamic`](HandlerBuilder::build_dynamic): caller-supplied
//!   schema document, raw payload bytes.
//! - [`build_proxy`](HandlerBuilder::build_proxy): like dynamic, but the
//!   document arrives serialized, as when relaying schemas from another
//!   server.
//!
//! Typed builders validate payloads with an [`Extractor`] (both layers);
//! dynamic and proxy handlers get the structural layer only, since there is
//! no typed shape to hang a business rule on. Strict tightening is the
//! [`strict`](HandlerBuilder::strict) opt-in for all four shapes; identifier
//! stripping always runs so compiled documents never collide on base-URI
//! resolution.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::{
    call::Fragment,
    error::{Error, Result},
    extractor::{Extractor, Input},
    handler::{Handler, HandlerMetadata},
    schema::{self, SchemaCatalog},
    sink::SinkHandle,
};

type RawFn = Arc<dyn Fn(Bytes, Emitter) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Owned delivery handle passed to streaming handler functions.
///
/// Cloneable and cheap; a function that fans work out internally can hand
/// each branch its own emitter. Every send goes through the call's sink and
/// is serialized against all other producers.
#[derive(Debug, Clone)]
pub struct Emitter {
    sink: SinkHandle,
}

impl Emitter {
    pub(crate) fn new(sink: SinkHandle) -> Self {
        Self { sink }
    }

    /// Sends a ready-made fragment.
    ///
    /// # Errors
    ///
    /// Returns the stream-aborted sentinel when the sink rejects the
    /// fragment; propagating it with `?` ends the handler correctly.
    pub fn send(&self, fragment: Fragment) -> Result<()> {
        self.sink.deliver(fragment)
    }

    /// Serializes a value and sends it as the final result.
    ///
    /// # Errors
    ///
    /// System-class on serialization failure, stream-aborted on rejection.
    pub fn result(&self, value: &impl Serialize) -> Result<()> {
        self.send(Fragment::result(serialize(value)?))
    }

    /// Serializes a value and sends it as interim progress.
    ///
    /// # Errors
    ///
    /// System-class on serialization failure, stream-aborted on rejection.
    pub fn progress(&self, value: &impl Serialize) -> Result<()> {
        self.send(Fragment::progress(serialize(value)?))
    }
}

fn serialize(value: &impl Serialize) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(Error::system)
}

/// Fluent constructor for handlers.
///
/// ```
/// use switchboard::{Handler, HandlerBuilder, Input};
///
/// #[derive(serde::Deserialize, schemars::JsonSchema)]
/// struct Greet {
///     name: String,
/// }
///
/// impl Input for Greet {}
///
/// let handler = HandlerBuilder::new("greet", "Greets someone by name")
///     .strict()
///     .tag("demo")
///     .build(|input: Greet| async move {
///         Ok(serde_json::json!({ "greeting": format!("hello, {}", input.name) }))
///     })
///     .unwrap();
/// assert_eq!(handler.name(), "greet");
/// ```
#[derive(Debug)]
pub struct HandlerBuilder {
    name: String,
    description: String,
    strict: bool,
    catalog: Option<SchemaCatalog>,
    metadata: HandlerMetadata,
}

impl HandlerBuilder {
    /// Starts a builder for a handler with the given name and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            strict: false,
            catalog: None,
            metadata: HandlerMetadata::default(),
        }
    }

    /// Tightens the schema document: no undeclared properties, every
    /// declared property required. Applies to generated and supplied
    /// documents alike.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Sets a per-handler execution deadline overriding the registry
    /// default.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.metadata.timeout = Some(timeout);
        self
    }

    /// Adds one discovery tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }

    /// Adds several discovery tags.
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Records the handler implementation version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.metadata.version = Some(version.into());
        self
    }

    /// Marks the handler as needing caller confirmation before running.
    #[must_use]
    pub fn dangerous(mut self) -> Self {
        self.metadata.dangerous = true;
        self
    }

    /// Uses an explicit schema catalog instead of the process default.
    #[must_use]
    pub fn catalog(mut self, catalog: SchemaCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Builds a single-result handler: validate, run, serialize, deliver
    /// exactly one final fragment.
    ///
    /// # Errors
    ///
    /// Client-class when the builder is misconfigured (empty name, schema
    /// document that does not compile).
    pub fn build<T, R, F, Fut>(self, f: F) -> Result<Arc<dyn Handler>>
    where
        T: Input + 'static,
        R: Serialize,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.ensure_named()?;
        let extractor = Arc::new(self.extractor::<T>()?);
        let document = extractor.schema();
        let f = Arc::new(f);
        let run: RawFn = Arc::new(
            move |payload: Bytes, emitter: Emitter| -> BoxFuture<'static, anyhow::Result<()>> {
                let extractor = Arc::clone(&extractor);
                let f = Arc::clone(&f);
                Box::pin(async move {
                    let input = extractor.parse_and_validate(&payload)?;
                    let output = f(input).await?;
                    emitter.result(&output)?;
                    Ok(())
                })
            },
        );
        Ok(self.finish(document, run))
    }

    /// Builds a streaming handler: validate, then hand the typed input and
    /// an [`Emitter`] to the function. Emitting zero fragments is valid.
    ///
    /// # Errors
    ///
    /// Client-class when the builder is misconfigured (empty name, schema
    /// document that does not compile).
    pub fn build_streaming<T, F, Fut>(self, f: F) -> Result<Arc<dyn Handler>>
    where
        T: Input + 'static,
        F: Fn(T, Emitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.ensure_named()?;
        let extractor = Arc::new(self.extractor::<T>()?);
        let document = extractor.schema();
        let f = Arc::new(f);
        let run: RawFn = Arc::new(
            move |payload: Bytes, emitter: Emitter| -> BoxFuture<'static, anyhow::Result<()>> {
                let extractor = Arc::clone(&extractor);
                let f = Arc::clone(&f);
                Box::pin(async move {
                    let input = extractor.parse_and_validate(&payload)?;
                    f(input, emitter).await
                })
            },
        );
        Ok(self.finish(document, run))
    }

    /// Builds a handler from a caller-supplied schema document.
    ///
    /// The document is deep-copied before use; the caller's value, including
    /// nested substructures, is never mutated. The copy is stripped of
    /// identifiers and, when [`strict`](HandlerBuilder::strict) was
    /// requested, tightened first. Payloads get structural validation only,
    /// then the function receives the raw bytes.
    ///
    /// # Errors
    ///
    /// Client-class when the builder is misconfigured or the document does
    /// not compile.
    pub fn build_dynamic<F, Fut>(self, document: &Value, f: F) -> Result<Arc<dyn Handler>>
    where
        F: Fn(Bytes, Emitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.ensure_named()?;
        let mut document = document.clone();
        if self.strict {
            schema::apply_strict(&mut document);
        }
        schema::strip_ids(&mut document);
        let validator = Arc::new(schema::compile(&document)?);
        let f = Arc::new(f);
        let run: RawFn = Arc::new(
            move |payload: Bytes, emitter: Emitter| -> BoxFuture<'static, anyhow::Result<()>> {
                let validator = Arc::clone(&validator);
                let f = Arc::clone(&f);
                Box::pin(async move {
                    check_structure(&validator, &payload)?;
                    f(payload, emitter).await
                })
            },
        );
        Ok(self.finish(document, run))
    }

    /// Builds a handler from a serialized schema document.
    ///
    /// # Errors
    ///
    /// Client-class when the bytes are not a JSON document, or for the same
    /// misconfigurations as [`build_dynamic`](HandlerBuilder::build_dynamic).
    pub fn build_proxy<F, Fut>(self, raw_schema: &[u8], f: F) -> Result<Arc<dyn Handler>>
    where
        F: Fn(Bytes, Emitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let document: Value = serde_json::from_slice(raw_schema)
            .map_err(|err| Error::client(format!("invalid schema document: {err}")))?;
        self.build_dynamic(&document, f)
    }

    fn ensure_named(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::client("handler name must not be empty"));
        }
        Ok(())
    }

    fn extractor<T: Input>(&self) -> Result<Extractor<T>> {
        match &self.catalog {
            Some(catalog) => Extractor::with_catalog(self.strict, catalog),
            None => Extractor::new(self.strict),
        }
    }

    fn finish(self, document: Value, run: RawFn) -> Arc<dyn Handler> {
        Arc::new(BuiltHandler {
            name: self.name,
            description: self.description,
            document,
            metadata: self.metadata,
            run,
        })
    }
}

struct BuiltHandler {
    name: String,
    description: String,
    document: Value,
    metadata: HandlerMetadata,
    run: RawFn,
}

#[async_trait]
impl Handler for BuiltHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        self.document.clone()
    }

    fn metadata(&self) -> HandlerMetadata {
        self.metadata.clone()
    }

    async fn execute(&self, payload: Bytes, sink: SinkHandle) -> Result<()> {
        let emitter = Emitter::new(sink);
        (self.run)(payload, emitter)
            .await
            .map_err(reclassify_handler_failure)
    }
}

fn check_structure(validator: &jsonschema::Validator, payload: &[u8]) -> Result<()> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|err| Error::client(format!("json parse error: {err}")))?;
    // The validator's own message is the caller-facing reason.
    validator
        .validate(&value)
        .map_err(|err| Error::client(err.to_string()))?;
    Ok(())
}

/// Engine errors pass through unchanged; anything foreign becomes
/// system-class with its cause chain folded into the detail.
fn reclassify_handler_failure(err: anyhow::Error) -> Error {
    match err.downcast::<Error>() {
        Ok(engine_err) => engine_err,
        Err(foreign) => Error::system(foreign),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::call::FragmentKind;

    #[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
    struct Doubling {
        x: i64,
    }

    impl Input for Doubling {}

    fn collecting_handle() -> (SinkHandle, Arc<Mutex<Vec<Fragment>>>) {
        let store = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&store);
        let handle = SinkHandle::from_fn(move |fragment| {
            sink_store.lock().unwrap().push(fragment);
            Ok(())
        });
        (handle, store)
    }

    fn doubling_handler() -> Arc<dyn Handler> {
        HandlerBuilder::new("double", "Doubles x")
            .build(|input: Doubling| async move {
                Ok(serde_json::json!({ "y": input.x * 2 }))
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_result_delivers_exactly_one_fragment() {
        let handler = doubling_handler();
        let (sink, store) = collecting_handle();

        handler
            .execute(Bytes::from_static(br#"{"x":7}"#), sink)
            .await
            .unwrap();

        let fragments = store.lock().unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].kind, FragmentKind::Result);
        assert!(!fragments[0].is_error);
        assert_eq!(fragments[0].data, Bytes::from_static(br#"{"y":14}"#));
    }

    #[tokio::test]
    async fn test_single_result_rejects_invalid_payload_before_running() {
        let handler = doubling_handler();
        let (sink, store) = collecting_handle();

        let err = handler
            .execute(Bytes::from_static(br#"{"x":"seven"}"#), sink)
            .await
            .unwrap_err();

        assert!(err.is_client());
        assert!(store.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_streaming_emits_in_order() {
        let handler = HandlerBuilder::new("ticker", "Emits three ticks")
            .build_streaming(|_input: Doubling, emitter: Emitter| async move {
                for tick in 0..3 {
                    emitter.send(Fragment::progress(tick.to_string()))?;
                }
                emitter.result(&serde_json::json!({ "done": true }))?;
                Ok(())
            })
            .unwrap();
        let (sink, store) = collecting_handle();

        handler
            .execute(Bytes::from_static(br#"{"x":0}"#), sink)
            .await
            .unwrap();

        let fragments = store.lock().unwrap();
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments[0].data, Bytes::from_static(b"0"));
        assert_eq!(fragments[1].data, Bytes::from_static(b"1"));
        assert_eq!(fragments[2].data, Bytes::from_static(b"2"));
        assert_eq!(fragments[3].kind, FragmentKind::Result);
    }

    #[tokio::test]
    async fn test_streaming_zero_fragments_is_valid() {
        let handler = HandlerBuilder::new("quiet", "Emits nothing")
            .build_streaming(|_input: Doubling, _emitter: Emitter| async move { Ok(()) })
            .unwrap();
        let (sink, store) = collecting_handle();

        handler
            .execute(Bytes::from_static(br#"{"x":0}"#), sink)
            .await
            .unwrap();

        assert!(store.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_streaming_stops_at_sink_rejection() {
        let handler = HandlerBuilder::new("ticker", "Emits five ticks")
            .build_streaming(|_input: Doubling, emitter: Emitter| async move {
                for tick in 0..5 {
                    emitter.send(Fragment::progress(tick.to_string()))?;
                }
                Ok(())
            })
            .unwrap();

        let delivered = Arc::new(Mutex::new(0_usize));
        let sink_delivered = Arc::clone(&delivered);
        let sink = SinkHandle::from_fn(move |_fragment| {
            let mut count = sink_delivered.lock().unwrap();
            if *count == 2 {
                anyhow::bail!("that is enough");
            }
            *count += 1;
            Ok(())
        });

        let err = handler
            .execute(Bytes::from_static(br#"{"x":0}"#), sink)
            .await
            .unwrap_err();

        assert!(err.is_stream_aborted());
        assert_eq!(*delivered.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dynamic_validates_structure_and_passes_raw_bytes() {
        let document = serde_json::json!({
            "type": "object",
            "properties": { "x": { "type": "integer" } },
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = Arc::clone(&seen);
        let handler = HandlerBuilder::new("raw", "Echoes raw bytes")
            .build_dynamic(&document, move |payload: Bytes, _emitter: Emitter| {
                let seen = Arc::clone(&handler_seen);
                async move {
                    seen.lock().unwrap().push(payload);
                    Ok(())
                }
            })
            .unwrap();
        let (sink, _store) = collecting_handle();

        handler
            .execute(Bytes::from_static(br#"{"x":3}"#), sink.clone())
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap()[0], Bytes::from_static(br#"{"x":3}"#));

        // The document is used as supplied: undeclared keys pass.
        handler
            .execute(Bytes::from_static(br#"{"x":3,"extra":1}"#), sink.clone())
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);

        // Declared shapes are still enforced.
        let err = handler
            .execute(Bytes::from_static(br#"{"x":"three"}"#), sink)
            .await
            .unwrap_err();
        assert!(err.is_client());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dynamic_strict_option_refuses_undeclared_keys() {
        let document = serde_json::json!({
            "type": "object",
            "properties": { "x": { "type": "integer" } },
        });
        let handler = HandlerBuilder::new("raw", "Echoes raw bytes")
            .strict()
            .build_dynamic(&document, |_payload: Bytes, _emitter: Emitter| async move {
                Ok(())
            })
            .unwrap();
        let (sink, _store) = collecting_handle();

        handler
            .execute(Bytes::from_static(br#"{"x":3}"#), sink.clone())
            .await
            .unwrap();

        let err = handler
            .execute(Bytes::from_static(br#"{"x":3,"extra":1}"#), sink)
            .await
            .unwrap_err();
        assert!(err.is_client());
    }

    #[tokio::test]
    async fn test_dynamic_never_mutates_callers_document() {
        let document = serde_json::json!({
            "$id": "https://example.com/tool",
            "type": "object",
            "properties": {
                "inner": {
                    "type": "object",
                    "properties": { "a": {} },
                },
            },
        });
        let original = document.clone();

        let handler = HandlerBuilder::new("raw", "Does nothing")
            .strict()
            .build_dynamic(&document, |_payload: Bytes, _emitter: Emitter| async move {
                Ok(())
            })
            .unwrap();

        // The caller's copy is untouched, nested levels included.
        assert_eq!(document, original);
        assert!(document.get("$id").is_some());
        assert!(document["properties"]["inner"].get("additionalProperties").is_none());

        // The handler's own copy was tightened and stripped.
        let owned = handler.schema();
        assert!(owned.get("$id").is_none());
        assert_eq!(owned["additionalProperties"], Value::Bool(false));
        assert_eq!(
            owned["properties"]["inner"]["additionalProperties"],
            Value::Bool(false)
        );
    }

    #[tokio::test]
    async fn test_proxy_accepts_serialized_documents() {
        let raw = br#"{"type":"object","properties":{"q":{"type":"string"}}}"#;
        let handler = HandlerBuilder::new("relay", "Relays a remote tool")
            .build_proxy(raw, |_payload: Bytes, emitter: Emitter| async move {
                emitter.result(&serde_json::json!({ "ok": true }))?;
                Ok(())
            })
            .unwrap();
        let (sink, store) = collecting_handle();

        handler
            .execute(Bytes::from_static(br#"{"q":"hi"}"#), sink)
            .await
            .unwrap();
        assert_eq!(store.lock().unwrap().len(), 1);

        let err = HandlerBuilder::new("relay", "Broken document")
            .build_proxy(b"not json", |_payload: Bytes, _emitter: Emitter| async move {
                Ok(())
            })
            .map(|_| ())
            .unwrap_err();
        assert!(err.is_client());
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() {
        let document = serde_json::json!({ "type": "object" });
        let err = HandlerBuilder::new("", "Nameless")
            .build_dynamic(&document, |_payload: Bytes, _emitter: Emitter| async move {
                Ok(())
            })
            .map(|_| ())
            .unwrap_err();
        assert!(err.is_client());
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_builder_options_populate_identity_and_metadata() {
        let handler = HandlerBuilder::new("audit", "Audits things")
            .timeout(Duration::from_secs(90))
            .tag("ops")
            .tags(["slow", "external"])
            .version("2.1.0")
            .dangerous()
            .build(|input: Doubling| async move { Ok(serde_json::json!({ "y": input.x })) })
            .unwrap();

        assert_eq!(handler.name(), "audit");
        assert_eq!(handler.description(), "Audits things");
        let metadata = handler.metadata();
        assert_eq!(metadata.timeout, Some(Duration::from_secs(90)));
        assert_eq!(metadata.tags, vec!["ops", "slow", "external"]);
        assert_eq!(metadata.version.as_deref(), Some("2.1.0"));
        assert!(metadata.dangerous);
    }

    #[tokio::test]
    async fn test_foreign_errors_become_opaque_system_errors() {
        let handler = HandlerBuilder::new("leaky", "Fails with internals")
            .build(|_input: Doubling| async move {
                Err::<Value, _>(anyhow::anyhow!("db-prod credentials rejected"))
            })
            .unwrap();
        let (sink, _store) = collecting_handle();

        let err = handler
            .execute(Bytes::from_static(br#"{"x":1}"#), sink)
            .await
            .unwrap_err();

        assert!(err.is_system());
        assert_eq!(
            err.to_string(),
            "internal system error during handler execution"
        );
        assert!(err.detail().unwrap().contains("db-prod"));
    }

    #[tokio::test]
    async fn test_engine_client_errors_pass_through_unchanged() {
        let handler = HandlerBuilder::new("picky", "Rejects politely")
            .build(|_input: Doubling| async move {
                Err::<Value, _>(anyhow::Error::new(Error::client("bad combination")))
            })
            .unwrap();
        let (sink, _store) = collecting_handle();

        let err = handler
            .execute(Bytes::from_static(br#"{"x":1}"#), sink)
            .await
            .unwrap_err();

        assert!(err.is_client());
        assert_eq!(err.to_string(), "invalid handler input: bad combination");
    }

    #[test]
    fn test_catalog_transforms_reach_typed_schemas() {
        let catalog = SchemaCatalog::new().with(|document| {
            document["x-team"] = Value::String("search".to_string());
        });
        let handler = HandlerBuilder::new("tagged", "Carries a team marker")
            .catalog(catalog)
            .build(|input: Doubling| async move { Ok(serde_json::json!({ "y": input.x })) })
            .unwrap();

        assert_eq!(handler.schema()["x-team"], Value::String("search".to_string()));
    }
}
