//! # Switchboard Testkit
//!
//! Scaffolding for testing code built on the switchboard dispatch engine:
//! a scriptable [`MockHandler`], a [`RecordingSink`] that captures
//! delivered fragments, and conveniences for wiring up a registry with
//! test-friendly settings.
//!
//! ```
//! use switchboard::Call;
//! use switchboard_testkit::{MockHandler, RecordingSink, test_registry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> switchboard::Result<()> {
//! let registry = test_registry([MockHandler::new("echo").into_arc()]);
//! let sink = RecordingSink::new();
//!
//! registry
//!     .execute(Call::new("c1", "echo", r#"{"k":"v"}"#), sink.handle())
//!     .await?;
//!
//! assert_eq!(sink.fragments_for("c1").len(), 1);
//! # Ok(())
//! # }
//! ```

use std::{sync::Arc, time::Duration};

use switchboard::{Handler, Registry};

mod mock;
mod sink;

pub use mock::MockHandler;
pub use sink::RecordingSink;

/// Builds a registry tuned for tests and registers `handlers` into it.
///
/// The default timeout is stretched to 30 seconds so debugger pauses and
/// slow CI machines do not trip deadlines meant for production.
#[must_use]
pub fn test_registry(handlers: impl IntoIterator<Item = Arc<dyn Handler>>) -> Registry {
    let registry = Registry::builder()
        .default_timeout(Duration::from_secs(30))
        .build();
    for handler in handlers {
        registry.register(handler);
    }
    registry
}

/// Installs a fmt subscriber that respects `RUST_LOG` and writes through
/// the test capture. Safe to call from every test; only the first call
/// installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use switchboard::Call;

    use super::*;

    #[test]
    fn test_registry_registers_everything() {
        let registry = test_registry([
            MockHandler::new("first").into_arc(),
            MockHandler::new("second").into_arc(),
        ]);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("first"));
        assert!(registry.contains("second"));
    }

    #[tokio::test]
    async fn test_end_to_end_with_mock_and_recording_sink() {
        init_tracing();
        let mock = MockHandler::new("echo");
        let registry = test_registry([mock.clone().into_arc()]);
        let sink = RecordingSink::new();

        registry
            .execute(Call::new("c1", "echo", r#"{"k":"v"}"#), sink.handle())
            .await
            .unwrap();

        assert_eq!(mock.calls(), 1);
        let fragments = sink.fragments_for("c1");
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].handler, "echo");
    }
}
