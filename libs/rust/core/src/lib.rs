//! Core library for the model artifact resolution and serving stack:
//! credential context, content-addressed artifact resolver, predictor
//! cache with single-flight loads, and the serving configuration surface.

use once_cell::sync::OnceCell;

pub mod config;
pub mod credential;
pub mod error;
pub mod loader;
pub mod predictor;
pub mod remote;
pub mod resilience;
pub mod resolver;

pub use config::ServingConfig;
pub use credential::CredentialContext;
pub use error::{
    CredentialError, FetchError, LoadError, PredictError, ResolveError, ValidationError,
};
pub use loader::{LoadStatus, ModelCache, PredictorLease};
pub use predictor::{deserialize_artifact, InputSchema, Prediction, Predictor};
pub use remote::{HttpRemoteStore, RemoteStore};
pub use resilience::{retry_async, RetryConfig};
pub use resolver::{sha256_hex, ArtifactResolver, ModelVersion};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Initializes the fmt subscriber with `RUST_LOG` filtering. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();
    });
}
