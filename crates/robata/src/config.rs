//! # Engine configuration
//!
//! Deployment topology decides which [`InferenceEngine`] a service talks to. It
//! is described once, usually in a TOML file, and turned into an engine at
//! startup with [`EngineConfig::build`].
//!
//! ```toml
//! kind = "threaded"
//! workers = 2
//!
//! [inner]
//! kind = "remote"
//! base_url = "http://localhost:8000"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{EchoEngine, InferenceEngine};
use crate::error::ConfigError;
use crate::threaded::ThreadPoolEngine;

#[cfg(feature = "process")]
use crate::process::{ProcessPoolEngine, ProcessPoolOptions, WorkerCommand};
#[cfg(feature = "remote")]
use crate::remote::RemoteClient;

fn default_true() -> bool {
    true
}

/// Which engine to run, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineConfig {
    /// An HTTP text-generation endpoint
    #[cfg(feature = "remote")]
    Remote {
        base_url: String,

        /// Sent with every request
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },

    /// A pool of worker processes, one per device
    #[cfg(feature = "process")]
    Processes {
        worker: WorkerCommand,

        /// Defaults to the accelerator count
        #[serde(default)]
        num_workers: Option<usize>,

        #[serde(default = "default_true")]
        wait_ready: bool,
    },

    /// `workers` instances of `inner`, sharing one request queue
    Threaded {
        workers: usize,
        inner: Box<EngineConfig>,
    },

    /// The deterministic echo model
    Echo {
        #[serde(default)]
        reply: Option<String>,

        #[serde(default)]
        delay_ms: u64,
    },
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Checks the values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            #[cfg(feature = "remote")]
            EngineConfig::Remote { base_url, .. } if base_url.trim().is_empty() => {
                Err(ConfigError::Invalid("remote base_url is empty".into()))
            }
            #[cfg(feature = "process")]
            EngineConfig::Processes {
                num_workers: Some(0),
                ..
            } => Err(ConfigError::Invalid("num_workers must be at least 1".into())),
            EngineConfig::Threaded { workers: 0, .. } => {
                Err(ConfigError::Invalid("threaded workers must be at least 1".into()))
            }
            EngineConfig::Threaded { inner, .. } => inner.validate(),
            _ => Ok(()),
        }
    }

    /// Starts the configured engine.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(&self) -> BoxFuture<'_, Result<Arc<dyn InferenceEngine>, ConfigError>> {
        Box::pin(async move {
            self.validate()?;
            let engine: Arc<dyn InferenceEngine> = match self {
                #[cfg(feature = "remote")]
                EngineConfig::Remote { base_url, headers } => {
                    info!(%base_url, "using remote engine");
                    Arc::new(RemoteClient::with_headers(base_url, headers)?)
                }
                #[cfg(feature = "process")]
                EngineConfig::Processes {
                    worker,
                    num_workers,
                    wait_ready,
                } => {
                    let options = ProcessPoolOptions {
                        num_workers: *num_workers,
                        wait_ready: *wait_ready,
                    };
                    Arc::new(ProcessPoolEngine::spawn(worker, options).await?)
                }
                EngineConfig::Threaded { workers, inner } => {
                    let mut engines = Vec::with_capacity(*workers);
                    for _ in 0..*workers {
                        engines.push(inner.build().await?);
                    }
                    Arc::new(ThreadPoolEngine::new(engines))
                }
                EngineConfig::Echo { reply, delay_ms } => {
                    let mut engine = EchoEngine::new().with_delay(Duration::from_millis(*delay_ms));
                    if let Some(reply) = reply {
                        engine = engine.with_reply(reply.clone());
                    }
                    Arc::new(engine)
                }
            };
            Ok(engine)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::GenerationParams;

    #[test]
    fn test_parse_echo() {
        let config = EngineConfig::from_toml_str("kind = \"echo\"\nreply = \"hi\"").unwrap();
        assert_eq!(
            config,
            EngineConfig::Echo {
                reply: Some("hi".into()),
                delay_ms: 0
            }
        );
    }

    #[cfg(feature = "remote")]
    #[test]
    fn test_parse_nested_threaded_remote() {
        let config = EngineConfig::from_toml_str(
            r#"
            kind = "threaded"
            workers = 2

            [inner]
            kind = "remote"
            base_url = "http://localhost:8000/"
            headers = { authorization = "Bearer t" }
            "#,
        )
        .unwrap();

        let EngineConfig::Threaded { workers, inner } = config else {
            panic!("expected a threaded config");
        };
        assert_eq!(workers, 2);
        assert!(matches!(*inner, EngineConfig::Remote { ref headers, .. } if headers.len() == 1));
    }

    #[cfg(feature = "process")]
    #[test]
    fn test_parse_processes_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            kind = "processes"

            [worker]
            program = "robata-worker"
            "#,
        )
        .unwrap();
        assert_eq!(
            config,
            EngineConfig::Processes {
                worker: WorkerCommand::new("robata-worker"),
                num_workers: None,
                wait_ready: true,
            }
        );
    }

    #[test]
    fn test_rejects_invalid_values() {
        let zero = EngineConfig::from_toml_str(
            "kind = \"threaded\"\nworkers = 0\n[inner]\nkind = \"echo\"",
        );
        assert!(matches!(zero, Err(ConfigError::Invalid(_))));

        let unknown = EngineConfig::from_toml_str("kind = \"carrier-pigeon\"");
        assert!(matches!(unknown, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = EngineConfig::from_path("/nonexistent/robata.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[tokio::test]
    async fn test_build_threaded_echo() {
        let config = EngineConfig::Threaded {
            workers: 2,
            inner: Box::new(EngineConfig::Echo {
                reply: Some("ok".into()),
                delay_ms: 0,
            }),
        };
        let engine = config.build().await.unwrap();
        let text = engine.generate("q", &GenerationParams::default()).await.unwrap();
        assert_eq!(text, "k");
    }
}
