//! Engine configuration and the explicit evaluation context.

use crate::core::error::{ConfigError, CubeError, CubeResult};
use crate::cubes::stream::process::DEFAULT_STREAM_TIMEOUT_SECS;
use crate::execution::engine::{ChunkScheduler, ErrorPolicy};
use crate::graph::registry::CollectionRegistry;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Options for an [`Engine`].
///
/// All fields have defaults, so a TOML file only needs the keys it changes:
///
/// ```toml
/// threads = 4
/// error_policy = "tolerant"
/// swarm = ["http://10.0.0.2:1111"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads; 0 uses the available parallelism.
    pub threads: usize,
    /// Remote worker base URLs; empty evaluates locally.
    pub swarm: Vec<String>,
    /// Log at debug level unless `RUST_LOG` says otherwise.
    pub debug: bool,
    /// Extra directories searched for format descriptions.
    pub format_dirs: Vec<PathBuf>,
    /// Timeout for stream commands without their own, and for remote requests.
    pub stream_timeout_secs: f64,
    /// How chunk failures are handled.
    pub error_policy: ErrorPolicy,
    /// Completed chunks that may wait for the sink.
    pub chunk_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            swarm: Vec::new(),
            debug: false,
            format_dirs: Vec::new(),
            stream_timeout_secs: DEFAULT_STREAM_TIMEOUT_SECS,
            error_policy: ErrorPolicy::default(),
            chunk_queue: 16,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges and swarm URLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.stream_timeout_secs.is_finite() && self.stream_timeout_secs > 0.0) {
            return Err(invalid("stream_timeout_secs", "must be a positive number of seconds"));
        }
        if self.chunk_queue == 0 {
            return Err(invalid("chunk_queue", "must be at least 1"));
        }
        for url in &self.swarm {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(
                    "swarm",
                    format!("'{}' is not an http(s) URL", url),
                ));
            }
        }
        Ok(())
    }

    /// Set the number of worker threads.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the remote worker URLs.
    pub fn with_swarm(mut self, swarm: Vec<String>) -> Self {
        self.swarm = swarm;
        self
    }

    /// Enable or disable debug logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Add a format description directory.
    pub fn with_format_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.format_dirs.push(dir.into());
        self
    }

    /// Set the default stream timeout.
    pub fn with_stream_timeout(mut self, secs: f64) -> Self {
        self.stream_timeout_secs = secs;
        self
    }

    /// Set the error policy.
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Set the bound of the completed-chunk queue.
    pub fn with_chunk_queue(mut self, chunks: usize) -> Self {
        self.chunk_queue = chunks;
        self
    }

    /// Thread count after resolving 0.
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Evaluation context owning the worker pool and the collection registry.
///
/// Several engines may coexist in one process; each has its own pool.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    pool: Arc<rayon::ThreadPool>,
    registry: CollectionRegistry,
}

impl Engine {
    /// Validate `config`, set up logging and start the worker pool.
    pub fn init(config: EngineConfig) -> CubeResult<Self> {
        config.validate()?;
        init_logging(config.debug);

        let threads = config.effective_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("rastercube-{}", i))
            .build()
            .map_err(|e| CubeError::WorkerPool(e.to_string()))?;

        let mut registry = CollectionRegistry::new().with_stream_timeout(config.stream_timeout_secs);
        for dir in &config.format_dirs {
            registry.add_format_dir(dir);
        }

        info!(
            "Engine started with {} threads{}",
            threads,
            if config.swarm.is_empty() {
                String::new()
            } else {
                format!(" and {} swarm workers", config.swarm.len())
            }
        );
        Ok(Self {
            config,
            pool: Arc::new(pool),
            registry,
        })
    }

    /// Configuration the engine was started with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared worker pool.
    pub fn pool(&self) -> Arc<rayon::ThreadPool> {
        self.pool.clone()
    }

    /// Collections known to this engine.
    pub fn registry(&self) -> &CollectionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut CollectionRegistry {
        &mut self.registry
    }

    /// Scheduler using this engine's pool and policy.
    pub fn scheduler(&self) -> ChunkScheduler {
        ChunkScheduler::new(self)
    }

    /// Stop the engine. The pool shuts down once running schedulers drop it.
    pub fn teardown(self) {
        debug!("Engine shut down");
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    // A logger installed earlier in the process stays in place.
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.stream_timeout_secs, 60.0);
        assert_eq!(config.error_policy, ErrorPolicy::Auto);
        assert!(config.effective_threads() >= 1);
        assert_eq!(config.clone().with_threads(3).effective_threads(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            threads = 2
            debug = true
            error_policy = "tolerant"
            swarm = ["http://localhost:1111", "https://worker:2222/"]
            stream_timeout_secs = 5.5
            "#,
        )
        .unwrap();
        assert_eq!(config.threads, 2);
        assert!(config.debug);
        assert_eq!(config.error_policy, ErrorPolicy::Tolerant);
        assert_eq!(config.swarm.len(), 2);
        assert_eq!(config.stream_timeout_secs, 5.5);
        assert_eq!(config.chunk_queue, 16);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            EngineConfig::from_toml_str("threads = \"many\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("swarm = [\"ftp://host\"]"),
            Err(ConfigError::Invalid { ref key, .. }) if key == "swarm"
        ));
        assert!(EngineConfig::default().with_stream_timeout(0.0).validate().is_err());
        assert!(EngineConfig::default().with_chunk_queue(0).validate().is_err());
        assert!(matches!(
            EngineConfig::from_file("/nonexistent/engine.toml"),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "chunk_queue = 4\nerror_policy = \"fatal\"\n").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.chunk_queue, 4);
        assert_eq!(config.error_policy, ErrorPolicy::Fatal);
    }

    #[test]
    fn test_engine_init_and_teardown() {
        for _ in 0..2 {
            let engine = Engine::init(
                EngineConfig::default()
                    .with_threads(2)
                    .with_stream_timeout(9.0),
            )
            .unwrap();
            assert_eq!(engine.pool().current_num_threads(), 2);
            assert_eq!(engine.registry().stream_timeout_secs(), Some(9.0));
            engine.teardown();
        }
        assert!(matches!(
            Engine::init(EngineConfig::default().with_swarm(vec!["localhost".into()])),
            Err(CubeError::Config(_))
        ));
    }
}
