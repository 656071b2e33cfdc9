//! Builds a `TaskEngine` from service configuration

use tracing::{info, warn};

use super::TaskEngine;
use crate::algorithms::{AlgorithmSet, ServiceMetaData};
use crate::config::ServiceConfig;
use crate::error::ConfigError;
use crate::pool::WorkerPool;
use crate::validator::SchemaValidator;

pub struct EngineFactory {
    config: ServiceConfig,
    algorithms: Option<AlgorithmSet>,
}

impl EngineFactory {
    /// Resolve the algorithm set up front so a bad algorithm file fails at startup
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ConfigError> {
        let algorithms = config.algorithms()?;
        match &algorithms {
            Some(set) => info!("Loaded {} algorithm(s)", set.len()),
            None => warn!("No algorithms configured, every request will be refused"),
        }
        Ok(Self {
            config: config.clone(),
            algorithms,
        })
    }

    pub fn metadata(&self) -> ServiceMetaData {
        ServiceMetaData::new(
            &self.config.name,
            &self.config.description,
            &self.config.input_data_format,
            &self.config.output_data_format,
            self.algorithms.as_ref(),
        )
    }

    pub fn build(&self) -> TaskEngine {
        info!(
            "Creating engine with {} worker(s), task directory {}",
            self.config.num_workers,
            self.config.task_dir.display()
        );
        let pool = WorkerPool::new(self.config.num_workers, self.config.max_queued_tasks);
        TaskEngine::new(self.config.runner_settings(), pool, self.algorithms.clone())
            .with_validator(Box::new(SchemaValidator::new()))
            .with_poll_interval(self.config.poll_interval())
            .with_metadata(self.metadata())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_example() {
        let config = ServiceConfig::from_toml_str(&ServiceConfig::example()).unwrap();
        let factory = EngineFactory::from_config(&config).unwrap();

        let meta = factory.metadata();
        assert_eq!(meta.name, config.name);
        assert_eq!(meta.algorithms.len(), 1);

        let engine = factory.build();
        assert_eq!(engine.get_algorithms().unwrap().len(), 1);
        assert_eq!(engine.metadata(), Some(&meta));
    }

    #[test]
    fn test_bad_algorithm_file_fails_early() {
        let config = ServiceConfig {
            algorithm_file: Some("/nonexistent/algorithms.toml".into()),
            ..Default::default()
        };
        assert!(matches!(
            EngineFactory::from_config(&config),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_no_algorithms() {
        let factory = EngineFactory::from_config(&ServiceConfig::default()).unwrap();
        assert!(factory.metadata().algorithms.is_empty());
        assert!(factory.build().get_algorithms().is_err());
    }
}
