//! Configuration validation.

use std::fmt;

use kernelhive_protocols::InterruptionMode;

use crate::schema::Config;

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_manager(config, &mut result);
        Self::validate_host(config, &mut result);
        Self::validate_pool(config, &mut result);
        Self::validate_timeouts(config, &mut result);

        result
    }

    fn validate_manager(config: &Config, result: &mut ValidationResult) {
        if config.manager.default_namespace.is_empty() {
            result.add_error(ValidationError::new(
                "manager.default_namespace",
                "Default namespace cannot be empty",
            ));
        }

        if config.manager.default_language.is_empty() {
            result.add_error(ValidationError::new(
                "manager.default_language",
                "Default language cannot be empty",
            ));
        }

        for (i, spec) in config.manager.allowed_kernel_types.iter().enumerate() {
            if spec.language.is_empty() {
                result.add_error(ValidationError::new(
                    format!("manager.allowed_kernel_types[{}]", i),
                    "Language cannot be empty",
                ));
            }
        }
    }

    fn validate_host(config: &Config, result: &mut ValidationResult) {
        let shared = config.host.shared_memory && config.host.cross_origin_isolated;
        if !shared && config.manager.interruption_mode == InterruptionMode::SharedMemory {
            result.add_warning(ValidationWarning::new(
                "manager.interruption_mode",
                "shared-memory interruption requested but the host cannot share memory; \
                 kernels will fall back to direct-call interruption",
            ));
        }
    }

    fn validate_pool(config: &Config, result: &mut ValidationResult) {
        let pool = &config.pool;

        if pool.enabled && pool.pool_size == 0 {
            result.add_warning(ValidationWarning::new(
                "pool.pool_size",
                "Pool is enabled with size 0; every creation will miss",
            ));
        }

        for (i, spec) in pool.preload.iter().enumerate() {
            if !config.manager.allows(spec) {
                result.add_error(ValidationError::new(
                    format!("pool.preload[{}]", i),
                    format!("{} is not in manager.allowed_kernel_types", spec),
                ));
            }
        }

        if pool.refill.backoff_multiplier < 1.0 {
            result.add_error(ValidationError::new(
                "pool.refill.backoff_multiplier",
                "backoff_multiplier must be at least 1.0",
            ));
        }

        if pool.refill.max_delay_ms < pool.refill.base_delay_ms {
            result.add_warning(ValidationWarning::new(
                "pool.refill.max_delay_ms",
                "max_delay_ms is below base_delay_ms; every retry will use max_delay_ms",
            ));
        }
    }

    fn validate_timeouts(config: &Config, result: &mut ValidationResult) {
        if config.bridge.init_timeout_ms == 0 {
            result.add_error(ValidationError::new(
                "bridge.init_timeout_ms",
                "init_timeout_ms must be greater than 0",
            ));
        }

        if config.kernel.interrupt_timeout_ms == 0 {
            result.add_error(ValidationError::new(
                "kernel.interrupt_timeout_ms",
                "interrupt_timeout_ms must be greater than 0",
            ));
        }

        if config.kernel.max_execution_time_secs == Some(0) {
            result.add_error(ValidationError::new(
                "kernel.max_execution_time_secs",
                "max_execution_time_secs must be greater than 0 when set",
            ));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
