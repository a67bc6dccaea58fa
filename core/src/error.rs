use thiserror::Error;

/// Imagetest error types
#[derive(Error, Debug)]
pub enum ImagetestError {
    /// Malformed user input: unparseable reference, tag-only image, unknown driver
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Test image assembly failed (mutators, push)
    #[error("Image assembly failed for {reference}: {message}")]
    ImageAssembly { reference: String, message: String },

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Driver provisioning failed
    #[error("Driver setup failed ({driver}): {message}")]
    DriverSetup { driver: String, message: String },

    /// A test container exited non-zero
    #[error("Test {test} failed: container exited with code {exit_code}")]
    TestFailed {
        test: String,
        exit_code: i32,
        detail: String,
    },

    /// Deadline expiry at run or test scope
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Resource cleanup failed
    #[error("Teardown error: {0}")]
    Teardown(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ImagetestError {
    fn from(err: serde_json::Error) -> Self {
        ImagetestError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ImagetestError {
    fn from(err: serde_yaml::Error) -> Self {
        ImagetestError::Serialization(err.to_string())
    }
}

/// Result type alias for imagetest operations
pub type Result<T> = std::result::Result<T, ImagetestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_display() {
        let error = ImagetestError::InvalidInput("tag-only reference".to_string());
        assert_eq!(error.to_string(), "Invalid input: tag-only reference");
    }

    #[test]
    fn test_image_assembly_display() {
        let error = ImagetestError::ImageAssembly {
            reference: "cgr.dev/example/base@sha256:abc".to_string(),
            message: "push rejected".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Image assembly failed for cgr.dev/example/base@sha256:abc: push rejected"
        );
    }

    #[test]
    fn test_registry_display() {
        let error = ImagetestError::Registry {
            registry: "ghcr.io".to_string(),
            message: "authentication failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: ghcr.io - authentication failed"
        );
    }

    #[test]
    fn test_driver_setup_display() {
        let error = ImagetestError::DriverSetup {
            driver: "k3s_in_docker".to_string(),
            message: "cluster never became ready".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Driver setup failed (k3s_in_docker): cluster never became ready"
        );
    }

    #[test]
    fn test_test_failed_display_carries_exit_code() {
        let error = ImagetestError::TestFailed {
            test: "smoke".to_string(),
            exit_code: 213,
            detail: String::new(),
        };
        assert_eq!(
            error.to_string(),
            "Test smoke failed: container exited with code 213"
        );
    }

    #[test]
    fn test_timeout_display() {
        let error = ImagetestError::Timeout("test smoke exceeded 1s".to_string());
        assert_eq!(error.to_string(), "Timeout: test smoke exceeded 1s");
    }

    #[test]
    fn test_teardown_display() {
        let error = ImagetestError::Teardown("failed to remove container".to_string());
        assert_eq!(
            error.to_string(),
            "Teardown error: failed to remove container"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ImagetestError = io_error.into();
        assert!(matches!(error, ImagetestError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_str = "{ invalid json }";
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str(json_str);
        let json_error = result.unwrap_err();
        let error: ImagetestError = json_error.into();
        assert!(matches!(error, ImagetestError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let yaml_str = "invalid: yaml: content:";
        let result: std::result::Result<serde_yaml::Value, _> = serde_yaml::from_str(yaml_str);
        let yaml_error = result.unwrap_err();
        let error: ImagetestError = yaml_error.into();
        assert!(matches!(error, ImagetestError::Serialization(_)));
    }

    #[test]
    fn test_other_display() {
        let error = ImagetestError::Other("unexpected".to_string());
        assert_eq!(error.to_string(), "unexpected");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(ImagetestError::Other("test error".to_string()))
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_debug() {
        let error = ImagetestError::InvalidInput("test".to_string());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("InvalidInput"));
    }
}
