//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The platform watcher could not create its OS subscription
    #[error("Watcher initialization failed: {0}")]
    WatcherInit(String),

    /// A device enumeration could not complete
    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    /// libusb itself could not be initialized
    #[error("USB error: {0}")]
    Usb(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::WatcherInit("hotplug not supported".to_string());
        assert_eq!(
            err.to_string(),
            "Watcher initialization failed: hotplug not supported"
        );

        let err = Error::Enumeration("access denied".to_string());
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
