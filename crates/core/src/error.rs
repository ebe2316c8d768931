use thiserror::Error;

#[derive(Error, Debug)]
pub enum EchotunError {
    #[error("Frame too short: need {required} bytes, got {available}")]
    TooShort { required: usize, available: usize },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Packet too big: {length} bytes exceeds buffer of {capacity}")]
    PacketTooBig { length: usize, capacity: usize },

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EchotunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_too_short() {
        let err = EchotunError::TooShort {
            required: 5,
            available: 3,
        };
        assert_eq!(err.to_string(), "Frame too short: need 5 bytes, got 3");
    }

    #[test]
    fn test_error_display_invalid_payload() {
        let err = EchotunError::InvalidPayload("connection accept of 3 bytes".to_string());
        assert_eq!(err.to_string(), "Invalid payload: connection accept of 3 bytes");
    }

    #[test]
    fn test_error_display_packet_too_big() {
        let err = EchotunError::PacketTooBig {
            length: 2000,
            capacity: 1480,
        };
        assert_eq!(
            err.to_string(),
            "Packet too big: 2000 bytes exceeds buffer of 1480"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "raw socket");
        let err: EchotunError = io.into();
        assert!(err.to_string().starts_with("IO error:"));
    }

    #[test]
    fn test_result_type_err() {
        let result: Result<i32> = Err(EchotunError::Socket("closed".to_string()));
        assert!(result.is_err());
    }
}
