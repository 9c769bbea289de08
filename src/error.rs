//! Error types for brickbus

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Brickbus error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on the daemon socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `connect` called while a connection is already established
    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    /// Operation requires an established connection
    #[error("Not connected")]
    NotConnected,

    /// No response arrived within the configured response timeout
    #[error("Did not receive response in time")]
    Timeout,

    /// Peer rejected the request payload
    #[error("Got invalid parameter for function {function_id}")]
    InvalidParameter {
        /// Function id of the rejected request
        function_id: u8,
    },

    /// Peer does not implement the requested function
    #[error("Function {function_id} is not supported")]
    NotSupported {
        /// Function id of the rejected request
        function_id: u8,
    },

    /// Peer returned an error code outside the known set
    #[error("Function {function_id} returned unknown error code {error_code}")]
    UnknownErrorCode {
        /// Function id of the rejected request
        function_id: u8,
        /// Raw error code from the response header
        error_code: u8,
    },

    /// Local HMAC-SHA1 computation failed during the authentication handshake
    #[error("Could not generate HMAC-SHA1: {0}")]
    Crypto(String),

    /// Device identifier reported by the peer does not match the expected type
    #[error("UID {uid} belongs to device type {actual} instead of the expected {expected}")]
    WrongDeviceType {
        /// Base58 UID of the mismatched device
        uid: String,
        /// Device identifier the handle was constructed for
        expected: u16,
        /// Device identifier the peer reported
        actual: u16,
    },

    /// Chunked multi-response read detected non-contiguous offsets
    #[error("Stream is out of sync: {0}")]
    StreamOutOfSync(String),

    /// Base58 string contains a character outside the 58-symbol alphabet
    #[error("Invalid Base58 character: {0:?}")]
    InvalidBase58Character(char),

    /// Function id is not declared for this device
    #[error("Invalid function ID {0}")]
    InvalidFunctionId(u8),
}
