//! json-rpc error enum which contains all different errors which can happen
//! when sending request and processing reply from json-rpc server.

use std::{convert::From, fmt, io, time::Duration};

use nix::errno::Errno;

/// Classification of the numeric code carried by an rpc error response.
/// The well known json-rpc codes come first, anything else is mapped
/// through errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    NotFound,
    AlreadyExists,
    /// errno ENODEV (-19): the target has no such device.
    NoSuchDevice,
    Other,
}

impl RpcCode {
    /// Classify a raw error code from a response envelope.
    pub fn from_code(code: i32) -> Self {
        match -code {
            32700 => RpcCode::ParseError,
            32600 => RpcCode::InvalidRequest,
            32601 => RpcCode::MethodNotFound,
            32602 => RpcCode::InvalidParams,
            32603 => RpcCode::InternalError,
            value => match Errno::from_i32(value) {
                Errno::ENOENT => RpcCode::NotFound,
                Errno::EEXIST => RpcCode::AlreadyExists,
                Errno::ENODEV => RpcCode::NoSuchDevice,
                _ => RpcCode::Other,
            },
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// Failed to connect to the control socket.
    ConnectError { sock: String, err: io::Error },
    /// Read or write on the transport failed; terminal for the session.
    IoError(io::Error),
    /// A request could not be serialized.
    EncodeError(serde_json::Error),
    /// A reply could not be deserialized.
    ParseError(serde_json::Error),
    /// The response named a protocol version other than "2.0".
    InvalidVersion { version: String },
    /// Error response from the target, code and message as sent.
    RpcError { code: i32, msg: String },
    /// The call exceeded its deadline in the given stage.
    Timeout { stage: &'static str, timeout: Duration },
    /// The session was closed while the call was outstanding.
    Shutdown,
    /// Call context wrapper: which request failed and why.
    Call {
        id: u32,
        method: String,
        params: Option<serde_json::Value>,
        source: Box<Error>,
    },
    GenericError(String),
}

impl Error {
    /// The classification of the rpc error behind this error, if any.
    pub fn rpc_code(&self) -> Option<RpcCode> {
        match self {
            Error::RpcError { code, .. } => Some(RpcCode::from_code(*code)),
            Error::Call { source, .. } => source.rpc_code(),
            _ => None,
        }
    }

    /// True for the distinguished "no such device" (-19) target error.
    pub fn is_no_such_device(&self) -> bool {
        self.rpc_code() == Some(RpcCode::NoSuchDevice)
    }

    /// True when the call failed on its deadline, in whatever stage.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Call { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// True when the call failed because the session went away.
    pub fn is_shutdown(&self) -> bool {
        match self {
            Error::Shutdown => true,
            Error::Call { source, .. } => source.is_shutdown(),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ConnectError { sock, err } => {
                write!(f, "Error connecting to {}: {}", sock, err)
            }
            Error::IoError(err) => write!(f, "IO error: {}", err),
            Error::EncodeError(err) => write!(f, "Invalid json request: {}", err),
            Error::ParseError(err) => write!(f, "Invalid json reply: {}", err),
            Error::InvalidVersion { version } => {
                write!(f, "Invalid json-rpc version {}", version)
            }
            Error::RpcError { code, msg } => {
                write!(f, "Json-rpc error {:?} ({}): {}", RpcCode::from_code(*code), code, msg)
            }
            Error::Timeout { stage, timeout } => {
                write!(f, "Timeout {:?} waiting for {}", timeout, stage)
            }
            Error::Shutdown => write!(f, "Client shut down with the call outstanding"),
            Error::Call {
                id,
                method,
                params,
                source,
            } => write!(
                f,
                "Error sending message, id {}, method {}, params {:?}: {}",
                id, method, params, source
            ),
            Error::GenericError(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ConnectError { err, .. } => Some(err),
            Error::IoError(err) => Some(err),
            Error::EncodeError(err) => Some(err),
            Error::ParseError(err) => Some(err),
            Error::Call { source, .. } => Some(&**source),
            _ => None,
        }
    }
}

// Automatic conversion functions for simply using .into() on various return
// types follow

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseError(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::GenericError(err.to_owned())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::GenericError(err)
    }
}
