// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Logging setup. Every component in this crate logs through the `log`
//! facade; this module wires that facade to `flexi_logger` the way a binary
//! embedding the runtime is expected to, once, at startup.

use flexi_logger::{Logger, LoggerHandle};

/// Starts the process-wide logger. `spec` follows `flexi_logger`'s usual
/// env-or-string syntax, e.g. `"info"` or `"warn,nanort::sched=debug"`.
/// Returns the handle that must be kept alive for the duration of the
/// process; dropping it stops logging.
pub fn init(spec: &str) -> Result<LoggerHandle, flexi_logger::FlexiLoggerError> {
    Logger::try_with_str(spec)?.start()
}

/// Convenience wrapper for binaries that just want `RUST_LOG`-style
/// behaviour with an `info` default.
pub fn init_default() -> Result<LoggerHandle, flexi_logger::FlexiLoggerError> {
    init("info")
}
