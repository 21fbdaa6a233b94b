// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The transports every protocol adapter ultimately rides on: TCP, UDP and
//! IPC (Unix domain) sockets, plus Happy Eyeballs dialing across both IP
//! families.

pub mod happy_eyeballs;
pub mod io_source;
pub mod ipc;
pub mod tcp;
pub mod udp;
