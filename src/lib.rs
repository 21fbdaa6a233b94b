// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A structured-concurrency runtime for network services: cooperative tasks
//! with cancellation, typed rendezvous channels with a `choose` operator,
//! and a composable stack of socket adapters over TCP, UDP and IPC
//! transports.

pub mod bundle;
pub mod chan;
pub mod fail;
pub mod handle;
pub mod logctx;
pub mod poll;
pub mod proto;
pub mod resolve;
pub mod sched;
pub mod sock;
pub mod timer;
pub mod transport;

mod libos;

pub use bundle::Bundle;
pub use chan::Channel;
pub use fail::Fail;
pub use libos::{LibOs, LibOsOptions};
pub use sched::{go, Scheduler};
