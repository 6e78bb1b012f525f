// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Diagnostic logging for the runtime. This backs the `log` facade macros
//! used by the scheduler, the stream layer, and the monitor module. It is
//! a separate channel from the monitoring sidecar: trace files record
//! dispatches on the hot path, the logger reports runtime diagnostics
//! (failed pinning, dropped trace files, worker lifecycle).

//======================================================================================================================
// Imports
//======================================================================================================================

use ::flexi_logger::Logger;
use ::std::sync::Once;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Ensures the logger is installed at most once, however many runtimes a
/// process initialises.
static INIT_LOG: Once = Once::new();

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Installs the process-wide logger, with the level filter taken from the
/// RUST_LOG environment variable. Every [crate::runtime::Lpel::init] calls
/// this; only the first call in the process takes effect.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        Logger::try_with_env().unwrap().start().unwrap();
    });
}
