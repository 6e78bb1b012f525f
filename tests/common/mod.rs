// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::lpel::LpelConfig;
use ::std::fs;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// A configuration with `num_workers` workers sharing one core and no
/// pinning, valid on any machine.
#[allow(unused)]
pub fn config(num_workers: usize) -> LpelConfig {
    LpelConfig::new(num_workers, 1, 0)
}

/// Reads the trace file of worker `wid` for the given monitor prefix.
#[allow(unused)]
pub fn read_trace(prefix: &str, wid: usize) -> String {
    let fname: String = trace_file(prefix, wid);
    match fs::read_to_string(&fname) {
        Ok(contents) => contents,
        Err(e) => panic!("cannot read trace file {:?}: {:?}", fname, e),
    }
}

/// Removes the trace files of workers `0..num_workers`.
#[allow(unused)]
pub fn remove_traces(prefix: &str, num_workers: usize) {
    for wid in 0..num_workers {
        let _ = fs::remove_file(trace_file(prefix, wid));
    }
}

/// Builds the trace-file name the monitor module uses.
#[allow(unused)]
fn trace_file(prefix: &str, wid: usize) -> String {
    format!("{}worker{:02}.log", prefix, wid)
}
