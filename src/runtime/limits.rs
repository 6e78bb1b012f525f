// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Default stack size attribute for tasks that do not request one.
/// Coroutines are stackless, so this is recorded on the control block only.
pub const DEFAULT_STACK_SIZE: usize = 8192;

/// Maximum length for a task name in monitor records.
pub const TASK_NAME_MAX: usize = 31;

/// Maximum length for the monitor trace-file prefix and postfix.
pub const MON_FIX_MAX: usize = 16;
