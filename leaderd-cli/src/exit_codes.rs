//! Process exit codes.

/// Clean shutdown.
pub const EXIT_SUCCESS: i32 = 0;

/// Invalid flags, client or election setup failure, or a fatal serving error.
pub const EXIT_ERROR: i32 = 1;
