//! Process exit codes. Kept as a standalone module since these get referenced from
//! more than one subcommand's error path and from `main`'s argument-parse failure.

pub const OK: i32 = 0;
pub const ERR_GENERIC: i32 = 1;
pub const ERR_USAGE: i32 = 2;
pub const ERR_STARTUP: i32 = 3;
