//! Error number constants.
//!
//! Fallible library operations return `Result<T, i32>` carrying one of
//! these values.

/// Invalid argument.
pub const EINVAL: i32 = 22;

/// Entity already exists (per-CPU worker slot already occupied).
pub const EEXIST: i32 = 17;

/// Out of memory (auxiliary table unavailable).
pub const ENOMEM: i32 = 12;

/// Operation would block / try again.
pub const EAGAIN: i32 = 11;

/// Interrupted system call.
pub const EINTR: i32 = 4;

/// Timer expired.
pub const ETIMEDOUT: i32 = 110;
