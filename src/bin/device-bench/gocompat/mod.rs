//! Command line handling compatible with Go's "flag" package, so that
//! existing invocations of the Go tooling keep working.

pub mod flags;
pub mod strconv;
