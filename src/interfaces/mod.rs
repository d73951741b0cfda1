//! Operator-facing output formats.

pub mod csv;
