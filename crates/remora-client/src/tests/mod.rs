//! Tests for the remora-client crate.

mod helpers;
