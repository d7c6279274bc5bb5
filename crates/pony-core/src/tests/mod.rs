//! Test module for pony-core
//!
//! This module contains tests for:
//! - Configuration loading, defaults and role validation
//! - The daemon loop: lifecycle, dispatch over real sockets, ticks, cleanup

mod daemon_tests;
