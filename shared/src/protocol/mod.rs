//! Persistence format definitions
//!
//! This module defines the binary envelope written by the disk buffer and read
//! back by the drain.

pub mod wire;
