//! Verified pure functions for the Kestrel VMM.
//!
//! This module contains pure, deterministic functions extracted from the
//! imperative shell.  Each sub-module corresponds to a domain and contains
//! only functions with **no I/O, no system calls, and no external state
//! mutation**.

pub mod memory;
