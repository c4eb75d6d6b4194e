//! VM-exit handling core of an Intel VT-x hypervisor.
//!
//! Provides ordered handler chains for control register accesses and
//! external interrupts, the per-vCPU exit routing that feeds them, and the
//! serial logger used while the hypervisor runs.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod intel;
pub mod logger;
pub mod vmm;
