pub mod capture;
pub mod events;
pub mod support;
pub mod vm;
pub mod vmcs;
pub mod vmerror;
pub mod vmexit;
