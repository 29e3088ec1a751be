//! Obtaining an FHE instance for a network, from either the relayer SDK or a local
//! mock, as a cancellable state machine.
pub mod controller;
pub mod create;

pub use controller::{FhevmGoState, InstanceLifecycleController, LifecycleStatus};
pub use create::{create_fhevm_instance, CreateInstanceParams, InstanceBackends};
