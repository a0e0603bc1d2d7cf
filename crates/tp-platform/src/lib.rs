// SPDX-License-Identifier: MIT OR Apache-2.0
//! Facade crate bundling the Terraplane platform components.
//!
//! Re-exports the public surface of the platform crates so embedded
//! deployments and plugins can depend on one crate.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use tp_broker as broker;
pub use tp_config as config;
pub use tp_core as core;
pub use tp_error as error;
pub use tp_object_store as object_store;
pub use tp_sender as sender;
pub use tp_store as store;
pub use tp_worker as worker;
