//! # libics: core of the ICS CSI driver
//!
//! `libics` adapts the ICS hypervisor management platform's REST API to the
//! Kubernetes volume lifecycle. Its center is node discovery: mapping a
//! Kubernetes node to the virtual machine behind it, searched concurrently
//! across every datacenter of every registered management plane
//! ("virtual center"). Volume commands are asynchronous on the management
//! plane and are confirmed by polling the remote task.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`error`] | [`IcsError`] enum covering all failure modes. |
//! | [`rest`] | [`ManagementApi`] / [`Connector`] traits and the reqwest session client. |
//! | [`task`] | [`TaskPoller`]: remote task polling with backoff and a deadline. |
//! | [`vcenter`] | [`VirtualCenterRegistry`] and per-host connection handles. |
//! | [`datacenter`] | [`Datacenter`] handles and the async datacenter enumerator. |
//! | [`vm`] | [`VirtualMachine`] snapshots and renewal. |
//! | [`resolver`] | [`VmResolver`]: worker-pool VM search, first match wins. |
//! | [`node_registry`] | [`NodeRegistry`]: node name → UUID → VM cache. |
//! | [`kubernetes`] | Node UUID lookup from the Kubernetes API. |
//! | [`volume`] | [`VolumeManager`]: create/delete/expand/attach/detach. |
//! | [`types`] | CSI data model. |
//! | [`identity`] / [`controller`] | CSI service traits. |
//! | [`backend`] | [`IcsBackend`], the CSI services over the modules above. |
//! | [`config`] | YAML driver configuration. |
//! | [`sim`] | In-memory simulated management plane. |

pub mod backend;
pub mod config;
pub mod controller;
pub mod datacenter;
pub mod error;
pub mod identity;
pub mod kubernetes;
pub mod node_registry;
pub mod resolver;
pub mod rest;
pub mod sim;
pub mod task;
pub mod types;
pub mod vcenter;
pub mod vm;
pub mod volume;

pub use backend::ics::IcsBackend;
pub use config::DriverConfig;
pub use controller::CsiController;
pub use datacenter::{Datacenter, DatacenterStream, enumerate_datacenters};
pub use error::IcsError;
pub use identity::CsiIdentity;
pub use kubernetes::{KubeNodeUuidSource, NodeUuidSource};
pub use node_registry::NodeRegistry;
pub use resolver::VmResolver;
pub use rest::client::{RestClient, RestConnector};
pub use rest::{Connector, ManagementApi};
pub use task::{Task, TaskOutcome, TaskPoller, TaskState};
pub use types::*;
pub use vcenter::{VirtualCenter, VirtualCenterConfig, VirtualCenterRegistry};
pub use vm::VirtualMachine;
pub use volume::{VolumeManager, VolumeSpec};
