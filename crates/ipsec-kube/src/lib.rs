//! IPsec Kube - live cluster backend for the rollout engine
//!
//! Implements every collaborator trait of `ipsec-core` on top of the
//! Kubernetes API:
//! - network operator record reads and version-guarded merge patches
//! - machine-config pool, cluster operator and daemon set status
//! - probe pod launch, exec and removal
//! - nmstate policy and machine-config extension objects
//!
//! # Example
//!
//! ```rust,ignore
//! use ipsec_core::{ClusterHandles, RolloutConfig, RolloutCoordinator};
//! use ipsec_kube::KubeBackend;
//! use std::sync::Arc;
//!
//! let config = RolloutConfig::load("rollout.toml")?;
//! let backend = KubeBackend::try_default().await?.with_fleet_settings(config.fleet.clone());
//! let coordinator = RolloutCoordinator::new(ClusterHandles::from_backend(Arc::new(backend)), config);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod client;
pub mod manifests;
pub mod parse;

pub use client::{classify, KubeBackend, DEFAULT_CAPTURE_IMAGE, DEFAULT_NAMESPACE};
pub use parse::ParseError;
