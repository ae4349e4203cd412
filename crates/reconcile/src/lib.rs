//! dpsync reconcile: dependency-gated add/delete/modify driven by descriptors.
//!
//! One [`Reconciler`] per object type. It owns the type's descriptor and its
//! name/index registry; other reconcilers see its realized set only through
//! a [`RealizedState`] source.

#![forbid(unsafe_code)]

mod reconciler;
mod resolver;

pub use reconciler::{CascadePolicy, Reconciler, Resolution};
pub use resolver::{DependencyResolver, PrefixSource, Readiness, RealizedState};
