//! Function spec model for lambdafy.
//!
//! A spec is a YAML document describing a function: the image to run, the
//! role to run it as, resources, triggers and networking. Specs are loaded
//! once, validated and normalized up front, and treated as immutable by the
//! rest of the system.

pub mod error;
mod spec;

pub use error::{Result, SpecError};
pub use spec::{Cors, EfsMount, RolePolicy, Spec, SqsTrigger, ROLE_GENERATE};
