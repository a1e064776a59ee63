//! Signed software licenses: issuing, packing, validating, and tracking
//! seats of floating and concurrent licenses against a central server.

pub mod api;
pub mod clock;
pub mod codec;
pub mod crypto;
pub mod device;
pub mod entity;
pub mod error;
pub mod generator;
pub mod model;
pub mod plugins;
pub mod prelude;
pub mod secrets;
pub mod session;
pub mod state;
pub mod sv;
pub mod validator;

pub use error::{Error, Result};
