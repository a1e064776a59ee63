pub mod activation;
pub mod license;

pub use crate::model::{ActivationMode, LicenseStatus, LicenseType};
