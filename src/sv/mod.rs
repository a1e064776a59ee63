pub mod activation;
pub mod license;

pub use activation::Activation;
pub use license::License;
