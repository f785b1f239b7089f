//! Trainable building blocks shared by the MoE layer.

pub mod activation;
pub mod init;
pub mod linear;
pub mod module;

pub use activation::Activation;
pub use init::{InitType, init_tensor};
pub use linear::Linear;
pub use module::{Module, Parameter};
