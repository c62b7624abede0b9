//! Gradient utilities for training neural networks: minibatch gradient
//! accumulation, multi-device averaging, gradient clipping and declarative
//! layer recording, on top of a small scalar autograd engine.

pub mod backprop_fns;
pub mod dataloader;
pub mod datasets;
pub mod graph;
pub mod init;
pub mod layers;
pub mod loss;
pub mod ops;
pub mod optim;
pub mod tensor;
pub mod values;
