// SPDX-License-Identifier: MIT

#![doc = include_str!("../README.md")]

#[doc(hidden)]
pub mod cli;
pub mod config;
pub mod error;
pub mod service;
pub mod signer;
pub mod staging;
pub mod validate;

#[doc(hidden)]
pub use service::listen;
