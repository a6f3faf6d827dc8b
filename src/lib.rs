//! Pull container images into content-addressed snapshots, without root
//!
//! A [Puller] turns an image reference into a mounted, copy-on-write
//! snapshot served by an unprivileged user-space backend. Layers are stored
//! once by digest and layer chains are shared between images.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("rootless-pull only works on linux or android");

#[macro_use] extern crate lazy_static;
#[macro_use] extern crate serde;

pub mod cache;
pub mod config;
pub mod errors;
pub mod image;
pub mod manifest;
pub mod metadata;
pub mod pull;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod source;
pub mod storage;

pub use crate::{
    config::{Config, ConfigBuilder},
    image::ImageName,
    pull::{PullOutcome, Puller},
    session::{Session, ShutdownTrigger},
};
