#![doc = include_str!("../README.md")]

mod error;

pub mod calibration;
pub mod dataset;
pub mod decom;
pub mod pipeline;
pub mod spacepacket;
pub mod timecode;

pub use error::{Error, Result};
