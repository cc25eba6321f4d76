#![doc = include_str!("../README.md")]

mod channel;
mod error;
mod manager;
mod message;

pub use {channel::*, error::*, manager::*, message::*};
