#![doc = include_str!("../README.md")]

pub mod bits;
pub mod buffer;
pub mod channel;
pub mod conn;
pub mod packet;
pub mod replay;
pub mod seq;
pub mod stream;
pub mod sync;
