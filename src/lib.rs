#![doc = include_str!("../README.md")]

pub mod app;
pub mod component;
pub mod firestore;
pub mod platform;
pub mod util;

#[cfg(test)]
pub mod test_support;
