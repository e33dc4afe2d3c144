//! Support code for the `usb-detect` command line tool

pub mod config;
pub mod output;
