//! Compile-time configuration defaults
//!
//! Generated by `build.rs`; set `WEFT_CONFIG_RS` at build time to override.

include!(concat!(env!("OUT_DIR"), "/weft_merged_config.rs"));
