#![no_std]

pub mod klog;

pub use klog::{
    KlogBackend, KlogLevel, klog_dropped_lines, klog_get_level, klog_init, klog_is_enabled,
    klog_register_backend, klog_set_level,
};
