// API处理器模块

pub mod jobs;

pub use jobs::*;
