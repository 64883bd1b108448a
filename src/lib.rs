pub mod association;
pub mod calibration;
pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod pose;
pub mod postprocess;
pub mod sync;
pub mod triangulation;
