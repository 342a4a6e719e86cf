#![warn(clippy::pedantic)]

pub mod compressor;
pub mod config;
pub mod debouncer;
pub mod document;
pub mod id;
pub mod jobs;
pub mod owner_loop;
pub mod scheduler;
pub mod scratch;
pub mod stroke;
pub mod util;
pub mod wait_broker;

use id::FuzzID;
