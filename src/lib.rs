//! vigil - triggered clip capture and on-demand WebRTC attachment
//!
//! A long-running media graph feeds per-source lookback buffers. A trigger
//! splices a recording sub-graph into the live graph so the clip starts a
//! few seconds before the trigger; a signaling session splices a WebRTC
//! sub-graph onto the distribution point. Both are removed again without
//! interrupting the rest of the graph.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod recorder;
pub mod state;
pub mod utils;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
